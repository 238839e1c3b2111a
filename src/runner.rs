//! Test execution: standalone endpoints and scenario state machines.

use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::auth;
use crate::context::ScenarioContext;
use crate::data::{merge_record, record_label};
use crate::definition::{Endpoint, Suite};
use crate::error::{Error, Result};
use crate::executor::{HttpExecutor, RequestParts, WssExecutor};
use crate::model::{
    EndpointResult, Failure, Protocol, Scenario, ScenarioResult, ScenarioStep, StepPhase,
    StepResult, SuiteReport,
};
use crate::retry::{Sleeper, TokioSleeper};
use crate::validator::lookup_path;

/// Test runner trait
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Execute one endpoint on its own, without scenario context.
    async fn run_endpoint(&self, endpoint: &Endpoint) -> EndpointResult;

    /// Execute a scenario from setup through teardown.
    async fn run_scenario(&self, scenario: &Scenario) -> ScenarioResult;
}

/// Which parts of a suite to run.
#[derive(Debug, Clone)]
pub struct RunFilter {
    /// Only endpoints and scenarios carrying this tag.
    pub tag: Option<String>,
    /// Only scenarios whose name contains this text.
    pub scenario: Option<String>,
    pub endpoints: bool,
    pub scenarios: bool,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            tag: None,
            scenario: None,
            endpoints: true,
            scenarios: true,
        }
    }
}

impl RunFilter {
    fn wants_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.endpoints
            && self
                .tag
                .as_ref()
                .is_none_or(|tag| endpoint.def.tags.contains(tag))
    }

    fn wants_scenario(&self, scenario: &Scenario) -> bool {
        self.scenarios
            && self
                .tag
                .as_ref()
                .is_none_or(|tag| scenario.tags.contains(tag))
            && self
                .scenario
                .as_ref()
                .is_none_or(|name| scenario.name.contains(name.as_str()))
    }
}

/// Scenario lifecycle. Every entered scenario reaches `Done` through
/// `RunningTeardown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    RunningSetup,
    RunningSteps,
    RunningTeardown,
    Done,
}

/// Runs one compiled suite with its resolved auth.
pub struct SuiteRunner {
    suite: Suite,
    http: HttpExecutor,
    wss: WssExecutor,
    sleeper: Arc<dyn Sleeper>,
    test_data: Vec<Value>,
}

impl SuiteRunner {
    /// Resolve auth (one login request for `login`) and build executors.
    /// Fails when auth cannot be resolved; no test request is sent then.
    #[instrument(skip_all, fields(suite = %suite.name))]
    pub async fn prepare(suite: Suite) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        let auth = auth::resolve(
            suite.auth.as_ref(),
            &client,
            &suite.base_url,
            &suite.default_headers,
        )
        .await?;
        let http = HttpExecutor::with_client(
            client,
            suite.base_url.clone(),
            suite.default_headers.clone(),
            auth.clone(),
        )?;
        let wss = WssExecutor::new(
            suite.base_url.clone(),
            suite.default_headers.clone(),
            auth,
        );
        Ok(Self {
            suite,
            http,
            wss,
            sleeper: Arc::new(TokioSleeper),
            test_data: Vec::new(),
        })
    }

    /// Replace the sleeper used between retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Records for data-driven runs of endpoints that send a body.
    pub fn with_test_data(mut self, records: Vec<Value>) -> Self {
        self.test_data = records;
        self
    }

    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    /// Run everything `filter` selects: standalone endpoints first, then
    /// scenarios, all sequentially.
    #[instrument(skip_all, fields(suite = %self.suite.name))]
    pub async fn run_all(&self, filter: &RunFilter) -> SuiteReport {
        let start = Instant::now();
        let timestamp = Local::now().to_rfc3339();
        let mut endpoints = Vec::new();
        let mut scenarios = Vec::new();

        for endpoint in self.suite.endpoints() {
            if !filter.wants_endpoint(endpoint) {
                continue;
            }
            if !self.test_data.is_empty() && endpoint.def.body.is_some() {
                endpoints.extend(self.run_endpoint_with_data(endpoint, &self.test_data).await);
            } else {
                endpoints.push(self.run_endpoint(endpoint).await);
            }
        }
        for scenario in self.suite.scenarios() {
            if filter.wants_scenario(scenario) {
                scenarios.push(self.run_scenario(scenario).await);
            }
        }

        let report = SuiteReport {
            suite: self.suite.name.clone(),
            timestamp,
            endpoints,
            scenarios,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Suite finished: {} ({} ms) - Success: {}",
            report.suite,
            report.duration_ms,
            report.passed()
        );
        report
    }

    /// One run per record, the record merged over the endpoint body.
    pub async fn run_endpoint_with_data(
        &self,
        endpoint: &Endpoint,
        records: &[Value],
    ) -> Vec<EndpointResult> {
        let mut results = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let mut parts = RequestParts::from_endpoint(&endpoint.def);
            parts.body = Some(merge_record(parts.body.as_ref(), record));
            let mut result = self.execute_or_fail(endpoint, parts).await;
            result.name = format!("{}[{}]", result.name, record_label(record, index));
            results.push(result);
        }
        results
    }

    async fn execute(&self, endpoint: &Endpoint, parts: RequestParts) -> Result<EndpointResult> {
        let sleeper = self.sleeper.as_ref();
        match endpoint.def.protocol {
            Protocol::Http => self.http.execute(endpoint, parts, sleeper).await,
            Protocol::Wss => self.wss.execute(endpoint, parts, sleeper).await,
        }
    }

    async fn execute_or_fail(&self, endpoint: &Endpoint, parts: RequestParts) -> EndpointResult {
        match self.execute(endpoint, parts).await {
            Ok(result) => result,
            Err(e) => {
                warn!(endpoint = %endpoint.name(), "not executed: {e}");
                not_executed(endpoint, &e)
            }
        }
    }

    /// Run one phase's steps in order. Returns whether all of them passed.
    /// With `stop_on_failure`, the first failing step ends the phase.
    async fn run_phase(
        &self,
        phase: StepPhase,
        steps: &[ScenarioStep],
        ctx: &mut ScenarioContext,
        results: &mut Vec<StepResult>,
        stop_on_failure: bool,
    ) -> bool {
        let mut all_passed = true;
        for (index, step) in steps.iter().enumerate() {
            info!(
                "Running {} {}/{}: {}",
                phase,
                index + 1,
                steps.len(),
                step.name
            );
            let result = self.run_step(phase, step, ctx).await;
            let failed = !result.passed;
            results.push(result);
            if failed {
                all_passed = false;
                if stop_on_failure {
                    info!("Stopping {} due to step failure", phase);
                    break;
                }
            }
        }
        all_passed
    }

    async fn run_step(
        &self,
        phase: StepPhase,
        step: &ScenarioStep,
        ctx: &mut ScenarioContext,
    ) -> StepResult {
        let mut result = StepResult {
            phase,
            name: step.name.clone(),
            endpoint: step.endpoint_ref.clone(),
            passed: false,
            endpoint_result: None,
            failures: Vec::new(),
        };

        let Some(endpoint) = self.suite.endpoint(&step.endpoint_ref) else {
            let err = Error::UnknownEndpoint {
                step: step.name.clone(),
                endpoint: step.endpoint_ref.clone(),
            };
            result.failures.push(Failure::Configuration {
                message: err.to_string(),
            });
            return result;
        };

        let parts = RequestParts::from_endpoint(&endpoint.def)
            .with_overrides(
                step.override_body.as_ref(),
                &step.override_params,
                &step.override_headers,
            )
            .resolve(ctx);
        let parts = match parts {
            Ok(parts) => parts,
            Err(e) => {
                warn!(step = %step.name, "{e}");
                result.failures.push(Failure::Configuration {
                    message: e.to_string(),
                });
                return result;
            }
        };

        let executed = match self.execute(endpoint, parts).await {
            Ok(executed) => executed,
            Err(e) => {
                warn!(step = %step.name, "{e}");
                result.failures.push(Failure::Configuration {
                    message: e.to_string(),
                });
                return result;
            }
        };

        if executed.passed {
            for (variable, path) in &step.save {
                match executed.response.as_ref().and_then(|r| lookup_path(r, path)) {
                    Some(value) => ctx.save(variable.clone(), value.clone()),
                    None => result.failures.push(Failure::Extraction {
                        variable: variable.clone(),
                        path: path.clone(),
                    }),
                }
            }
        }

        result.passed = executed.passed && result.failures.is_empty();
        result.endpoint_result = Some(executed);
        result
    }
}

#[async_trait]
impl TestRunner for SuiteRunner {
    #[instrument(skip_all, fields(endpoint = %endpoint.name()))]
    async fn run_endpoint(&self, endpoint: &Endpoint) -> EndpointResult {
        // Standalone runs have no context, so `{var}` tokens go out verbatim.
        let parts = RequestParts::from_endpoint(&endpoint.def);
        self.execute_or_fail(endpoint, parts).await
    }

    #[instrument(skip_all, fields(name = %scenario.name))]
    async fn run_scenario(&self, scenario: &Scenario) -> ScenarioResult {
        let start = Instant::now();
        let mut ctx = ScenarioContext::new();
        let mut steps = Vec::new();
        let mut passed = true;

        info!("Starting test scenario: {}", scenario.name);

        let mut phase = Phase::Idle;
        loop {
            let next = match phase {
                Phase::Idle => Phase::RunningSetup,
                Phase::RunningSetup => {
                    let ok = self
                        .run_phase(StepPhase::Setup, &scenario.setup, &mut ctx, &mut steps, true)
                        .await;
                    if ok {
                        Phase::RunningSteps
                    } else {
                        passed = false;
                        Phase::RunningTeardown
                    }
                }
                Phase::RunningSteps => {
                    let ok = self
                        .run_phase(StepPhase::Step, &scenario.steps, &mut ctx, &mut steps, true)
                        .await;
                    passed &= ok;
                    Phase::RunningTeardown
                }
                Phase::RunningTeardown => {
                    // Teardown failures are reported on their steps but do
                    // not change the scenario outcome.
                    self.run_phase(
                        StepPhase::Teardown,
                        &scenario.teardown,
                        &mut ctx,
                        &mut steps,
                        false,
                    )
                    .await;
                    Phase::Done
                }
                Phase::Done => break,
            };
            debug!(from = ?phase, to = ?next, "scenario transition");
            phase = next;
        }

        let result = ScenarioResult {
            name: scenario.name.clone(),
            tags: scenario.tags.clone(),
            passed,
            steps,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Test scenario finished: {} ({} ms) - Success: {}",
            scenario.name, result.duration_ms, result.passed
        );
        result
    }
}

/// Result for an endpoint that failed before any request was sent.
fn not_executed(endpoint: &Endpoint, err: &Error) -> EndpointResult {
    EndpointResult {
        name: endpoint.def.name.clone(),
        protocol: endpoint.def.protocol,
        tags: endpoint.def.tags.clone(),
        passed: false,
        status: None,
        elapsed_ms: 0,
        attempts: 0,
        failures: vec![Failure::Configuration {
            message: err.to_string(),
        }],
        response: None,
        messages: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DefinitionFile;
    use crate::retry::tests::RecordingSleeper;

    // Port 1 is never listening, so requests fail fast with a transport error.
    const SUITE: &str = r#"
name: offline
base_url: http://127.0.0.1:1
endpoints:
  - name: get_order
    method: GET
    url: /orders/{order_id}
    tags: [get_order]
  - name: cleanup
    method: DELETE
    url: /orders
    tags: [cleanup, teardown]
scenarios:
  - name: orders
    tags: [smoke]
    setup:
      - name: needs missing var
        endpoint_ref: get_order
    steps:
      - name: never runs
        endpoint_ref: get_order
    teardown:
      - name: first cleanup
        endpoint_ref: cleanup
      - name: second cleanup
        endpoint_ref: cleanup
"#;

    async fn runner() -> SuiteRunner {
        let file: DefinitionFile = serde_yaml::from_str(SUITE).unwrap();
        SuiteRunner::prepare(Suite::build(file).unwrap())
            .await
            .unwrap()
            .with_sleeper(Arc::new(RecordingSleeper::default()))
    }

    #[tokio::test]
    async fn setup_failure_skips_steps_and_runs_all_teardown() {
        let runner = runner().await;
        let scenario = &runner.suite().scenarios()[0];
        let result = runner.run_scenario(scenario).await;

        assert!(!result.passed);
        let phases: Vec<_> = result.steps.iter().map(|s| (s.phase, s.name.as_str())).collect();
        assert_eq!(
            phases,
            vec![
                (StepPhase::Setup, "needs missing var"),
                (StepPhase::Teardown, "first cleanup"),
                (StepPhase::Teardown, "second cleanup"),
            ]
        );

        let setup = &result.steps[0];
        assert!(setup.endpoint_result.is_none());
        assert!(matches!(
            &setup.failures[0],
            Failure::Configuration { message } if message.contains("{order_id}")
        ));

        // Both teardown steps ran even though the first failed.
        for step in &result.steps[1..] {
            assert!(!step.passed);
            let executed = step.endpoint_result.as_ref().unwrap();
            assert!(matches!(executed.failures[0], Failure::Transport { .. }));
        }
    }

    #[tokio::test]
    async fn standalone_endpoint_sends_tokens_verbatim() {
        let runner = runner().await;
        let endpoint = runner.suite().endpoint("get_order").unwrap();
        let result = runner.run_endpoint(endpoint).await;

        // No context: the request is attempted and fails on transport, not
        // on variable resolution.
        assert_eq!(result.attempts, 1);
        assert!(matches!(result.failures[0], Failure::Transport { .. }));
    }

    #[tokio::test]
    async fn filter_selects_by_tag_and_scenario_name() {
        let runner = runner().await;
        let suite = runner.suite();
        let cleanup = suite.endpoint("cleanup").unwrap();
        let get_order = suite.endpoint("get_order").unwrap();
        let orders = &suite.scenarios()[0];

        let by_tag = RunFilter {
            tag: Some("teardown".into()),
            ..RunFilter::default()
        };
        assert!(by_tag.wants_endpoint(cleanup));
        assert!(!by_tag.wants_endpoint(get_order));
        assert!(!by_tag.wants_scenario(orders));

        let by_name = RunFilter {
            scenario: Some("ord".into()),
            endpoints: false,
            ..RunFilter::default()
        };
        assert!(by_name.wants_scenario(orders));
        assert!(!by_name.wants_endpoint(cleanup));
    }
}
