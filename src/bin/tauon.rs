//! Tauon CLI - declarative API test execution tool.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Instant;
use tauon::data::DataLoader;
use tauon::{
    DefinitionFile, DefinitionLoader, EndpointResult, RunFilter, ScenarioResult, Suite,
    SuiteReport, SuiteRunner,
};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Tauon - YAML-based HTTP/WebSocket API test execution tool.
#[derive(Parser, Debug)]
#[command(name = "tauon", version, about)]
struct Cli {
    /// Definition file or directory path.
    #[arg(short = 'p', long = "path", default_value = "api_definitions")]
    path: PathBuf,

    /// Only run endpoints and scenarios carrying this tag.
    #[arg(short = 't', long = "tag")]
    tag: Option<String>,

    /// Only run scenarios whose name contains this text.
    #[arg(short = 's', long = "scenario")]
    scenario: Option<String>,

    /// Run standalone endpoint tests only.
    #[arg(long = "endpoints-only", conflicts_with = "scenarios_only")]
    endpoints_only: bool,

    /// Run scenarios only.
    #[arg(long = "scenarios-only")]
    scenarios_only: bool,

    /// Base URL override for all definition files.
    #[arg(short = 'b', long = "base-url", env = "TAUON_BASE_URL")]
    base_url: Option<String>,

    /// Directory holding test data files.
    #[arg(short = 'd', long = "data-dir", env = "TAUON_DATA_DIR", default_value = "test_data")]
    data_dir: PathBuf,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn status_label(passed: bool) -> &'static str {
    if passed {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    }
}

fn print_endpoint_result(result: &EndpointResult, verbose: bool) {
    let status = result
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(
        "{} endpoint: {} [{}] ({} ms, {} attempt(s))",
        status_label(result.passed),
        result.name,
        status,
        result.elapsed_ms,
        result.attempts
    );
    for failure in &result.failures {
        error!("     \x1b[31m{}\x1b[0m", failure);
    }
    if verbose {
        if let Some(body) = &result.response {
            let body = body.to_string();
            let truncated = if body.len() > 500 {
                let cut = (0..=500).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
                format!("{}...(truncated)", &body[..cut])
            } else {
                body
            };
            debug!("     Response body: {}", truncated);
        }
        for message in &result.messages {
            debug!(
                "     {} sent={:?} received={:?} passed={}",
                message.action, message.sent, message.received, message.passed
            );
        }
    }
}

fn print_scenario_result(result: &ScenarioResult, verbose: bool) {
    info!(
        "{} scenario: {} ({} ms)",
        status_label(result.passed),
        result.name,
        result.duration_ms
    );

    for (i, step) in result.steps.iter().enumerate() {
        let step_status = if step.passed {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        info!(
            "  {}. {} [{}] {} -> {}",
            i + 1,
            step_status,
            step.phase,
            step.name,
            step.endpoint
        );
        for failure in &step.failures {
            error!("     \x1b[31mError: {}\x1b[0m", failure);
        }
        if let Some(executed) = &step.endpoint_result {
            for failure in &executed.failures {
                error!("     \x1b[31mError: {}\x1b[0m", failure);
            }
            if verbose {
                debug!(
                    "     Status {:?}, {} ms, {} attempt(s)",
                    executed.status, executed.elapsed_ms, executed.attempts
                );
            }
        }
    }
}

fn save_report(report: &SuiteReport, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = report.suite.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(report)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(report)?,
        ),
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn load_definitions(path: &Path) -> Result<Vec<DefinitionFile>> {
    if !path.exists() {
        return Err(anyhow!("Path does not exist: {}", path.display()));
    }

    let mut loader = DefinitionLoader::new();
    loader.add_path(path);
    let definitions = loader
        .load_all()
        .with_context(|| format!("Failed to load definitions from {}", path.display()))?;

    if definitions.is_empty() {
        return Err(anyhow!("No definition files found in {}", path.display()));
    }
    Ok(definitions)
}

async fn run_suite(
    file: DefinitionFile,
    args: &Cli,
    filter: &RunFilter,
    data: &mut DataLoader,
) -> Result<SuiteReport> {
    let name = file.name.clone();
    let mut suite = Suite::build(file).with_context(|| format!("Invalid definition '{name}'"))?;
    if let Some(base_url) = &args.base_url {
        suite.set_base_url(base_url.clone());
    }

    let records = match &suite.test_data_file {
        Some(data_file) => data
            .load(data_file)
            .with_context(|| format!("Failed to load test data for '{name}'"))?
            .to_vec(),
        None => Vec::new(),
    };

    let runner = SuiteRunner::prepare(suite)
        .await
        .with_context(|| format!("Failed to prepare '{name}'"))?
        .with_test_data(records);
    Ok(runner.run_all(filter).await)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let definitions = load_definitions(&args.path)?;
    let filter = RunFilter {
        tag: args.tag.clone(),
        scenario: args.scenario.clone(),
        endpoints: !args.scenarios_only,
        scenarios: !args.endpoints_only,
    };
    let mut data = DataLoader::new(&args.data_dir);

    let total_start = Instant::now();
    let mut passed = 0;
    let mut failed = 0;
    let mut success = true;

    for file in definitions {
        let name = file.name.clone();
        info!("Suite: {}", name);
        let report = match run_suite(file, &args, &filter, &mut data).await {
            Ok(report) => report,
            Err(e) => {
                error!("\x1b[31mSuite error: {} - {:#}\x1b[0m", name, e);
                success = false;
                failed += 1;
                continue;
            }
        };

        for result in &report.endpoints {
            print_endpoint_result(result, args.verbose);
        }
        for result in &report.scenarios {
            print_scenario_result(result, args.verbose);
        }

        let outcomes = report
            .endpoints
            .iter()
            .map(|e| e.passed)
            .chain(report.scenarios.iter().map(|s| s.passed));
        for ok in outcomes {
            if ok {
                passed += 1;
            } else {
                failed += 1;
            }
        }
        success &= report.passed();

        if let Some(dir) = &args.report_dir {
            match save_report(&report, dir, args.report_format) {
                Ok(path) => info!("Report saved: {}", path.display()),
                Err(e) => error!("Failed to save report: {}", e),
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    if !success {
        exit(1);
    }

    Ok(())
}
