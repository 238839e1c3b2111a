//! Definition file loading and suite compilation.
//!
//! Loading resolves `${VAR}` / `${VAR:-default}` environment references in
//! every string value. [`Suite::build`] then checks the definition-time
//! invariants (unique names, non-empty tags, resolvable step references) and
//! compiles every expectation tree once.

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{
    AuthConfig, DefinitionFile, EndpointDefinition, Protocol, RetryPolicy,
    Scenario, WssMessage,
};
use crate::validator::{compile_headers, Expectation, HeaderExpectation};

static ENV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(\w+)(?::-(.*?))?\}")
        .expect("failed to compile env placeholder regex")
});

/// Finds and loads definition files.
#[derive(Debug)]
pub struct DefinitionLoader {
    pub paths: Vec<PathBuf>,
}

impl DefinitionLoader {
    pub fn new() -> Self {
        Self { paths: Vec::new() }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load one `.yaml`, `.yml` or `.json` definition file.
    pub fn load_definition<P: AsRef<Path>>(&self, path: P) -> Result<DefinitionFile> {
        let path = path.as_ref();
        info!("Loading definitions from {}", path.display());

        let format = Format::from_path(path).ok_or_else(|| {
            Error::config(format!("unsupported definition format: {}", path.display()))
        })?;
        let content = fs::read_to_string(path)?;
        let file = parse_definition(&content, format, |name| std::env::var(name).ok())
            .map_err(|e| match e {
                Error::Configuration(msg) => {
                    Error::Configuration(format!("{}: {msg}", path.display()))
                }
                other => other,
            })?;

        debug!("Loaded definition file: {}", file.name);
        Ok(file)
    }

    /// Load every definition file in `dir`, sorted by file name.
    pub fn load_definitions_from_dir<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Result<Vec<DefinitionFile>> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && Format::from_path(p).is_some())
            .collect();
        files.sort();

        let definitions = files
            .iter()
            .map(|p| self.load_definition(p))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Loaded {} definition files from {}",
            definitions.len(),
            dir.display()
        );
        Ok(definitions)
    }

    /// Load from every configured path that exists. Directories are read
    /// with [`Self::load_definitions_from_dir`], files directly.
    pub fn load_all(&self) -> Result<Vec<DefinitionFile>> {
        let mut all = Vec::new();
        for path in &self.paths {
            if path.is_dir() {
                all.extend(self.load_definitions_from_dir(path)?);
            } else if path.is_file() {
                all.push(self.load_definition(path)?);
            }
        }
        Ok(all)
    }
}

impl Default for DefinitionLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Format::Yaml),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

/// Parse definition text, resolving environment references via `env`.
pub fn parse_definition<F>(content: &str, format: Format, env: F) -> Result<DefinitionFile>
where
    F: Fn(&str) -> Option<String>,
{
    let mut raw: Value = match format {
        Format::Yaml => serde_yaml::from_str(content)?,
        Format::Json => serde_json::from_str(content)?,
    };
    interpolate_env(&mut raw, &env)?;
    Ok(serde_json::from_value(raw)?)
}

/// Replace `${VAR}` and `${VAR:-default}` in every string leaf.
pub fn interpolate_env<F>(value: &mut Value, env: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = interpolate_str(s, env)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                interpolate_env(item, env)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                interpolate_env(item, env)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn interpolate_str<F>(text: &str, env: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = None;
    let resolved = ENV_RE.replace_all(text, |caps: &Captures| {
        if let Some(value) = env(&caps[1]) {
            return value;
        }
        if let Some(default) = caps.get(2) {
            return default.as_str().to_string();
        }
        missing.get_or_insert_with(|| caps[1].to_string());
        String::new()
    });
    match missing {
        Some(name) => Err(Error::MissingEnvVar(name)),
        None => Ok(resolved.into_owned()),
    }
}

/// An endpoint with its expectations compiled and retry policy settled.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub def: EndpointDefinition,
    pub body: Option<Expectation>,
    pub headers: Vec<HeaderExpectation>,
    /// Compiled `receive_json` expectations, indexed like `def.messages`.
    pub receive: Vec<Option<Expectation>>,
    /// The endpoint's own policy, else the file's, else no retries.
    pub retry: RetryPolicy,
}

impl Endpoint {
    fn compile(def: EndpointDefinition, global_retry: Option<&RetryPolicy>) -> Result<Self> {
        let context = |e: Error| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("endpoint '{}': {msg}", def.name))
            }
            other => other,
        };

        let body = def
            .expected_body
            .as_ref()
            .map(Expectation::compile)
            .transpose()
            .map_err(context)?;
        let headers = compile_headers(&def.expected_headers).map_err(context)?;
        let receive = def
            .messages
            .iter()
            .map(|m| match m {
                WssMessage::ReceiveJson {
                    expected: Some(expected),
                    ..
                } => Expectation::compile(expected).map(Some),
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>>>()
            .map_err(context)?;
        let retry = def
            .retry
            .clone()
            .or_else(|| global_retry.cloned())
            .unwrap_or_else(RetryPolicy::none);

        Ok(Self {
            def,
            body,
            headers,
            receive,
            retry,
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }
}

/// A validated, compiled definition file.
#[derive(Debug, Clone)]
pub struct Suite {
    pub name: String,
    pub base_url: String,
    pub default_headers: BTreeMap<String, String>,
    pub auth: Option<AuthConfig>,
    pub test_data_file: Option<String>,
    endpoints: Vec<Endpoint>,
    by_name: HashMap<String, usize>,
    scenarios: Vec<Scenario>,
}

impl Suite {
    pub fn build(file: DefinitionFile) -> Result<Self> {
        let DefinitionFile {
            name,
            base_url,
            default_headers,
            auth,
            retry,
            endpoints: http,
            wss_endpoints,
            scenarios,
            test_data_file,
        } = file;

        let defs = http.into_iter().chain(wss_endpoints.into_iter().map(|mut e| {
            e.protocol = Protocol::Wss;
            e
        }));

        let mut endpoints = Vec::new();
        let mut by_name = HashMap::new();
        let mut selectors = HashSet::new();
        for def in defs {
            let Some(selector) = def.selector() else {
                return Err(Error::config(format!(
                    "endpoint '{}' has no tags",
                    def.name
                )));
            };
            if !selectors.insert(selector.to_string()) {
                return Err(Error::config(format!(
                    "endpoint '{}' reuses selector tag '{selector}'",
                    def.name
                )));
            }
            if by_name.insert(def.name.clone(), endpoints.len()).is_some() {
                return Err(Error::config(format!(
                    "duplicate endpoint name '{}'",
                    def.name
                )));
            }
            endpoints.push(Endpoint::compile(def, retry.as_ref())?);
        }

        for scenario in &scenarios {
            for step in scenario
                .setup
                .iter()
                .chain(&scenario.steps)
                .chain(&scenario.teardown)
            {
                if !by_name.contains_key(&step.endpoint_ref) {
                    return Err(Error::UnknownEndpoint {
                        step: format!("{}/{}", scenario.name, step.name),
                        endpoint: step.endpoint_ref.clone(),
                    });
                }
            }
        }

        debug!(
            suite = %name,
            endpoints = endpoints.len(),
            scenarios = scenarios.len(),
            "suite compiled"
        );
        Ok(Self {
            name,
            base_url,
            default_headers,
            auth,
            test_data_file,
            endpoints,
            by_name,
            scenarios,
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.by_name.get(name).map(|&i| &self.endpoints[i])
    }

    /// The endpoint whose first tag is `selector`.
    pub fn endpoint_by_selector(&self, selector: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.def.selector() == Some(selector))
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn scenario(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    /// Replace the base URL, e.g. from a command-line override.
    pub fn set_base_url(&mut self, base_url: impl Into<String>) {
        self.base_url = base_url.into();
    }
}
