//! Error taxonomy for definition loading and run setup.
//!
//! Transport failures, timeouts and validation mismatches are not errors
//! here: they are outcomes recorded on results (see
//! [`crate::model::Failure`]). Everything in this enum stops work before
//! (or instead of) sending a request.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("step '{step}' references unknown endpoint '{endpoint}'")]
    UnknownEndpoint { step: String, endpoint: String },

    #[error("unresolved context variable '{{{0}}}'")]
    UnresolvedVariable(String),

    #[error("environment variable '{0}' is not set and has no default")]
    MissingEnvVar(String),

    #[error("auth resolution failed: {0}")]
    AuthResolution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// `true` for the configuration family (bad definitions, unresolved
    /// references). These are never retried or defaulted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::UnknownEndpoint { .. }
                | Error::UnresolvedVariable(_)
                | Error::MissingEnvVar(_)
        )
    }
}
