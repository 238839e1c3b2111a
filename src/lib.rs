//! Declarative HTTP/WebSocket API testing.
//!
//! Endpoints and multi-step scenarios are described in YAML or JSON
//! definition files. [`definition::DefinitionLoader`] reads them,
//! [`definition::Suite`] compiles them, and [`runner::SuiteRunner`] executes
//! them with retry, auth and response validation applied uniformly.

pub mod auth;
pub mod context;
pub mod data;
pub mod definition;
pub mod error;
pub mod executor;
pub mod model;
pub mod retry;
pub mod runner;
pub mod validator;

pub use definition::{DefinitionLoader, Endpoint, Suite};
pub use error::{Error, Result};
pub use model::*;
pub use runner::{RunFilter, SuiteRunner, TestRunner};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
