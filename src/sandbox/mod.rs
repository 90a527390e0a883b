//! Sandboxed script execution.
//!
//! One request flows through four stages:
//! - [`binder`] turns it into a program and a namespace
//! - [`capabilities`] builds the builtins for that request only
//! - [`supervisor`] runs the program on a worker against a deadline
//! - [`outcome`] reduces whatever happened into an [`ExecutionResponse`]
//!
//! Outbound HTTP made by scripts goes through [`network`].

pub mod binder;
pub mod capabilities;
pub mod evaluator;
pub mod network;
pub mod outcome;
pub mod record;
pub mod supervisor;

pub use binder::{Program, PRELUDE};
pub use capabilities::{build_capabilities, CapabilitySet};
pub use evaluator::{EngineLimits, LanguageFeatures, PrintLog};
pub use network::{NetworkError, NetworkMediator, AUTHOR_HEADER, SCRIPT_AUTHOR_HEADER};
pub use outcome::ExecutionOutcome;
pub use record::Record;
pub use supervisor::{ExecutionSupervisor, SupervisorState, WorkerJob};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rhai::EvalAltResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{ExecutionRequest, ExecutionResponse};
use network::MediatorConfig;

/// Hard cap on response bytes handed to scripts
pub const MAX_RESPONSE_BYTES: usize = 1_000_000;

/// User-Agent stamped on every outbound request
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; Architus/1.0; +https://archit.us)";

/// Script execution errors
#[derive(Debug, Error)]
pub enum ScriptError {
    /// A builtin was called with the wrong argument shape
    #[error("{0}")]
    Binding(String),

    /// Any other error raised while the program ran, including parse errors
    #[error("{0}")]
    Evaluation(String),

    /// An outbound request made by the script failed
    #[error("{0}")]
    Network(String),

    /// Deadline elapsed before the worker reported
    #[error("Script timed out")]
    Timeout,

    /// The worker could not be started or vanished without a report
    #[error("{0}")]
    WorkerLost(String),
}

impl ScriptError {
    /// Classify an evaluator error raised by an engine with `registered`
    /// builtins.
    ///
    /// The message keeps the evaluator's full call chain and positions.
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn from_eval(err: Box<EvalAltResult>, registered: &[&str]) -> Self {
        let message = err.to_string();
        match root_cause(&err) {
            EvalAltResult::ErrorSystem(_, inner) if inner.is::<NetworkError>() => {
                Self::Network(message)
            }
            EvalAltResult::ErrorFunctionNotFound(signature, _)
                if capabilities::is_capability_signature(signature, registered) =>
            {
                Self::Binding(message)
            }
            EvalAltResult::ErrorMismatchDataType(..) => Self::Binding(message),
            _ => Self::Evaluation(message),
        }
    }

    /// Short label for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Binding(_) => "binding",
            Self::Evaluation(_) => "evaluation",
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::WorkerLost(_) => "worker",
        }
    }
}

/// Innermost error beneath script function call frames
fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        other => other,
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("could not read config {path}: {source}")]
    Read {
        /// Path that failed
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// File is not valid JSON for [`SandboxConfig`]
    #[error("invalid config {path}: {source}")]
    Parse {
        /// Path that failed
        path: String,
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration for script sandboxing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock deadline for one script in milliseconds
    pub deadline_ms: u64,
    /// Bytes of response body handed to scripts
    pub max_response_bytes: usize,
    /// User-Agent sent with outbound requests
    pub user_agent: String,
    /// Timeout for a single outbound request in milliseconds
    pub request_timeout_ms: u64,
    /// Register the `get`/`post` builtins
    pub allow_network: bool,
    /// Ask timed-out workers to stop at their next progress check
    pub reap_abandoned: bool,
    /// Scripting language switches
    pub features: LanguageFeatures,
    /// Evaluator size limits
    pub limits: EngineLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            deadline_ms: crate::DEFAULT_DEADLINE_MS,
            max_response_bytes: MAX_RESPONSE_BYTES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_ms: 5000,
            allow_network: true,
            reap_abandoned: false,
            features: LanguageFeatures::default(),
            limits: EngineLimits::default(),
        }
    }
}

impl SandboxConfig {
    /// Load from a JSON file; missing fields take their defaults
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Script deadline
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Settings handed to each execution's network mediator
    #[must_use]
    pub fn mediator_config(&self) -> MediatorConfig {
        MediatorConfig {
            max_response_bytes: self.max_response_bytes,
            user_agent: self.user_agent.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// Entry point for running scripts
///
/// Cheap to clone; every execution gets its own supervisor, namespace,
/// capabilities and print log.
#[derive(Clone, Debug, Default)]
pub struct Sandbox {
    config: Arc<SandboxConfig>,
}

impl Sandbox {
    /// Create a sandbox with the given configuration
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one request
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResponse {
        let id = Uuid::new_v4();
        let response = match self.prepare(&request) {
            Ok(job) => ExecutionSupervisor::new(id, &self.config)
                .run(job)
                .await
                .into_response(),
            Err(err) => reject(id, &err),
        };
        debug!(request_id = %id, errno = response.errno, "response ready");
        response
    }

    /// Run one request, blocking the calling thread
    pub fn execute_blocking(&self, request: ExecutionRequest) -> ExecutionResponse {
        let id = Uuid::new_v4();
        let response = match self.prepare(&request) {
            Ok(job) => ExecutionSupervisor::new(id, &self.config)
                .run_blocking(job)
                .into_response(),
            Err(err) => reject(id, &err),
        };
        debug!(request_id = %id, errno = response.errno, "response ready");
        response
    }

    fn prepare(&self, request: &ExecutionRequest) -> Result<WorkerJob, NetworkError> {
        let capabilities = build_capabilities(request, &self.config)?;
        Ok(WorkerJob::new(
            Program::bind(request),
            capabilities,
            self.config.features,
            self.config.limits,
        ))
    }
}

fn reject(id: Uuid, err: &NetworkError) -> ExecutionResponse {
    warn!(request_id = %id, "could not prepare script: {err}");
    ExecutionOutcome::RuntimeError(err.to_string()).into_response()
}
