//! The response contract handed back to the caller.

use serde::{Deserialize, Serialize};

/// Numeric error codes carried in [`ExecutionResponse::errno`]
pub mod errno {
    /// Script ran to completion
    pub const OK: i32 = 0;
    /// Script raised an error while running
    pub const RUNTIME_ERROR: i32 = 4;
    /// Script did not finish before the deadline
    pub const TIMEOUT: i32 = 5;
}

/// Error text reported for timed-out scripts
pub const TIMEOUT_MESSAGE: &str = "Script timed out";

/// Result of one script execution
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    /// Printed output, one line per print call
    pub output: String,
    /// Error text, empty on success
    pub error: String,
    /// Error code, see [`errno`]
    pub errno: i32,
}

impl ExecutionResponse {
    /// Successful response carrying `output`
    #[must_use]
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
            errno: errno::OK,
        }
    }

    /// Failed response carrying `error`
    #[must_use]
    pub fn runtime_error(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
            errno: errno::RUNTIME_ERROR,
        }
    }

    /// Timed-out response
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            output: String::new(),
            error: TIMEOUT_MESSAGE.to_string(),
            errno: errno::TIMEOUT,
        }
    }

    /// Whether the script completed without error
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.errno == errno::OK
    }
}
