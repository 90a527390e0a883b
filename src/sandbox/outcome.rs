//! Execution outcomes and their reduction into the response contract.

use super::ScriptError;
use crate::types::ExecutionResponse;

/// How one execution ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Ran to completion, carrying the print log
    Output(Vec<String>),
    /// Raised an error, carrying its message
    RuntimeError(String),
    /// Did not report before the deadline
    Timeout,
}

impl ExecutionOutcome {
    /// Fold a worker result into an outcome
    #[must_use]
    pub fn from_result(result: Result<Vec<String>, ScriptError>) -> Self {
        match result {
            Ok(lines) => Self::Output(lines),
            Err(ScriptError::Timeout) => Self::Timeout,
            Err(err) => Self::RuntimeError(err.to_string()),
        }
    }

    /// Reduce to the response contract
    #[must_use]
    pub fn into_response(self) -> ExecutionResponse {
        match self {
            Self::Output(lines) => ExecutionResponse::ok(lines.join("\n")),
            Self::RuntimeError(message) => ExecutionResponse::runtime_error(message),
            Self::Timeout => ExecutionResponse::timed_out(),
        }
    }
}

impl From<ExecutionOutcome> for ExecutionResponse {
    fn from(outcome: ExecutionOutcome) -> Self {
        outcome.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{errno, TIMEOUT_MESSAGE};

    #[test]
    fn test_output_joined_with_newlines() {
        let response = ExecutionOutcome::Output(vec!["a".into(), "b".into()]).into_response();
        assert_eq!(response.output, "a\nb");
        assert!(response.error.is_empty());
        assert_eq!(response.errno, errno::OK);
    }

    #[test]
    fn test_empty_output_is_success() {
        let response = ExecutionOutcome::Output(Vec::new()).into_response();
        assert_eq!(response, ExecutionResponse::ok(""));
        assert!(response.is_ok());
    }

    #[test]
    fn test_runtime_error() {
        let response: ExecutionResponse =
            ExecutionOutcome::RuntimeError("Variable not found: x".into()).into();
        assert!(response.output.is_empty());
        assert_eq!(response.error, "Variable not found: x");
        assert_eq!(response.errno, errno::RUNTIME_ERROR);
    }

    #[test]
    fn test_timeout() {
        let response = ExecutionOutcome::Timeout.into_response();
        assert!(response.output.is_empty());
        assert_eq!(response.error, TIMEOUT_MESSAGE);
        assert_eq!(response.errno, errno::TIMEOUT);
    }

    #[test]
    fn test_from_result() {
        assert_eq!(
            ExecutionOutcome::from_result(Err(ScriptError::Timeout)),
            ExecutionOutcome::Timeout
        );
        assert_eq!(
            ExecutionOutcome::from_result(Err(ScriptError::Binding("bad args".into()))),
            ExecutionOutcome::RuntimeError("bad args".into())
        );
        assert_eq!(
            ExecutionOutcome::from_result(Ok(vec!["x".into()])),
            ExecutionOutcome::Output(vec!["x".into()])
        );
    }
}
