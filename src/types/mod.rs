//! Data types crossing the engine boundary.

mod request;
mod response;

pub use request::{Author, Channel, ExecutionRequest, TriggerMessage};
pub use response::{errno, ExecutionResponse, TIMEOUT_MESSAGE};
