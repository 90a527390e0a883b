//! # Scriptbox
//!
//! Sandboxed execution of short user-authored scripts for a chat bot.
//!
//! ## Architecture
//!
//! A request carries a script plus the chat context it was triggered from:
//! - **Binder**: exposes the context to the script as read-only bindings
//! - **Capabilities**: the only host functions a script may call
//! - **Network mediator**: attributed, size-capped outbound HTTP
//! - **Supervisor**: runs the script on a worker against a wall-clock deadline
//!
//! ## Response Contract
//!
//! - `errno` 0: success, `output` is the print log joined by newlines
//! - `errno` 4: runtime error, `error` carries the message
//! - `errno` 5: deadline elapsed, `error` is `"Script timed out"`

#![forbid(unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod sandbox;
pub mod types;

pub use sandbox::{
    ConfigError, EngineLimits, ExecutionOutcome, LanguageFeatures, NetworkError, Record, Sandbox,
    SandboxConfig, ScriptError, DEFAULT_USER_AGENT, MAX_RESPONSE_BYTES,
};
pub use types::{
    errno, Author, Channel, ExecutionRequest, ExecutionResponse, TriggerMessage, TIMEOUT_MESSAGE,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default script deadline in milliseconds
pub const DEFAULT_DEADLINE_MS: u64 = 1000;
