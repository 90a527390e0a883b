//! Evaluator construction.
//!
//! One [`Engine`] is built per execution from a process-wide
//! [`LanguageFeatures`] value and [`EngineLimits`]. Output from `print` lands
//! in a [`PrintLog`] owned by that execution.
//!
//! ## Security: Resource Limits
//!
//! A worker that loses the deadline race keeps running, so memory has to be
//! bounded inside the evaluator itself. Strings, arrays and maps are capped
//! and the print log stops growing at its byte limit; a script that grows
//! past them fails with a runtime error instead of exhausting the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::record;
use crate::MAX_RESPONSE_BYTES;

/// Call depth used when recursion is switched off
const NON_RECURSIVE_CALL_DEPTH: usize = 4;

/// Scripting language switches, decided once at process start
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageFeatures {
    /// Allow script functions to call themselves
    pub allow_recursion: bool,
    /// Allow anonymous functions and closures
    pub allow_lambda: bool,
    /// Allow `while`, `loop` and `for`
    pub allow_looping: bool,
    /// Allow re-declaring an existing top-level variable
    pub allow_global_reassign: bool,
    /// Maximum script function call depth when recursion is allowed
    pub max_call_depth: usize,
}

impl Default for LanguageFeatures {
    fn default() -> Self {
        Self {
            allow_recursion: true,
            allow_lambda: true,
            allow_looping: true,
            allow_global_reassign: true,
            max_call_depth: 64,
        }
    }
}

impl LanguageFeatures {
    /// Effective call depth limit
    #[must_use]
    pub fn call_depth(&self) -> usize {
        if self.allow_recursion {
            self.max_call_depth
        } else {
            self.max_call_depth.min(NON_RECURSIVE_CALL_DEPTH)
        }
    }
}

/// Size limits applied to every engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Maximum string length in bytes
    pub max_string_size: usize,
    /// Maximum number of array elements
    pub max_array_size: usize,
    /// Maximum number of map entries
    pub max_map_size: usize,
    /// Maximum evaluator operations per run, 0 for unlimited
    pub max_operations: u64,
    /// Bytes of print output kept; later lines are dropped
    pub max_output_bytes: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            // Room for a capped response body after lossy decoding
            max_string_size: 4 * MAX_RESPONSE_BYTES,
            max_array_size: 100_000,
            max_map_size: 10_000,
            max_operations: 0,
            max_output_bytes: MAX_RESPONSE_BYTES,
        }
    }
}

#[derive(Debug, Default)]
struct Captured {
    lines: Vec<String>,
    bytes: usize,
}

/// Ordered output captured from `print` during one execution
#[derive(Clone, Debug)]
pub struct PrintLog {
    captured: Arc<Mutex<Captured>>,
    max_bytes: usize,
}

impl Default for PrintLog {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl PrintLog {
    /// Create an empty, unbounded log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log keeping at most `max_bytes` of output
    #[must_use]
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            captured: Arc::new(Mutex::new(Captured::default())),
            max_bytes,
        }
    }

    /// Append a line, unless it would take the log past its limit
    pub fn push(&self, line: &str) {
        let mut captured = self
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let bytes = captured.bytes.saturating_add(line.len());
        if bytes > self.max_bytes {
            return;
        }
        captured.bytes = bytes;
        captured.lines.push(line.to_string());
    }

    /// Snapshot of the captured lines
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .clone()
    }
}

/// Build an evaluator with the given language switches.
///
/// The engine has no module resolver and no `eval`, so the only ways out of
/// the sandbox are the capabilities registered on it afterwards.
#[must_use]
pub fn build_engine(features: &LanguageFeatures, limits: &EngineLimits, log: &PrintLog) -> Engine {
    let mut engine = Engine::new();

    engine
        .set_module_resolver(DummyModuleResolver::new())
        .disable_symbol("eval")
        .set_allow_looping(features.allow_looping)
        .set_allow_anonymous_fn(features.allow_lambda)
        .set_allow_shadowing(features.allow_global_reassign)
        .set_max_call_levels(features.call_depth())
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size)
        .set_max_operations(limits.max_operations);

    record::register(&mut engine);

    let sink = log.clone();
    engine.on_print(move |text| sink.push(text));
    engine.on_debug(|text, source, pos| {
        debug!(source = source.unwrap_or("script"), %pos, "{text}");
    });

    engine
}

/// Make the engine stop at its next progress check once `flag` is raised
pub fn stop_when(engine: &mut Engine, flag: Arc<AtomicBool>) {
    engine.on_progress(move |_| {
        if flag.load(Ordering::Relaxed) {
            Some(Dynamic::from("abandoned"))
        } else {
            None
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(features: LanguageFeatures, script: &str) -> Result<Vec<String>, String> {
        run_limited(features, EngineLimits::default(), script)
    }

    fn run_limited(
        features: LanguageFeatures,
        limits: EngineLimits,
        script: &str,
    ) -> Result<Vec<String>, String> {
        let log = PrintLog::with_limit(limits.max_output_bytes);
        let engine = build_engine(&features, &limits, &log);
        engine.run(script).map_err(|e| e.to_string())?;
        Ok(log.lines())
    }

    #[test]
    fn test_print_is_captured_in_order() {
        let lines = run(LanguageFeatures::default(), r#"print("a"); print(1 + 1);"#).unwrap();
        assert_eq!(lines, vec!["a", "2"]);
    }

    #[test]
    fn test_default_features_allow_everything() {
        let script = r#"
            fn fact(n) { if n <= 1 { 1 } else { n * fact(n - 1) } }
            let double = |x| x * 2;
            let total = 0;
            for i in 0..3 { total += i; }
            let total = total + 1;
            print(double(fact(4)) + total);
        "#;
        let lines = run(LanguageFeatures::default(), script).unwrap();
        assert_eq!(lines, vec!["52"]);
    }

    #[test]
    fn test_looping_can_be_disabled() {
        let features = LanguageFeatures {
            allow_looping: false,
            ..LanguageFeatures::default()
        };
        assert!(run(features, "while true { }").is_err());
    }

    #[test]
    fn test_lambda_can_be_disabled() {
        let features = LanguageFeatures {
            allow_lambda: false,
            ..LanguageFeatures::default()
        };
        assert!(run(features, "let f = |x| x; print(f(1));").is_err());
    }

    #[test]
    fn test_disabled_recursion_limits_depth() {
        let features = LanguageFeatures {
            allow_recursion: false,
            ..LanguageFeatures::default()
        };
        assert_eq!(features.call_depth(), NON_RECURSIVE_CALL_DEPTH);
        let script = "fn down(n) { if n == 0 { 0 } else { down(n - 1) } } down(50);";
        assert!(run(features, script).is_err());
    }

    #[test]
    fn test_eval_and_import_are_unavailable() {
        assert!(run(LanguageFeatures::default(), r#"eval("print(1)");"#).is_err());
        assert!(run(LanguageFeatures::default(), r#"import "secrets" as s;"#).is_err());
    }

    #[test]
    fn test_stop_when_flag_raised() {
        let log = PrintLog::new();
        let mut engine = build_engine(&LanguageFeatures::default(), &EngineLimits::default(), &log);
        let flag = Arc::new(AtomicBool::new(true));
        stop_when(&mut engine, flag);
        assert!(engine.run("loop { }").is_err());
    }

    #[test]
    fn test_string_growth_is_bounded() {
        let limits = EngineLimits {
            max_string_size: 1024,
            ..EngineLimits::default()
        };
        let result = run_limited(
            LanguageFeatures::default(),
            limits,
            r#"let s = "xxxxxxxx"; loop { s += s; }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_array_growth_is_bounded() {
        let limits = EngineLimits {
            max_array_size: 64,
            ..EngineLimits::default()
        };
        assert!(run_limited(LanguageFeatures::default(), limits, "let a = [1]; loop { a += a; }").is_err());
    }

    #[test]
    fn test_capped_response_fits_default_string_limit() {
        let limits = EngineLimits::default();
        assert!(limits.max_string_size >= MAX_RESPONSE_BYTES);
        let script = format!("let s = \"x\"; s.pad({MAX_RESPONSE_BYTES}, 'x'); print(s.len());");
        let lines = run(LanguageFeatures::default(), &script).unwrap();
        assert_eq!(lines, vec![MAX_RESPONSE_BYTES.to_string()]);
    }

    #[test]
    fn test_print_log_stops_at_limit() {
        let log = PrintLog::with_limit(5);
        log.push("abc");
        log.push("defg");
        log.push("de");
        assert_eq!(log.lines(), vec!["abc", "de"]);
    }
}
