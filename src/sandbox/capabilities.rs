//! Host functions callable from scripts.
//!
//! A [`CapabilitySet`] is built fresh for every request by
//! [`build_capabilities`]. The network builtins close over that request's
//! identities, so one request's attribution can never end up on another
//! request's outbound calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position, FLOAT, INT};

use super::network::{identity_json, MediatorConfig, NetworkError, NetworkMediator, RequestBody};
use super::record::{to_plain, Record};
use super::SandboxConfig;
use crate::types::ExecutionRequest;

/// Builtins registered for every request
pub const CORE_CAPABILITIES: &[&str] = &[
    "random",
    "randint",
    "sin",
    "struct",
    "json_encode",
    "json_decode",
];

/// Builtins registered only when network access is on
pub const NETWORK_CAPABILITIES: &[&str] = &["get", "post_internal"];

/// Uniform float in `[0, 1)` from the process-wide generator
#[must_use]
pub fn random() -> FLOAT {
    rand::random::<FLOAT>()
}

/// Integer drawn from `[low, high)` by scaling a `[0, 1)` draw.
///
/// Bounds are not validated. When `high <= low` the draw lands in
/// `(high, low]` and truncates toward zero, so `randint(n, n)` is always `n`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn randint(low: INT, high: INT) -> INT {
    let span = high.wrapping_sub(low) as FLOAT;
    (span * random() + low as FLOAT) as INT
}

/// Freeze a map into a record
#[must_use]
pub fn make_struct(fields: Map) -> Record {
    Record::new(fields)
}

fn json_encode(value: Dynamic) -> Result<String, Box<EvalAltResult>> {
    serde_json::to_string(&to_plain(value)).map_err(|e| runtime_error(format!("json_encode: {e}")))
}

fn json_decode(text: &str) -> Result<Dynamic, Box<EvalAltResult>> {
    serde_json::from_str::<Dynamic>(text).map_err(|e| runtime_error(format!("json_decode: {e}")))
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(message.into(), Position::NONE).into()
}

fn mismatch(expected: &str, actual: &Dynamic) -> Box<EvalAltResult> {
    EvalAltResult::ErrorMismatchDataType(
        expected.to_string(),
        actual.type_name().to_string(),
        Position::NONE,
    )
    .into()
}

fn network_failure(err: NetworkError) -> Box<EvalAltResult> {
    EvalAltResult::ErrorSystem("network request failed".to_string(), Box::new(err)).into()
}

/// `()`, a map or a record of header names to values
fn headers_arg(value: Dynamic) -> Result<BTreeMap<String, String>, Box<EvalAltResult>> {
    if value.is_unit() {
        return Ok(BTreeMap::new());
    }
    let value = to_plain(value);
    let type_name = value.type_name();
    match value.try_cast::<Map>() {
        Some(map) => Ok(map
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()),
        None => Err(EvalAltResult::ErrorMismatchDataType(
            "map".to_string(),
            type_name.to_string(),
            Position::NONE,
        )
        .into()),
    }
}

/// `()`, a string or a blob
fn data_arg(value: Dynamic) -> Result<Option<Vec<u8>>, Box<EvalAltResult>> {
    if value.is_unit() {
        Ok(None)
    } else if value.is_string() {
        Ok(Some(value.to_string().into_bytes()))
    } else if value.is::<Blob>() {
        Ok(value.try_cast::<Blob>())
    } else {
        Err(mismatch("string or blob", &value))
    }
}

/// `()` or anything JSON-encodable
fn json_arg(value: &Dynamic) -> Result<Option<String>, NetworkError> {
    if value.is_unit() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(&to_plain(value.clone()))?))
    }
}

fn response_array(status: u16, body: String) -> Array {
    vec![Dynamic::from(INT::from(status)), Dynamic::from(body)]
}

/// The builtins offered to one request
#[derive(Clone, Debug)]
pub struct CapabilitySet {
    network: Option<NetworkCapability>,
}

#[derive(Clone, Debug)]
struct NetworkCapability {
    config: MediatorConfig,
    author_json: String,
    script_author_json: String,
}

/// Build the capability set for one request.
///
/// Identity snapshots are serialized here, once, from this request only.
///
/// # Errors
/// Returns error if an identity snapshot cannot be serialized
pub fn build_capabilities(
    request: &ExecutionRequest,
    config: &SandboxConfig,
) -> Result<CapabilitySet, NetworkError> {
    let network = if config.allow_network {
        Some(NetworkCapability {
            config: config.mediator_config(),
            author_json: identity_json(&request.message_author)?,
            script_author_json: identity_json(&request.script_author)?,
        })
    } else {
        None
    };

    Ok(CapabilitySet { network })
}

impl CapabilitySet {
    /// Whether `get`/`post_internal` will be registered
    #[must_use]
    pub const fn has_network(&self) -> bool {
        self.network.is_some()
    }

    /// Names [`install`](Self::install) registers
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = CORE_CAPABILITIES.to_vec();
        if self.has_network() {
            names.extend_from_slice(NETWORK_CAPABILITIES);
        }
        names
    }

    /// Register every builtin on `engine`.
    ///
    /// Must run on the worker thread: the network builtins own a blocking
    /// HTTP client.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be set up
    pub fn install(self, engine: &mut Engine) -> Result<(), NetworkError> {
        engine
            .register_fn("random", random)
            .register_fn("randint", randint)
            .register_fn("sin", |rad: FLOAT| rad.sin())
            .register_fn("sin", |rad: INT| {
                #[allow(clippy::cast_precision_loss)]
                let rad = rad as FLOAT;
                rad.sin()
            })
            .register_fn("struct", make_struct)
            .register_fn("json_encode", json_encode)
            .register_fn("json_decode", |text: ImmutableString| json_decode(&text));

        if let Some(network) = self.network {
            let mediator = Arc::new(NetworkMediator::new(
                network.config,
                &network.author_json,
                &network.script_author_json,
            )?);
            register_network(engine, &mediator);
        }

        Ok(())
    }
}

fn register_network(engine: &mut Engine, mediator: &Arc<NetworkMediator>) {
    let m = Arc::clone(mediator);
    engine.register_fn(
        "get",
        move |url: ImmutableString| -> Result<Array, Box<EvalAltResult>> {
            let response = m.get(&url, &BTreeMap::new()).map_err(network_failure)?;
            Ok(response_array(response.status, response.body))
        },
    );

    let m = Arc::clone(mediator);
    engine.register_fn(
        "get",
        move |url: ImmutableString, headers: Dynamic| -> Result<Array, Box<EvalAltResult>> {
            let headers = headers_arg(headers)?;
            let response = m.get(&url, &headers).map_err(network_failure)?;
            Ok(response_array(response.status, response.body))
        },
    );

    let m = Arc::clone(mediator);
    engine.register_fn(
        "post_internal",
        move |url: ImmutableString,
              headers: Dynamic,
              data: Dynamic,
              json: Dynamic|
              -> Result<Array, Box<EvalAltResult>> {
            let headers = headers_arg(headers)?;
            let raw = data_arg(data)?;
            let json = json_arg(&json).map_err(network_failure)?;
            let response = m
                .post(&url, &headers, RequestBody::choose(raw, json))
                .map_err(network_failure)?;
            Ok(response_array(response.status, response.body))
        },
    );
}

/// Whether an unresolved function signature names one of `registered`
#[must_use]
pub fn is_capability_signature(signature: &str, registered: &[&str]) -> bool {
    let name = signature.split(['(', ' ']).next().unwrap_or_default();
    registered.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::evaluator::{build_engine, EngineLimits, LanguageFeatures, PrintLog};

    fn engine_with(capabilities: CapabilitySet) -> (Engine, PrintLog) {
        let log = PrintLog::new();
        let mut engine = build_engine(&LanguageFeatures::default(), &EngineLimits::default(), &log);
        capabilities.install(&mut engine).unwrap();
        (engine, log)
    }

    fn offline() -> CapabilitySet {
        let config = SandboxConfig {
            allow_network: false,
            ..SandboxConfig::default()
        };
        build_capabilities(&ExecutionRequest::default(), &config).unwrap()
    }

    #[test]
    fn test_random_in_unit_interval() {
        for _ in 0..1000 {
            let r = random();
            assert!((0.0..1.0).contains(&r));
        }
    }

    #[test]
    fn test_randint_range() {
        for _ in 0..1000 {
            let r = randint(3, 10);
            assert!((3..10).contains(&r));
        }
    }

    #[test]
    fn test_randint_degenerate_range() {
        // Equal bounds always yield the bound itself
        for _ in 0..100 {
            assert_eq!(randint(5, 5), 5);
        }
        // Inverted bounds land between high and low
        for _ in 0..100 {
            let r = randint(5, 3);
            assert!((3..=5).contains(&r));
        }
    }

    #[test]
    fn test_capability_signature_matching() {
        let names = offline().names();
        assert!(is_capability_signature("randint (&str | ImmutableString, i64)", &names));
        assert!(is_capability_signature("sin()", &names));
        assert!(!is_capability_signature("undefined_thing (i64)", &names));
    }

    #[test]
    fn test_network_names_only_when_enabled() {
        let offline = offline().names();
        assert!(!is_capability_signature("get (&str | ImmutableString)", &offline));

        let online = build_capabilities(&ExecutionRequest::default(), &SandboxConfig::default())
            .unwrap()
            .names();
        assert!(is_capability_signature("get (&str | ImmutableString)", &online));
        assert!(is_capability_signature("post_internal (i64)", &online));
    }

    #[test]
    fn test_builtins_registered() {
        let (engine, _) = engine_with(offline());
        let value: FLOAT = engine.eval("sin(0)").unwrap();
        assert!(value.abs() < f64::EPSILON);
        let value: FLOAT = engine.eval("sin(0.0)").unwrap();
        assert!(value.abs() < f64::EPSILON);
        let value: INT = engine.eval("randint(2, 3)").unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_struct_fields_readable() {
        let (engine, log) = engine_with(offline());
        engine
            .run(r#"let s = struct(#{ name: "x", n: 2 }); print(s.name); print(s.n);"#)
            .unwrap();
        assert_eq!(log.lines(), vec!["x", "2"]);
    }

    #[test]
    fn test_struct_is_immutable() {
        let (engine, _) = engine_with(offline());
        assert!(engine.run("let m = struct(#{ a: 1 }); m.a = 2;").is_err());
        assert!(engine.run("let m = struct(#{ a: 1 }); m.b = 3;").is_err());
        assert!(engine.run(r#"let m = struct(#{ a: 1 }); m["a"] = 2;"#).is_err());
    }

    #[test]
    fn test_struct_encodes_as_object() {
        let (engine, log) = engine_with(offline());
        engine
            .run("let m = struct(#{ a: 1, b: [struct(#{ c: true })] }); print(json_encode(m));")
            .unwrap();
        assert_eq!(log.lines(), vec![r#"{"a":1,"b":[{"c":true}]}"#]);
    }

    #[test]
    fn test_json_round_trip_in_script() {
        let (engine, log) = engine_with(offline());
        engine
            .run(r#"let v = json_decode("{\"a\": [1, 2]}"); print(v.a[1]); print(json_encode(v.a));"#)
            .unwrap();
        assert_eq!(log.lines(), vec!["2", "[1,2]"]);
    }

    #[test]
    fn test_wrong_argument_shape_is_unresolved_capability() {
        let (engine, _) = engine_with(offline());
        let err = engine.run(r#"randint("a", 1);"#).unwrap_err();
        match *err {
            EvalAltResult::ErrorFunctionNotFound(signature, _) => {
                assert!(is_capability_signature(&signature, CORE_CAPABILITIES));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_offline_set_has_no_network() {
        let capabilities = offline();
        assert!(!capabilities.has_network());
        let (engine, _) = engine_with(capabilities);
        assert!(engine.run(r#"get("http://localhost/");"#).is_err());
    }
}
