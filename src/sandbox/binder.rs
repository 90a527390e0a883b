//! Context binding: turns a request into a runnable program.
//!
//! Request fields reach the script only through [`Scope`] bindings. Nothing
//! from the request is ever spliced into source text, so message content,
//! nicknames and captures are data no matter which characters they contain.

use rhai::{Array, Dynamic, Engine, Map, Scope, AST, INT};

use super::record::Record;
use super::ScriptError;
use crate::types::{Author, Channel, ExecutionRequest, TriggerMessage};

/// Helpers compiled ahead of every script
pub const PRELUDE: &str = r"
fn p(value) {
    print(value);
}

fn choice(items) {
    let n = items.len();
    if n == 0 {
        return ();
    }
    items[randint(0, n)]
}

fn sum(items) {
    let total = 0;
    for item in items {
        total += item;
    }
    total
}

fn post(url) {
    post(url, (), (), ())
}

fn post(url, headers) {
    post(url, headers, (), ())
}

fn post(url, headers, data) {
    post(url, headers, data, ())
}

fn post(url, headers, data, json) {
    let response = post_internal(url, headers, data, json);
    [response[0], json_decode(response[1])]
}
";

/// Script text plus the namespace it runs in
pub struct Program {
    source: String,
    scope: Scope<'static>,
}

impl Program {
    /// Bind a request
    #[must_use]
    pub fn bind(request: &ExecutionRequest) -> Self {
        Self {
            source: request.script.clone(),
            scope: namespace(request),
        }
    }

    /// The caller's script, without the prelude
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compile prelude and script into one unit.
    ///
    /// The two are compiled separately so positions in errors refer to the
    /// caller's own lines.
    ///
    /// # Errors
    /// Returns error if either part fails to parse
    pub fn compile(&self, engine: &Engine) -> Result<AST, ScriptError> {
        let prelude = engine
            .compile(PRELUDE)
            .map_err(|e| ScriptError::Evaluation(format!("prelude: {e}")))?;
        let script = engine
            .compile(&self.source)
            .map_err(|e| ScriptError::Evaluation(e.to_string()))?;
        Ok(prelude.merge(&script))
    }

    /// Give up the namespace for evaluation
    #[must_use]
    pub fn into_scope(self) -> Scope<'static> {
        self.scope
    }
}

/// Snowflakes become script integers when they fit, decimal strings otherwise
fn snowflake(id: u64) -> Dynamic {
    INT::try_from(id).map_or_else(|_| Dynamic::from(id.to_string()), Dynamic::from)
}

fn text(value: &str) -> Dynamic {
    Dynamic::from(value.to_string())
}

fn strings(values: &[String]) -> Array {
    values.iter().map(|v| text(v)).collect()
}

fn record(fields: Vec<(&str, Dynamic)>) -> Dynamic {
    let map: Map = fields
        .into_iter()
        .map(|(name, value)| (name.into(), value))
        .collect();
    Dynamic::from(Record::new(map))
}

fn message_record(message: &TriggerMessage) -> Dynamic {
    record(vec![
        ("id", snowflake(message.id)),
        ("content", text(&message.content)),
        ("clean", text(&message.clean)),
    ])
}

fn author_record(author: &Author) -> Dynamic {
    let roles: Array = author.roles.iter().map(|r| snowflake(*r)).collect();
    record(vec![
        ("id", snowflake(author.id)),
        ("name", text(&author.name)),
        ("avatar_url", text(&author.avatar_url)),
        ("color", text(&author.color)),
        ("discrim", Dynamic::from(INT::from(author.discriminator))),
        ("roles", Dynamic::from_array(roles)),
        ("nick", text(&author.nick)),
        ("disp", text(&author.disp_name)),
        ("perms", snowflake(author.permissions)),
    ])
}

fn channel_record(channel: &Channel) -> Dynamic {
    record(vec![
        ("id", snowflake(channel.id)),
        ("name", text(&channel.name)),
    ])
}

fn namespace(request: &ExecutionRequest) -> Scope<'static> {
    let mut scope = Scope::new();

    let message = message_record(&request.trigger_message);
    let author = author_record(&request.message_author);
    let channel = channel_record(&request.channel);

    scope
        .push_constant_dynamic("message", message.clone())
        .push_constant_dynamic("msg", message)
        .push_constant_dynamic("author", author.clone())
        .push_constant_dynamic("a", author)
        .push_constant_dynamic("script_author", author_record(&request.script_author))
        .push_constant_dynamic("channel", channel.clone())
        .push_constant_dynamic("ch", channel)
        .push_constant_dynamic("count", snowflake(request.count))
        .push("caps", strings(&request.captures))
        .push("args", strings(&request.arguments))
        .push(
            "auth_list",
            strings(&[
                request.message_author.name.clone(),
                request.message_author.nick.clone(),
                request.message_author.disp_name.clone(),
            ]),
        );

    scope
}
