//! Execution requests - everything a script gets to know about its trigger.
//!
//! All string fields originate from chat users and are attacker-influenced.
//! They are only ever handed to the evaluator as values, never as source text.

use serde::{Deserialize, Serialize};

/// The chat message that triggered the script
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerMessage {
    /// Message snowflake
    pub id: u64,
    /// Raw message content
    pub content: String,
    /// Content with mentions resolved to display names
    #[serde(alias = "cleaned_content")]
    pub clean: String,
}

/// A guild member, either the one who sent the message or the one who wrote the script
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Author {
    /// User snowflake
    pub id: u64,
    /// Account name
    pub name: String,
    /// Avatar URL
    pub avatar_url: String,
    /// Top role colour
    pub color: String,
    /// Four digit discriminator
    pub discriminator: u32,
    /// Role snowflakes
    pub roles: Vec<u64>,
    /// Guild nickname
    pub nick: String,
    /// Display name (nickname if set, account name otherwise)
    #[serde(alias = "display_name")]
    pub disp_name: String,
    /// Permission bitset
    pub permissions: u64,
}

impl Author {
    /// Create an author with just an id and a name
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            nick: name.clone(),
            disp_name: name.clone(),
            name,
            ..Self::default()
        }
    }
}

/// The channel the message was sent in
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    /// Channel snowflake
    pub id: u64,
    /// Channel name
    pub name: String,
}

/// A request to run one script
///
/// Immutable for the lifetime of the execution it describes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    /// Message that triggered the script
    pub trigger_message: TriggerMessage,
    /// Member who sent the trigger message
    pub message_author: Author,
    /// Member who wrote the script
    pub script_author: Author,
    /// Channel the trigger message was sent in
    pub channel: Channel,
    /// Regex captures from the trigger pattern
    pub captures: Vec<String>,
    /// Command arguments
    pub arguments: Vec<String>,
    /// How many times this response has fired
    pub count: u64,
    /// Script source
    pub script: String,
}

impl ExecutionRequest {
    /// Create a request that runs `script` with empty context
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    /// Set the message author
    #[must_use]
    pub fn with_message_author(mut self, author: Author) -> Self {
        self.message_author = author;
        self
    }

    /// Set the script author
    #[must_use]
    pub fn with_script_author(mut self, author: Author) -> Self {
        self.script_author = author;
        self
    }

    /// Set the trigger message
    #[must_use]
    pub fn with_message(mut self, message: TriggerMessage) -> Self {
        self.trigger_message = message;
        self
    }

    /// Set the channel
    #[must_use]
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Set regex captures
    #[must_use]
    pub fn with_captures<I, S>(mut self, captures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.captures = captures.into_iter().map(Into::into).collect();
        self
    }

    /// Set command arguments
    #[must_use]
    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    /// Set the fire count
    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }
}
