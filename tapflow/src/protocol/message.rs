use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Wire name of the type discriminator member.
pub const TYPE_KEY: &str = "type";

/// Kind of a [`Message`], as spelled in the `type` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    Schema,
    Record,
    State,
    ActivateVersion,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Schema => "SCHEMA",
            MessageType::Record => "RECORD",
            MessageType::State => "STATE",
            MessageType::ActivateVersion => "ACTIVATE_VERSION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SCHEMA" => Some(MessageType::Schema),
            "RECORD" => Some(MessageType::Record),
            "STATE" => Some(MessageType::State),
            "ACTIVATE_VERSION" => Some(MessageType::ActivateVersion),
            _ => None,
        }
    }
}

/// One line of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    State(StateMessage),
    ActivateVersion(ActivateVersionMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Schema(_) => MessageType::Schema,
            Message::Record(_) => MessageType::Record,
            Message::State(_) => MessageType::State,
            Message::ActivateVersion(_) => MessageType::ActivateVersion,
        }
    }

    /// Stream the message belongs to. `STATE` messages are pipeline wide.
    pub fn stream(&self) -> Option<&str> {
        match self {
            Message::Schema(message) => Some(&message.stream),
            Message::Record(message) => Some(&message.stream),
            Message::ActivateVersion(message) => Some(&message.stream),
            Message::State(_) => None,
        }
    }
}

/// Describes the records of a stream that follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMessage {
    pub stream: String,
    /// JSON schema of the records.
    pub schema: Value,
    pub key_properties: Vec<String>,
    pub bookmark_properties: Option<Vec<String>>,
}

/// A single row of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Map<String, Value>,
    /// Table version the record belongs to, used by full table replace flows.
    pub version: Option<u64>,
    pub time_extracted: Option<TimeExtracted>,
}

/// Extraction timestamp of a record.
///
/// The original text is kept so encoding reproduces the input byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeExtracted {
    raw: String,
    parsed: DateTime<Utc>,
}

impl TimeExtracted {
    pub fn parse(raw: &str) -> Result<Self, chrono::ParseError> {
        let parsed = DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc);

        Ok(Self {
            raw: raw.to_string(),
            parsed,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.parsed
    }
}

impl From<DateTime<Utc>> for TimeExtracted {
    fn from(value: DateTime<Utc>) -> Self {
        Self {
            raw: value.to_rfc3339(),
            parsed: value,
        }
    }
}

/// Snapshot of the extractor's replication position. Opaque to the router.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMessage {
    pub value: Value,
}

/// Tells the loader that `version` of a stream is now complete and replaces older ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateVersionMessage {
    pub stream: String,
    pub version: u64,
}
