use serde_json::{Map, Value};

use crate::bail;
use crate::error::{ErrorKind, TapflowResult};
use crate::protocol::message::{
    ActivateVersionMessage, Message, MessageType, RecordMessage, SchemaMessage, StateMessage,
    TYPE_KEY, TimeExtracted,
};
use crate::tapflow_error;

/// Decodes one protocol line.
///
/// Trailing whitespace, including the line terminator, is ignored. Optional members holding
/// `null` are treated as absent.
pub fn decode(line: &str) -> TapflowResult<Message> {
    let line = line.trim_end();

    let value: Value = serde_json::from_str(line).map_err(|err| {
        tapflow_error!(
            ErrorKind::ProtocolError,
            "Message line is not valid JSON",
            format!("{err}: {}", truncate(line)),
            source: err
        )
    })?;

    let Value::Object(mut object) = value else {
        bail!(
            ErrorKind::ProtocolError,
            "Message line is not a JSON object",
            truncate(line)
        );
    };

    let message_type = match object.remove(TYPE_KEY) {
        Some(Value::String(name)) => match MessageType::parse(&name) {
            Some(message_type) => message_type,
            None => bail!(
                ErrorKind::ProtocolError,
                "Unknown message type",
                format!("type `{name}`")
            ),
        },
        Some(Value::Null) | None => bail!(
            ErrorKind::ProtocolError,
            "Message has no type",
            truncate(line)
        ),
        Some(other) => bail!(
            ErrorKind::ProtocolError,
            "Message type is not a string",
            format!("type `{other}`")
        ),
    };

    let message = match message_type {
        MessageType::Schema => Message::Schema(SchemaMessage {
            stream: required_string(&mut object, message_type, "stream")?,
            schema: required(&mut object, message_type, "schema")?,
            key_properties: string_list(
                message_type,
                "key_properties",
                required(&mut object, message_type, "key_properties")?,
            )?,
            bookmark_properties: optional(&mut object, "bookmark_properties")
                .map(|value| string_list(message_type, "bookmark_properties", value))
                .transpose()?,
        }),
        MessageType::Record => {
            let stream = required_string(&mut object, message_type, "stream")?;
            let record = match required(&mut object, message_type, "record")? {
                Value::Object(record) => record,
                other => bail!(
                    ErrorKind::ProtocolError,
                    "RECORD member `record` is not an object",
                    format!("stream `{stream}`, found `{}`", truncate(&other.to_string()))
                ),
            };
            let version = optional(&mut object, "version")
                .map(|value| version(message_type, value))
                .transpose()?;
            let time_extracted = match optional(&mut object, "time_extracted") {
                Some(Value::String(raw)) => Some(TimeExtracted::parse(&raw).map_err(|err| {
                    tapflow_error!(
                        ErrorKind::ProtocolError,
                        "RECORD member `time_extracted` is not an RFC 3339 timestamp",
                        format!("stream `{stream}`, value `{raw}`"),
                        source: err
                    )
                })?),
                Some(other) => bail!(
                    ErrorKind::ProtocolError,
                    "RECORD member `time_extracted` is not a string",
                    format!("stream `{stream}`, found `{other}`")
                ),
                None => None,
            };

            Message::Record(RecordMessage {
                stream,
                record,
                version,
                time_extracted,
            })
        }
        MessageType::State => Message::State(StateMessage {
            value: required(&mut object, message_type, "value")?,
        }),
        MessageType::ActivateVersion => Message::ActivateVersion(ActivateVersionMessage {
            stream: required_string(&mut object, message_type, "stream")?,
            version: version(
                message_type,
                required(&mut object, message_type, "version")?,
            )?,
        }),
    };

    Ok(message)
}

/// Encodes a message without the trailing newline.
///
/// Object members are emitted in sorted key order, so equal messages always encode to the same
/// bytes.
pub fn encode(message: &Message) -> String {
    let mut object = Map::new();
    object.insert(
        TYPE_KEY.to_string(),
        Value::String(message.message_type().as_str().to_string()),
    );

    match message {
        Message::Schema(schema) => {
            object.insert("stream".to_string(), Value::String(schema.stream.clone()));
            object.insert("schema".to_string(), schema.schema.clone());
            object.insert(
                "key_properties".to_string(),
                string_array(&schema.key_properties),
            );
            if let Some(bookmark_properties) = &schema.bookmark_properties {
                object.insert(
                    "bookmark_properties".to_string(),
                    string_array(bookmark_properties),
                );
            }
        }
        Message::Record(record) => {
            object.insert("stream".to_string(), Value::String(record.stream.clone()));
            object.insert("record".to_string(), Value::Object(record.record.clone()));
            if let Some(version) = record.version {
                object.insert("version".to_string(), Value::from(version));
            }
            if let Some(time_extracted) = &record.time_extracted {
                object.insert(
                    "time_extracted".to_string(),
                    Value::String(time_extracted.as_str().to_string()),
                );
            }
        }
        Message::State(state) => {
            object.insert("value".to_string(), state.value.clone());
        }
        Message::ActivateVersion(activate) => {
            object.insert("stream".to_string(), Value::String(activate.stream.clone()));
            object.insert("version".to_string(), Value::from(activate.version));
        }
    }

    Value::Object(object).to_string()
}

fn optional(object: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match object.remove(key) {
        Some(Value::Null) | None => None,
        Some(value) => Some(value),
    }
}

fn required(
    object: &mut Map<String, Value>,
    message_type: MessageType,
    key: &'static str,
) -> TapflowResult<Value> {
    match optional(object, key) {
        Some(value) => Ok(value),
        None => bail!(
            ErrorKind::ProtocolError,
            "Message is missing a required member",
            format!("{} message without `{key}`", message_type.as_str())
        ),
    }
}

fn required_string(
    object: &mut Map<String, Value>,
    message_type: MessageType,
    key: &'static str,
) -> TapflowResult<String> {
    match required(object, message_type, key)? {
        Value::String(value) => Ok(value),
        other => bail!(
            ErrorKind::ProtocolError,
            "Message member has the wrong type",
            format!(
                "{} member `{key}` must be a string, found `{other}`",
                message_type.as_str()
            )
        ),
    }
}

fn string_list(
    message_type: MessageType,
    key: &'static str,
    value: Value,
) -> TapflowResult<Vec<String>> {
    let Value::Array(items) = value else {
        bail!(
            ErrorKind::ProtocolError,
            "Message member has the wrong type",
            format!("{} member `{key}` must be an array", message_type.as_str())
        );
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::String(item) => Ok(item),
            other => Err(tapflow_error!(
                ErrorKind::ProtocolError,
                "Message member has the wrong type",
                format!(
                    "{} member `{key}` must only contain strings, found `{other}`",
                    message_type.as_str()
                )
            )),
        })
        .collect()
}

fn version(message_type: MessageType, value: Value) -> TapflowResult<u64> {
    match value.as_u64() {
        Some(version) => Ok(version),
        None => bail!(
            ErrorKind::ProtocolError,
            "Message member has the wrong type",
            format!(
                "{} member `version` must be a non negative integer, found `{value}`",
                message_type.as_str()
            )
        ),
    }
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

/// Keeps error details readable when a stage emits very long garbage lines.
fn truncate(line: &str) -> String {
    const MAX_CHARS: usize = 256;

    if line.chars().count() <= MAX_CHARS {
        return line.to_string();
    }

    let mut truncated: String = line.chars().take(MAX_CHARS).collect();
    truncated.push_str("...");
    truncated
}
