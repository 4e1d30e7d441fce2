use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tapflow_config::shared::{ColumnTransformation, TransformationKind};

use crate::error::{ErrorKind, TapflowResult};
use crate::protocol::RecordMessage;
use crate::{bail, tapflow_error};

const HIDDEN: &str = "hidden";

/// Column rules of a pipeline, indexed by stream.
#[derive(Debug, Clone, Default)]
pub struct ColumnTransformer {
    rules: HashMap<String, Vec<(String, TransformationKind)>>,
}

impl ColumnTransformer {
    pub fn new(transformations: &[ColumnTransformation]) -> Self {
        let mut rules: HashMap<String, Vec<(String, TransformationKind)>> = HashMap::new();
        for transformation in transformations {
            rules
                .entry(transformation.stream.clone())
                .or_default()
                .push((transformation.column.clone(), transformation.kind));
        }

        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies the rules of the record's stream in definition order.
    ///
    /// Rules naming a column the record does not have are skipped. Null values stay null.
    pub fn apply(&self, record: &mut RecordMessage) -> TapflowResult<()> {
        let Some(rules) = self.rules.get(&record.stream) else {
            return Ok(());
        };

        for (column, kind) in rules {
            let Some(value) = record.record.get_mut(column) else {
                continue;
            };
            if value.is_null() {
                continue;
            }

            *value = transform_value(*kind, value).map_err(|err| {
                tapflow_error!(
                    ErrorKind::ProtocolError,
                    "Column transformation failed",
                    format!(
                        "stream `{}`, column `{column}`, {kind}: {}",
                        record.stream,
                        err.summary()
                    )
                )
            })?;
        }

        Ok(())
    }
}

fn transform_value(kind: TransformationKind, value: &Value) -> TapflowResult<Value> {
    let transformed = match kind {
        TransformationKind::SetNull => Value::Null,
        TransformationKind::Hash => Value::String(sha256_hex(&text_of(value))),
        TransformationKind::HashSkipFirst(count) => {
            let text = text_of(value);
            let split = text
                .char_indices()
                .nth(count)
                .map_or(text.len(), |(index, _)| index);
            let (kept, hashed) = text.split_at(split);
            Value::String(format!("{kept}{}", sha256_hex(hashed)))
        }
        TransformationKind::MaskDate => {
            let Some(text) = value.as_str() else {
                bail!(
                    ErrorKind::ProtocolError,
                    "Only string values can be date masked",
                    value
                );
            };
            Value::String(mask_date(text)?)
        }
        TransformationKind::MaskNumber => Value::from(0),
        TransformationKind::MaskHidden => Value::String(HIDDEN.to_string()),
    };

    Ok(transformed)
}

/// Strings are hashed as is, anything else as its JSON text.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn sha256_hex(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Moves a date or timestamp to January 1st of its year, keeping the time and offset.
fn mask_date(text: &str) -> TapflowResult<String> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
        let masked = timestamp
            .with_day(1)
            .and_then(|timestamp| timestamp.with_month(1));
        if let Some(masked) = masked {
            return Ok(masked.to_rfc3339());
        }
    }

    if let Ok(timestamp) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        let masked = timestamp
            .with_day(1)
            .and_then(|timestamp| timestamp.with_month(1));
        if let Some(masked) = masked {
            return Ok(masked.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(masked) = NaiveDate::from_ymd_opt(date.year(), 1, 1) {
            return Ok(masked.format("%Y-%m-%d").to_string());
        }
    }

    bail!(
        ErrorKind::ProtocolError,
        "Value is not a date or timestamp",
        text
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn record(stream: &str, values: Value) -> RecordMessage {
        let record: Map<String, Value> = serde_json::from_value(values).unwrap();

        RecordMessage {
            stream: stream.to_string(),
            record,
            version: None,
            time_extracted: None,
        }
    }

    fn rule(stream: &str, column: &str, kind: TransformationKind) -> ColumnTransformation {
        ColumnTransformation {
            stream: stream.to_string(),
            column: column.to_string(),
            kind,
        }
    }

    #[test]
    fn rules_apply_only_to_their_stream_and_existing_columns() {
        let transformer = ColumnTransformer::new(&[
            rule("users", "email", TransformationKind::Hash),
            rule("users", "missing", TransformationKind::SetNull),
            rule("users", "salary", TransformationKind::MaskNumber),
            rule("users", "phone", TransformationKind::HashSkipFirst(3)),
            rule("users", "notes", TransformationKind::MaskHidden),
            rule("users", "nickname", TransformationKind::Hash),
        ]);

        let mut users = record(
            "users",
            json!({
                "email": "a@example.com",
                "salary": 120000,
                "phone": "555-1234",
                "notes": "vip",
                "nickname": null
            }),
        );
        transformer.apply(&mut users).unwrap();

        assert_eq!(users.record["email"], json!(sha256_hex("a@example.com")));
        assert_eq!(users.record["salary"], json!(0));
        assert_eq!(users.record["phone"], json!(format!("555{}", sha256_hex("-1234"))));
        assert_eq!(users.record["notes"], json!("hidden"));
        assert_eq!(users.record["nickname"], Value::Null);
        assert!(!users.record.contains_key("missing"));

        let mut orders = record("orders", json!({"email": "b@example.com"}));
        transformer.apply(&mut orders).unwrap();
        assert_eq!(orders.record["email"], json!("b@example.com"));
    }

    #[test]
    fn mask_date_keeps_year_and_time() {
        assert_eq!(
            mask_date("2021-07-15T10:20:30+02:00").unwrap(),
            "2021-01-01T10:20:30+02:00"
        );
        assert_eq!(mask_date("2021-07-15").unwrap(), "2021-01-01");
        assert_eq!(
            mask_date("2021-07-15T10:20:30").unwrap(),
            "2021-01-01T10:20:30"
        );
    }

    #[test]
    fn mask_date_rejects_non_dates() {
        let transformer =
            ColumnTransformer::new(&[rule("users", "born", TransformationKind::MaskDate)]);
        let mut users = record("users", json!({"born": "yesterday"}));

        let err = transformer.apply(&mut users).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}
