use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const HASH_SKIP_FIRST_PREFIX: &str = "HASH-SKIP-FIRST-";

/// A rule rewriting one column of one stream's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ColumnTransformation {
    pub stream: String,
    pub column: String,
    #[serde(rename = "type")]
    pub kind: TransformationKind,
}

/// What a [`ColumnTransformation`] does to the column value.
///
/// Serialized with the upper-case names used by field transformers, for example `HASH` or
/// `HASH-SKIP-FIRST-3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransformationKind {
    SetNull,
    Hash,
    HashSkipFirst(usize),
    MaskDate,
    MaskNumber,
    MaskHidden,
}

impl fmt::Display for TransformationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformationKind::SetNull => f.write_str("SET-NULL"),
            TransformationKind::Hash => f.write_str("HASH"),
            TransformationKind::HashSkipFirst(n) => write!(f, "{HASH_SKIP_FIRST_PREFIX}{n}"),
            TransformationKind::MaskDate => f.write_str("MASK-DATE"),
            TransformationKind::MaskNumber => f.write_str("MASK-NUMBER"),
            TransformationKind::MaskHidden => f.write_str("MASK-HIDDEN"),
        }
    }
}

impl FromStr for TransformationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SET-NULL" => Ok(TransformationKind::SetNull),
            "HASH" => Ok(TransformationKind::Hash),
            "MASK-DATE" => Ok(TransformationKind::MaskDate),
            "MASK-NUMBER" => Ok(TransformationKind::MaskNumber),
            "MASK-HIDDEN" => Ok(TransformationKind::MaskHidden),
            other => match other.strip_prefix(HASH_SKIP_FIRST_PREFIX) {
                Some(count) => count
                    .parse()
                    .map(TransformationKind::HashSkipFirst)
                    .map_err(|_| format!("invalid character count in transformation `{other}`")),
                None => Err(format!("unknown transformation `{other}`")),
            },
        }
    }
}

impl TryFrom<String> for TransformationKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransformationKind> for String {
    fn from(value: TransformationKind) -> Self {
        value.to_string()
    }
}
