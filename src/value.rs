// ABOUTME: Cell values read from the source and checkpoint values persisted in config
// ABOUTME: Provides ordering, CSV rendering and JSON (de)serialization for both

use crate::error::SyncError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

/// A single cell of a fetched row.
///
/// Temporal and decimal columns are normalized to text by the driver so that
/// their lexical order matches their natural order.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Render the value as a CSV field. `NULL` becomes an empty field.
    pub fn as_csv_field(&self) -> Cow<'_, [u8]> {
        match self {
            SqlValue::Null => Cow::Borrowed(b""),
            SqlValue::Int(v) => Cow::Owned(v.to_string().into_bytes()),
            SqlValue::UInt(v) => Cow::Owned(v.to_string().into_bytes()),
            SqlValue::Float(v) => Cow::Owned(v.to_string().into_bytes()),
            SqlValue::Text(s) => Cow::Borrowed(s.as_bytes()),
            SqlValue::Bytes(b) => Cow::Borrowed(b.as_slice()),
        }
    }

    /// Compare two values of the ordering column.
    ///
    /// Returns `None` when the values are not comparable (mixed kinds or NaN).
    /// `NULL` sorts first, matching MySQL's ascending order.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        use SqlValue::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Null, _) => Some(Ordering::Less),
            (_, Null) => Some(Ordering::Greater),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (UInt(a), UInt(b)) => Some(a.cmp(b)),
            (Int(a), UInt(b)) => Some((*a as i128).cmp(&(*b as i128))),
            (UInt(a), Int(b)) => Some((*a as i128).cmp(&(*b as i128))),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
            (Text(a), Bytes(b)) => Some(a.as_bytes().cmp(b.as_slice())),
            (Bytes(a), Text(b)) => Some(a.as_slice().cmp(b.as_bytes())),
            _ => None,
        }
    }

    /// Convert an incremental-column value into a checkpoint.
    pub fn to_checkpoint(&self) -> Result<Checkpoint, SyncError> {
        match self {
            SqlValue::Int(v) => Ok(Checkpoint::Int(*v)),
            SqlValue::UInt(v) => i64::try_from(*v).map(Checkpoint::Int).map_err(|_| {
                SyncError::Fetch(format!("incremental value {} does not fit a checkpoint", v))
            }),
            SqlValue::Text(s) => Ok(Checkpoint::Text(s.clone())),
            SqlValue::Bytes(b) => String::from_utf8(b.clone())
                .map(Checkpoint::Text)
                .map_err(|_| SyncError::Fetch("incremental value is not valid UTF-8".to_string())),
            SqlValue::Null => Err(SyncError::Fetch(
                "incremental column contains NULL".to_string(),
            )),
            SqlValue::Float(v) => Err(SyncError::Fetch(format!(
                "floating point incremental value {} cannot be used as a checkpoint",
                v
            ))),
        }
    }
}

impl From<&Checkpoint> for SqlValue {
    fn from(checkpoint: &Checkpoint) -> Self {
        match checkpoint {
            Checkpoint::Int(v) => SqlValue::Int(*v),
            Checkpoint::Text(s) => SqlValue::Text(s.clone()),
        }
    }
}

/// Highest incremental-column value successfully synced for one table.
///
/// Stored in the config file as a JSON number or string under `last_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    Int(i64),
    Text(String),
}

impl Checkpoint {
    /// Compare two checkpoints the way MySQL compares the column against them.
    ///
    /// A string holding an integer compares numerically against an integer,
    /// since `id > '100'` is evaluated as a number on an integer column.
    /// Other mixes of integer and text have no order.
    pub fn compare(&self, other: &Checkpoint) -> Option<Ordering> {
        match (self, other) {
            (Checkpoint::Int(a), Checkpoint::Int(b)) => Some(a.cmp(b)),
            (Checkpoint::Text(a), Checkpoint::Text(b)) => Some(a.cmp(b)),
            (Checkpoint::Int(a), Checkpoint::Text(b)) => {
                b.trim().parse::<i64>().ok().map(|b| a.cmp(&b))
            }
            (Checkpoint::Text(a), Checkpoint::Int(b)) => {
                a.trim().parse::<i64>().ok().map(|a| a.cmp(b))
            }
        }
    }

    /// True if `self` is strictly beyond `current`.
    pub fn advances(&self, current: &Checkpoint) -> bool {
        self.compare(current) == Some(Ordering::Greater)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Int(v) => write!(f, "{}", v),
            Checkpoint::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Serialize for Checkpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Checkpoint::Int(v) => serializer.serialize_i64(*v),
            Checkpoint::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Checkpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        checkpoint_from_json(value)?
            .ok_or_else(|| serde::de::Error::custom("checkpoint cannot be empty"))
    }
}

/// Deserialize an optional checkpoint, treating `null` and `false` as "no checkpoint".
///
/// Older config files written by hand use `"last_id": false` to mean "never synced".
pub fn deserialize_optional_checkpoint<'de, D>(
    deserializer: D,
) -> Result<Option<Checkpoint>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    checkpoint_from_json(value)
}

fn checkpoint_from_json<E: serde::de::Error>(
    value: serde_json::Value,
) -> Result<Option<Checkpoint>, E> {
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(false) => Ok(None),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(|v| Some(Checkpoint::Int(v)))
            .ok_or_else(|| E::custom(format!("checkpoint {} is not a 64-bit integer", n))),
        serde_json::Value::String(s) => Ok(Some(Checkpoint::Text(s))),
        other => Err(E::custom(format!("unsupported checkpoint value: {}", other))),
    }
}
