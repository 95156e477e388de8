//! Deriving document identifiers from message payloads.

use std::{fmt::Display, str::FromStr};

use serde_json::Value;

/// Why no identifier could be derived from a payload
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload has no '{0}' field")]
    MissingField(IdField),

    #[error("field '{field}' is not a {expected}")]
    WrongType {
        field: IdField,
        expected: &'static str,
    },

    #[error("field '{0}' is empty")]
    Empty(IdField),

    #[error("'{0}' is not a usable document id")]
    Reserved(String),
}

/// Which field of a payload holds its identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdField {
    /// The string at `meta.id`
    #[default]
    MetaId,
    /// The integer at the top-level `id`
    NumericId,
}

impl Display for IdField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetaId => f.write_str("meta.id"),
            Self::NumericId => f.write_str("id"),
        }
    }
}

impl FromStr for IdField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meta.id" => Ok(Self::MetaId),
            "id" => Ok(Self::NumericId),
            other => Err(format!(
                "unknown id field '{other}', expected 'meta.id' or 'id'"
            )),
        }
    }
}

impl IdField {
    /// Extract the identifier of `payload`.
    ///
    /// Only depends on the payload, so the same message always maps to the same document.
    pub fn extract(&self, payload: &[u8]) -> Result<DocumentId, IdError> {
        let value: Value = serde_json::from_slice(payload)?;
        match self {
            Self::MetaId => {
                let id = value
                    .get("meta")
                    .and_then(|meta| meta.get("id"))
                    .ok_or(IdError::MissingField(*self))?;
                match id {
                    Value::String(s) if s.is_empty() => Err(IdError::Empty(*self)),
                    Value::String(s) if s == "." || s == ".." => Err(IdError::Reserved(s.clone())),
                    Value::String(s) => Ok(DocumentId(s.clone())),
                    _ => Err(IdError::WrongType {
                        field: *self,
                        expected: "string",
                    }),
                }
            }
            Self::NumericId => {
                let id = value.get("id").ok_or(IdError::MissingField(*self))?;
                let wrong_type = || IdError::WrongType {
                    field: *self,
                    expected: "whole number",
                };
                let Value::Number(n) = id else {
                    return Err(wrong_type());
                };
                if let Some(i) = n.as_i64() {
                    Ok(DocumentId(i.to_string()))
                } else if let Some(u) = n.as_u64() {
                    Ok(DocumentId(u.to_string()))
                } else {
                    // large ids are sometimes serialized in exponent notation
                    match n.as_f64() {
                        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 2f64.powi(63) => {
                            Ok(DocumentId((f as i64).to_string()))
                        }
                        _ => Err(wrong_type()),
                    }
                }
            }
        }
    }
}

/// Identifier of a document in the store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
