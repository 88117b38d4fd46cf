use crate::kind::ArtifactKind;
use thiserror::Error;

/// A stored record that cannot be turned into an artifact. Callers skip the
/// record and keep going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Record key '{key}' has {found} fields, expected {expected}")]
    FieldCount { key: String, expected: usize, found: usize },

    #[error("Unknown record type '{0}'")]
    UnknownType(String),

    #[error("Invalid address '{0}'")]
    BadAddress(String),

    #[error("Invalid counter value '{0}'")]
    BadCounter(String),

    #[error("Empty {field} in record key '{key}'")]
    EmptyField { field: &'static str, key: String },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("Nothing to merge")]
    Empty,

    #[error("Cannot merge {found} records into a {expected} group")]
    MixedKinds { expected: ArtifactKind, found: ArtifactKind },
}

pub type MergeResult<T> = Result<T, MergeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrefixError {
    #[error("'{0}' is not a valid prefix or address")]
    Invalid(String),
}
