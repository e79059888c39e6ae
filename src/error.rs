//! Error types for injection, verification and context handling.

use thiserror::Error;

/// A placeholder could not be parsed or could not be resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("malformed reference '{token}': {reason}")]
    Malformed { token: String, reason: String },

    #[error("no context named '{name}' under '{parent}'")]
    UnknownContext { name: String, parent: String },

    #[error("context '{context}' has no invoking user")]
    NoInvokingUser { context: String },

    #[error("context '{context}' has no actual response yet")]
    NoActualResponse { context: String },

    #[error("field path '{path}' not found in context '{context}'")]
    MissingField { context: String, path: String },

    #[error(
        "index {index} out of range (length {len}) at '{path}' in context '{context}'"
    )]
    IndexOutOfRange {
        context: String,
        path: String,
        index: usize,
        len: usize,
    },

    #[error(
        "occurrence {occurrence} requested but '{path}' in context '{context}' has {matches} matches"
    )]
    OccurrenceOutOfRange {
        context: String,
        path: String,
        occurrence: usize,
        matches: usize,
    },
}

/// Injection aborted on the first request field that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot inject '{field}' in context '{context}': {source}")]
pub struct InjectionError {
    pub context: String,
    pub field: String,
    #[source]
    pub source: ReferenceError,
}

/// Verification metadata in expected test data is malformed or
/// ambiguous.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidTestData {
    #[error("unrecognised {key} value '{value}'")]
    UnknownEnumValue { key: &'static str, value: String },

    #[error("{key} must be a string, got {value}")]
    NotAString { key: &'static str, value: String },

    #[error("data records share no field names to identify elements by")]
    NoCommonFields,

    #[error(
        "cannot derive element identifier: records {first} and {second} share the same values for [{fields}]; set __elementId__ explicitly"
    )]
    AmbiguousIdentity {
        fields: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("context '{parent}' already has a child named '{name}'")]
    DuplicateChild { parent: String, name: String },
}
