//! Error types for BSON encoding, decoding and serialization

use thiserror::Error;

/// Result type alias for BSON operations
pub type Result<T> = std::result::Result<T, BsonError>;

/// Errors raised by the codec and the serialization layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BsonError {
    // ==================== Format Errors ====================

    #[error("Unexpected end of data: needed {needed} bytes at offset {offset}")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("Invalid element type 0x{tag:02x} at offset {offset}")]
    InvalidElementType { tag: u8, offset: usize },

    #[error("Length mismatch: {0}")]
    LengthMismatch(String),

    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    #[error("Missing NUL terminator for string at offset {0}")]
    MissingTerminator(usize),

    #[error("Invalid {kind} value 0x{byte:02x} at offset {offset}")]
    InvalidValue { kind: &'static str, byte: u8, offset: usize },

    #[error("Document too large: {size} bytes (max {max})")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("Invalid {component} state: {message}")]
    InvalidState {
        component: &'static str,
        message: String,
    },

    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    // ==================== Value Access ====================

    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // ==================== Resolution Errors ====================

    #[error("No serializer found for type {0}")]
    NoSerializer(String),

    #[error("A serializer is already registered for type {0}")]
    DuplicateSerializer(String),

    #[error("The serializer for type {0} cannot be overridden")]
    RegistrationRefused(String),

    #[error("Type {0} is already declared")]
    DuplicateDeclaration(String),

    #[error("Type {0} is not declared in the type catalog")]
    UndeclaredType(String),

    #[error("Ambiguous discriminator {discriminator} for nominal type {nominal} (candidates: {candidates})")]
    AmbiguousDiscriminator {
        discriminator: String,
        nominal: String,
        candidates: String,
    },

    #[error("Unknown discriminator value {discriminator} for nominal type {nominal}")]
    UnknownDiscriminator {
        discriminator: String,
        nominal: String,
    },

    #[error("Actual type {actual} is not assignable to nominal type {nominal}")]
    NotAssignable { actual: String, nominal: String },

    #[error("Element '{element}' does not match any member of {type_name}")]
    UnexpectedElement { element: String, type_name: String },

    #[error("Id error: {0}")]
    Id(String),
}

impl BsonError {
    /// Returns true for malformed or truncated binary input
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            BsonError::UnexpectedEof { .. }
                | BsonError::InvalidElementType { .. }
                | BsonError::LengthMismatch(_)
                | BsonError::InvalidUtf8(_)
                | BsonError::MissingTerminator(_)
                | BsonError::InvalidValue { .. }
        )
    }

    /// Returns true for serializer/discriminator resolution failures
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            BsonError::NoSerializer(_)
                | BsonError::UndeclaredType(_)
                | BsonError::AmbiguousDiscriminator { .. }
                | BsonError::UnknownDiscriminator { .. }
                | BsonError::NotAssignable { .. }
        )
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        BsonError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn reader_state(message: impl Into<String>) -> Self {
        BsonError::InvalidState {
            component: "reader",
            message: message.into(),
        }
    }

    pub(crate) fn writer_state(message: impl Into<String>) -> Self {
        BsonError::InvalidState {
            component: "writer",
            message: message.into(),
        }
    }
}
