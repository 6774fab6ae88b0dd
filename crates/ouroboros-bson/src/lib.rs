//! BSON for ouroboros
//!
//! This crate provides the value model, the binary codec and the
//! type-directed serialization layer used by the MongoDB driver.
//!
//! # Features
//! - `Bson` / `Document` value tree with ordered documents
//! - Streaming reader and writer with bookmarks
//! - Serializer registry with discriminator-based polymorphism
//! - Document id generation

#[macro_use]
mod macros;

pub mod codec;
pub mod datetime;
pub mod document;
pub mod error;
pub mod oid;
pub mod raw;
pub mod serialization;
pub mod value;

pub use datetime::DateTime;
pub use document::Document;
pub use error::{BsonError, Result};
pub use oid::ObjectId;
pub use raw::{BsonReader, BsonWriter};
pub use serialization::{SerializationContext, SerializationContextBuilder, TypeDeclaration, TypeKey};
pub use value::{Binary, BinarySubtype, Bson, ElementType, JavaScriptCodeWithScope, Regex, Timestamp};
