//! Low-level streaming reader and writer

mod reader;
mod writer;

pub use reader::{BsonReader, ReaderBookmark, ReaderState};
pub use writer::{BsonWriter, WriterState};
