//! Whole-document encode and decode

use crate::document::Document;
use crate::error::{BsonError, Result};
use crate::raw::{BsonReader, BsonWriter};

/// Encode a document to wire bytes
pub fn to_vec(document: &Document) -> Result<Vec<u8>> {
    let mut writer = BsonWriter::new();
    writer.write_document(document)?;
    writer.into_bytes()
}

/// Encode a document, failing if it exceeds `max_size` bytes
pub fn to_vec_with_limit(document: &Document, max_size: usize) -> Result<Vec<u8>> {
    let mut writer = BsonWriter::new().with_max_document_size(max_size);
    writer.write_document(document)?;
    writer.into_bytes()
}

/// Decode exactly one document; trailing bytes are an error
pub fn from_slice(bytes: &[u8]) -> Result<Document> {
    let (document, consumed) = read_document_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(BsonError::LengthMismatch(format!(
            "document occupies {} bytes but buffer holds {}",
            consumed,
            bytes.len()
        )));
    }
    Ok(document)
}

/// Decode the document at the start of `bytes`, returning it and its length
pub fn read_document_prefix(bytes: &[u8]) -> Result<(Document, usize)> {
    let mut reader = BsonReader::new(bytes);
    let document = reader.read_document()?;
    Ok((document, reader.position()))
}

/// Decode back-to-back documents until the buffer is exhausted
///
/// With `expected` set, the count must match exactly.
pub fn read_document_sequence(bytes: &[u8], expected: Option<usize>) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (document, consumed) = read_document_prefix(&bytes[offset..]).map_err(|e| match e {
            BsonError::UnexpectedEof { offset: at, needed } => BsonError::UnexpectedEof {
                offset: offset + at,
                needed,
            },
            other => other,
        })?;
        documents.push(document);
        offset += consumed;
    }
    if let Some(expected) = expected {
        if documents.len() != expected {
            return Err(BsonError::LengthMismatch(format!(
                "expected {} documents, found {}",
                expected,
                documents.len()
            )));
        }
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bson_array, doc, Bson};

    #[test]
    fn test_roundtrip_nested() {
        let d = doc! {
            "a": doc! { "b": doc! { "c": bson_array![doc! { "d": 1 }, Bson::Null] } },
            "e": "f",
        };
        assert_eq!(from_slice(&to_vec(&d).unwrap()).unwrap(), d);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = to_vec(&doc! { "a": 1 }).unwrap();
        bytes.push(0);
        assert!(matches!(from_slice(&bytes), Err(BsonError::LengthMismatch(_))));
    }

    #[test]
    fn test_sequence() {
        let mut bytes = to_vec(&doc! { "n": 1 }).unwrap();
        bytes.extend(to_vec(&doc! { "n": 2 }).unwrap());
        let docs = read_document_sequence(&bytes, Some(2)).unwrap();
        assert_eq!(docs[1].get_i32("n").unwrap(), 2);
        assert!(read_document_sequence(&bytes, Some(3)).is_err());
        assert!(read_document_sequence(&[], None).unwrap().is_empty());
    }

    #[test]
    fn test_limit() {
        let d = doc! { "payload": "x".repeat(64) };
        assert!(to_vec_with_limit(&d, 1024).is_ok());
        assert!(matches!(
            to_vec_with_limit(&d, 16),
            Err(BsonError::DocumentTooLarge { .. })
        ));
    }
}
