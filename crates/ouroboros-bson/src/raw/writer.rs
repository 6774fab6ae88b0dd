//! Streaming BSON writer
//!
//! Documents and arrays are opened and closed explicitly; the length prefix of
//! each container is reserved on open and back-patched on close.

use crate::datetime::DateTime;
use crate::document::Document;
use crate::error::{BsonError, Result};
use crate::oid::ObjectId;
use crate::value::{Binary, BinarySubtype, Bson, ElementType, Regex, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Document,
    Array,
    /// Scope document of a code-with-scope value; `total_start` is where its outer length lives
    Scope { total_start: usize },
}

#[derive(Debug)]
struct Frame {
    start: usize,
    kind: ContainerKind,
    next_index: usize,
}

/// Where the writer is in the document grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Nothing written yet
    Initial,
    /// Expecting an element name (or the end of a document)
    Name,
    /// Expecting a value (or the end of an array)
    Value,
    /// The top-level document is complete
    Done,
}

/// Writes BSON into an owned buffer
#[derive(Debug)]
pub struct BsonWriter {
    buffer: Vec<u8>,
    frames: Vec<Frame>,
    state: WriterState,
    pending_name: Option<String>,
    max_document_size: Option<usize>,
}

impl Default for BsonWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BsonWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            frames: Vec::new(),
            state: WriterState::Initial,
            pending_name: None,
            max_document_size: None,
        }
    }

    /// Reject top-level documents larger than `max` bytes
    pub fn with_max_document_size(mut self, max: usize) -> Self {
        self.max_document_size = Some(max);
        self
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Nesting depth; 0 outside any document
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Consume the writer and return the encoded bytes
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.state != WriterState::Done {
            return Err(BsonError::writer_state(format!(
                "document is incomplete (state {:?})",
                self.state
            )));
        }
        Ok(self.buffer)
    }

    pub fn write_name(&mut self, name: &str) -> Result<()> {
        if self.state != WriterState::Name {
            return Err(BsonError::writer_state(format!(
                "write_name called in state {:?}",
                self.state
            )));
        }
        if name.as_bytes().contains(&0) {
            return Err(BsonError::writer_state(format!(
                "element name {:?} contains a NUL byte",
                name
            )));
        }
        self.pending_name = Some(name.to_string());
        self.state = WriterState::Value;
        Ok(())
    }

    pub fn write_start_document(&mut self) -> Result<()> {
        match self.state {
            WriterState::Initial => {}
            WriterState::Value => self.begin_element(ElementType::Document)?,
            other => {
                return Err(BsonError::writer_state(format!(
                    "write_start_document called in state {:?}",
                    other
                )))
            }
        }
        self.open(ContainerKind::Document);
        Ok(())
    }

    pub fn write_end_document(&mut self) -> Result<()> {
        match self.frames.last() {
            Some(frame)
                if self.state == WriterState::Name && frame.kind != ContainerKind::Array => {}
            _ => {
                return Err(BsonError::writer_state(format!(
                    "write_end_document called in state {:?}",
                    self.state
                )))
            }
        }
        self.close()
    }

    pub fn write_start_array(&mut self) -> Result<()> {
        self.begin_element(ElementType::Array)?;
        self.open(ContainerKind::Array);
        Ok(())
    }

    pub fn write_end_array(&mut self) -> Result<()> {
        match self.frames.last() {
            Some(frame) if frame.kind == ContainerKind::Array && self.state == WriterState::Value => {}
            _ => {
                return Err(BsonError::writer_state(format!(
                    "write_end_array called in state {:?}",
                    self.state
                )))
            }
        }
        self.close()
    }

    pub fn write_double(&mut self, value: f64) -> Result<()> {
        self.begin_element(ElementType::Double)?;
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.begin_element(ElementType::String)?;
        self.put_string(value);
        self.finish_value();
        Ok(())
    }

    pub fn write_binary(&mut self, value: &Binary) -> Result<()> {
        self.begin_element(ElementType::Binary)?;
        let len = value.bytes.len();
        if value.subtype == BinarySubtype::BinaryOld {
            self.buffer.extend_from_slice(&((len + 4) as i32).to_le_bytes());
            self.buffer.push(u8::from(value.subtype));
            self.buffer.extend_from_slice(&(len as i32).to_le_bytes());
        } else {
            self.buffer.extend_from_slice(&(len as i32).to_le_bytes());
            self.buffer.push(u8::from(value.subtype));
        }
        self.buffer.extend_from_slice(&value.bytes);
        self.finish_value();
        Ok(())
    }

    pub fn write_undefined(&mut self) -> Result<()> {
        self.begin_element(ElementType::Undefined)?;
        self.finish_value();
        Ok(())
    }

    pub fn write_object_id(&mut self, value: ObjectId) -> Result<()> {
        self.begin_element(ElementType::ObjectId)?;
        self.buffer.extend_from_slice(&value.bytes());
        self.finish_value();
        Ok(())
    }

    pub fn write_boolean(&mut self, value: bool) -> Result<()> {
        self.begin_element(ElementType::Boolean)?;
        self.buffer.push(value as u8);
        self.finish_value();
        Ok(())
    }

    pub fn write_datetime(&mut self, value: DateTime) -> Result<()> {
        self.begin_element(ElementType::DateTime)?;
        self.buffer
            .extend_from_slice(&value.timestamp_millis().to_le_bytes());
        self.finish_value();
        Ok(())
    }

    pub fn write_null(&mut self) -> Result<()> {
        self.begin_element(ElementType::Null)?;
        self.finish_value();
        Ok(())
    }

    pub fn write_regex(&mut self, value: &Regex) -> Result<()> {
        self.begin_element(ElementType::RegularExpression)?;
        self.put_cstring(&value.pattern)?;
        self.put_cstring(&value.options)?;
        self.finish_value();
        Ok(())
    }

    pub fn write_javascript(&mut self, code: &str) -> Result<()> {
        self.begin_element(ElementType::JavaScriptCode)?;
        self.put_string(code);
        self.finish_value();
        Ok(())
    }

    pub fn write_symbol(&mut self, value: &str) -> Result<()> {
        self.begin_element(ElementType::Symbol)?;
        self.put_string(value);
        self.finish_value();
        Ok(())
    }

    /// Write code-with-scope; the scope document is written from `scope`
    pub fn write_javascript_with_scope(&mut self, code: &str, scope: &Document) -> Result<()> {
        self.begin_element(ElementType::JavaScriptCodeWithScope)?;
        let total_start = self.buffer.len();
        self.buffer.extend_from_slice(&0i32.to_le_bytes());
        self.put_string(code);
        self.state = WriterState::Initial;
        self.open(ContainerKind::Scope { total_start });
        for (name, value) in scope {
            self.write_name(name)?;
            self.write_value(value)?;
        }
        self.close()
    }

    pub fn write_int32(&mut self, value: i32) -> Result<()> {
        self.begin_element(ElementType::Int32)?;
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    pub fn write_timestamp(&mut self, value: Timestamp) -> Result<()> {
        self.begin_element(ElementType::Timestamp)?;
        self.buffer.extend_from_slice(&value.to_u64().to_le_bytes());
        self.finish_value();
        Ok(())
    }

    pub fn write_int64(&mut self, value: i64) -> Result<()> {
        self.begin_element(ElementType::Int64)?;
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    pub fn write_min_key(&mut self) -> Result<()> {
        self.begin_element(ElementType::MinKey)?;
        self.finish_value();
        Ok(())
    }

    pub fn write_max_key(&mut self) -> Result<()> {
        self.begin_element(ElementType::MaxKey)?;
        self.finish_value();
        Ok(())
    }

    /// Write a whole document at the current position (top level or as a value)
    pub fn write_document(&mut self, document: &Document) -> Result<()> {
        self.write_start_document()?;
        for (name, value) in document {
            self.write_name(name)?;
            self.write_value(value)?;
        }
        self.write_end_document()
    }

    /// Write any value at the current value position
    pub fn write_value(&mut self, value: &Bson) -> Result<()> {
        match value {
            Bson::Double(v) => self.write_double(*v),
            Bson::String(s) => self.write_string(s),
            Bson::Document(d) => self.write_document(d),
            Bson::Array(items) => {
                self.write_start_array()?;
                for item in items {
                    self.write_value(item)?;
                }
                self.write_end_array()
            }
            Bson::Binary(b) => self.write_binary(b),
            Bson::Undefined => self.write_undefined(),
            Bson::ObjectId(oid) => self.write_object_id(*oid),
            Bson::Boolean(b) => self.write_boolean(*b),
            Bson::DateTime(dt) => self.write_datetime(*dt),
            Bson::Null => self.write_null(),
            Bson::RegularExpression(re) => self.write_regex(re),
            Bson::JavaScriptCode(code) => self.write_javascript(code),
            Bson::Symbol(s) => self.write_symbol(s),
            Bson::JavaScriptCodeWithScope(c) => self.write_javascript_with_scope(&c.code, &c.scope),
            Bson::Int32(v) => self.write_int32(*v),
            Bson::Timestamp(ts) => self.write_timestamp(*ts),
            Bson::Int64(v) => self.write_int64(*v),
            Bson::MaxKey => self.write_max_key(),
            Bson::MinKey => self.write_min_key(),
        }
    }

    fn begin_element(&mut self, ty: ElementType) -> Result<()> {
        if self.state != WriterState::Value {
            return Err(BsonError::writer_state(format!(
                "cannot write a {} value in state {:?}",
                ty, self.state
            )));
        }
        let name = match self.frames.last_mut() {
            Some(frame) if frame.kind == ContainerKind::Array => {
                let index = frame.next_index;
                frame.next_index += 1;
                index.to_string()
            }
            Some(_) => self
                .pending_name
                .take()
                .ok_or_else(|| BsonError::writer_state("value written without a name"))?,
            None => return Err(BsonError::writer_state("value written outside a document")),
        };
        self.buffer.push(ty as u8);
        self.put_cstring(&name)
    }

    fn finish_value(&mut self) {
        self.state = match self.frames.last() {
            Some(frame) if frame.kind == ContainerKind::Array => WriterState::Value,
            Some(_) => WriterState::Name,
            None => WriterState::Done,
        };
    }

    fn open(&mut self, kind: ContainerKind) {
        let start = self.buffer.len();
        self.buffer.extend_from_slice(&0i32.to_le_bytes());
        self.frames.push(Frame {
            start,
            kind,
            next_index: 0,
        });
        self.state = match kind {
            ContainerKind::Array => WriterState::Value,
            _ => WriterState::Name,
        };
    }

    fn close(&mut self) -> Result<()> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| BsonError::writer_state("no open container"))?;
        self.buffer.push(0);
        let size = self.buffer.len() - frame.start;
        self.patch_length(frame.start, size);
        if let ContainerKind::Scope { total_start } = frame.kind {
            let total = self.buffer.len() - total_start;
            self.patch_length(total_start, total);
        }
        if self.frames.is_empty() {
            if let Some(max) = self.max_document_size {
                if size > max {
                    return Err(BsonError::DocumentTooLarge { size, max });
                }
            }
        }
        self.finish_value();
        Ok(())
    }

    fn patch_length(&mut self, at: usize, len: usize) {
        self.buffer[at..at + 4].copy_from_slice(&(len as i32).to_le_bytes());
    }

    fn put_string(&mut self, value: &str) {
        self.buffer
            .extend_from_slice(&((value.len() + 1) as i32).to_le_bytes());
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
    }

    fn put_cstring(&mut self, value: &str) -> Result<()> {
        if value.as_bytes().contains(&0) {
            return Err(BsonError::writer_state(format!(
                "C string {:?} contains a NUL byte",
                value
            )));
        }
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_empty_document_bytes() {
        let mut w = BsonWriter::new();
        w.write_start_document().unwrap();
        w.write_end_document().unwrap();
        assert_eq!(w.into_bytes().unwrap(), vec![5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_int32_element_bytes() {
        let mut w = BsonWriter::new();
        w.write_document(&doc! { "a": 1 }).unwrap();
        assert_eq!(
            w.into_bytes().unwrap(),
            vec![12, 0, 0, 0, 0x10, b'a', 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_array_indices_are_generated() {
        let mut w = BsonWriter::new();
        w.write_start_document().unwrap();
        w.write_name("xs").unwrap();
        w.write_start_array().unwrap();
        w.write_boolean(true).unwrap();
        w.write_boolean(false).unwrap();
        w.write_end_array().unwrap();
        w.write_end_document().unwrap();
        let bytes = w.into_bytes().unwrap();
        let decoded = Document::from_slice(&bytes).unwrap();
        assert_eq!(decoded, doc! { "xs": crate::bson_array![true, false] });
        // "0" and "1" keys inside the array
        assert!(bytes.windows(2).any(|w| w == [b'0', 0]));
        assert!(bytes.windows(2).any(|w| w == [b'1', 0]));
    }

    #[test]
    fn test_value_without_name_rejected() {
        let mut w = BsonWriter::new();
        w.write_start_document().unwrap();
        assert!(w.write_int32(1).is_err());
    }

    #[test]
    fn test_incomplete_document_rejected() {
        let mut w = BsonWriter::new();
        w.write_start_document().unwrap();
        assert!(w.into_bytes().is_err());
    }

    #[test]
    fn test_nul_in_name_rejected() {
        let mut w = BsonWriter::new();
        w.write_start_document().unwrap();
        assert!(w.write_name("a\0b").is_err());
    }

    #[test]
    fn test_max_document_size() {
        let mut w = BsonWriter::new().with_max_document_size(10);
        let err = w.write_document(&doc! { "abc": "defgh" }).unwrap_err();
        assert!(matches!(err, BsonError::DocumentTooLarge { max: 10, .. }));
    }

    #[test]
    fn test_old_binary_has_inner_length() {
        let mut w = BsonWriter::new();
        let bin = Binary::new(BinarySubtype::BinaryOld, vec![9, 9]);
        w.write_document(&doc! { "b": bin }).unwrap();
        let bytes = w.into_bytes().unwrap();
        // header(4) + tag(1) + "b\0"(2) = 7; outer length, subtype, inner length
        assert_eq!(&bytes[7..11], &6i32.to_le_bytes());
        assert_eq!(bytes[11], 0x02);
        assert_eq!(&bytes[12..16], &2i32.to_le_bytes());
    }
}
