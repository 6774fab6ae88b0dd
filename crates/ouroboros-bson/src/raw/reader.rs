//! Bounds-checked BSON reader over a byte slice
//!
//! Every container records the end offset declared by its length prefix.
//! Reads may never cross that end, and a container's terminating NUL must sit
//! exactly at it.

use crate::datetime::DateTime;
use crate::document::Document;
use crate::error::{BsonError, Result};
use crate::oid::ObjectId;
use crate::value::{Binary, BinarySubtype, Bson, ElementType, JavaScriptCodeWithScope, Regex, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Document,
    Array,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    end: usize,
    kind: ContainerKind,
}

/// Where the reader is in the document grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Before the top-level document
    Initial,
    /// Expecting an element type (or the container terminator)
    Type,
    /// A type and name were read; the value is next
    Value,
    /// The terminator of the current container was read
    EndOfContainer,
    /// The top-level document has been consumed
    Done,
}

/// Saved reader position, see [`BsonReader::bookmark`]
#[derive(Debug, Clone)]
pub struct ReaderBookmark {
    position: usize,
    frames: Vec<Frame>,
    state: ReaderState,
    current_type: Option<ElementType>,
    current_name: Option<String>,
}

/// Reads BSON from a borrowed buffer
#[derive(Debug)]
pub struct BsonReader<'a> {
    data: &'a [u8],
    position: usize,
    frames: Vec<Frame>,
    state: ReaderState,
    current_type: Option<ElementType>,
    current_name: Option<String>,
}

impl<'a> BsonReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            frames: Vec::new(),
            state: ReaderState::Initial,
            current_type: None,
            current_name: None,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Type of the value at the current position, once known
    pub fn current_type(&self) -> Option<ElementType> {
        match self.state {
            ReaderState::Value => self.current_type,
            _ => None,
        }
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current_name.as_deref()
    }

    /// Capture the full reader position
    pub fn bookmark(&self) -> ReaderBookmark {
        ReaderBookmark {
            position: self.position,
            frames: self.frames.clone(),
            state: self.state,
            current_type: self.current_type,
            current_name: self.current_name.clone(),
        }
    }

    /// Restore a position captured by [`bookmark`](Self::bookmark)
    pub fn return_to_bookmark(&mut self, bookmark: &ReaderBookmark) {
        self.position = bookmark.position;
        self.frames = bookmark.frames.clone();
        self.state = bookmark.state;
        self.current_type = bookmark.current_type;
        self.current_name = bookmark.current_name.clone();
    }

    /// Read the next element header; `None` means the current container ended
    pub fn read_bson_type(&mut self) -> Result<Option<ElementType>> {
        self.expect_state(ReaderState::Type, "read_bson_type")?;
        let offset = self.position;
        let tag = self.read_u8()?;
        if tag == 0 {
            let frame = self
                .frames
                .last()
                .ok_or_else(|| BsonError::reader_state("terminator outside a container"))?;
            if self.position != frame.end {
                return Err(BsonError::LengthMismatch(format!(
                    "container terminator at offset {} but declared end is {}",
                    offset, frame.end
                )));
            }
            self.state = ReaderState::EndOfContainer;
            self.current_type = None;
            return Ok(None);
        }
        let ty = ElementType::from_u8(tag).ok_or(BsonError::InvalidElementType { tag, offset })?;
        let name = self.read_cstring()?;
        self.current_type = Some(ty);
        self.current_name = Some(name);
        self.state = ReaderState::Value;
        Ok(Some(ty))
    }

    /// Name of the element whose header was just read
    pub fn read_name(&self) -> Result<&str> {
        self.expect_state(ReaderState::Value, "read_name")?;
        self.current_name
            .as_deref()
            .ok_or_else(|| BsonError::reader_state("no current element name"))
    }

    pub fn read_start_document(&mut self) -> Result<()> {
        match self.state {
            ReaderState::Initial => {}
            ReaderState::Value => self.expect_type(ElementType::Document)?,
            other => {
                return Err(BsonError::reader_state(format!(
                    "read_start_document called in state {:?}",
                    other
                )))
            }
        }
        self.open(ContainerKind::Document)
    }

    pub fn read_end_document(&mut self) -> Result<()> {
        self.close(ContainerKind::Document)
    }

    pub fn read_start_array(&mut self) -> Result<()> {
        self.expect_state(ReaderState::Value, "read_start_array")?;
        self.expect_type(ElementType::Array)?;
        self.open(ContainerKind::Array)
    }

    pub fn read_end_array(&mut self) -> Result<()> {
        self.close(ContainerKind::Array)
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.begin_value(ElementType::Double)?;
        let v = f64::from_le_bytes(self.read_array::<8>()?);
        self.finish_value();
        Ok(v)
    }

    pub fn read_string(&mut self) -> Result<String> {
        self.begin_value(ElementType::String)?;
        let v = self.read_len_string()?;
        self.finish_value();
        Ok(v)
    }

    pub fn read_symbol(&mut self) -> Result<String> {
        self.begin_value(ElementType::Symbol)?;
        let v = self.read_len_string()?;
        self.finish_value();
        Ok(v)
    }

    pub fn read_javascript(&mut self) -> Result<String> {
        self.begin_value(ElementType::JavaScriptCode)?;
        let v = self.read_len_string()?;
        self.finish_value();
        Ok(v)
    }

    pub fn read_binary(&mut self) -> Result<Binary> {
        self.begin_value(ElementType::Binary)?;
        let offset = self.position;
        let len = self.read_length()?;
        let subtype = BinarySubtype::from(self.read_u8()?);
        let bytes = if subtype == BinarySubtype::BinaryOld {
            let inner = self.read_length()?;
            if inner + 4 != len {
                return Err(BsonError::LengthMismatch(format!(
                    "old binary at offset {} declares {} bytes but inner length is {}",
                    offset, len, inner
                )));
            }
            self.take(inner)?.to_vec()
        } else {
            self.take(len)?.to_vec()
        };
        self.finish_value();
        Ok(Binary { subtype, bytes })
    }

    /// Subtype of the binary value at the current position, without consuming it
    pub fn peek_binary_subtype(&self) -> Result<BinarySubtype> {
        self.expect_state(ReaderState::Value, "peek_binary_subtype")?;
        self.expect_type(ElementType::Binary)?;
        let at = self.position + 4;
        if at >= self.limit() {
            return Err(BsonError::UnexpectedEof {
                offset: self.position,
                needed: 5,
            });
        }
        Ok(BinarySubtype::from(self.data[at]))
    }

    pub fn read_undefined(&mut self) -> Result<()> {
        self.begin_value(ElementType::Undefined)?;
        self.finish_value();
        Ok(())
    }

    pub fn read_object_id(&mut self) -> Result<ObjectId> {
        self.begin_value(ElementType::ObjectId)?;
        let v = ObjectId::from_bytes(self.read_array::<12>()?);
        self.finish_value();
        Ok(v)
    }

    pub fn read_boolean(&mut self) -> Result<bool> {
        self.begin_value(ElementType::Boolean)?;
        let offset = self.position;
        let v = match self.read_u8()? {
            0 => false,
            1 => true,
            byte => {
                return Err(BsonError::InvalidValue {
                    kind: "boolean",
                    byte,
                    offset,
                })
            }
        };
        self.finish_value();
        Ok(v)
    }

    pub fn read_datetime(&mut self) -> Result<DateTime> {
        self.begin_value(ElementType::DateTime)?;
        let v = DateTime::from_millis(i64::from_le_bytes(self.read_array::<8>()?));
        self.finish_value();
        Ok(v)
    }

    pub fn read_null(&mut self) -> Result<()> {
        self.begin_value(ElementType::Null)?;
        self.finish_value();
        Ok(())
    }

    pub fn read_regex(&mut self) -> Result<Regex> {
        self.begin_value(ElementType::RegularExpression)?;
        let pattern = self.read_cstring()?;
        let options = self.read_cstring()?;
        self.finish_value();
        Ok(Regex { pattern, options })
    }

    pub fn read_javascript_with_scope(&mut self) -> Result<JavaScriptCodeWithScope> {
        self.begin_value(ElementType::JavaScriptCodeWithScope)?;
        let start = self.position;
        let total = self.read_length()?;
        let code = self.read_len_string()?;
        let scope = self.read_embedded_document()?;
        if self.position - start != total {
            return Err(BsonError::LengthMismatch(format!(
                "code with scope at offset {} declares {} bytes but spans {}",
                start,
                total,
                self.position - start
            )));
        }
        self.finish_value();
        Ok(JavaScriptCodeWithScope { code, scope })
    }

    pub fn read_int32(&mut self) -> Result<i32> {
        self.begin_value(ElementType::Int32)?;
        let v = i32::from_le_bytes(self.read_array::<4>()?);
        self.finish_value();
        Ok(v)
    }

    pub fn read_timestamp(&mut self) -> Result<Timestamp> {
        self.begin_value(ElementType::Timestamp)?;
        let v = Timestamp::from_u64(u64::from_le_bytes(self.read_array::<8>()?));
        self.finish_value();
        Ok(v)
    }

    pub fn read_int64(&mut self) -> Result<i64> {
        self.begin_value(ElementType::Int64)?;
        let v = i64::from_le_bytes(self.read_array::<8>()?);
        self.finish_value();
        Ok(v)
    }

    pub fn read_min_key(&mut self) -> Result<()> {
        self.begin_value(ElementType::MinKey)?;
        self.finish_value();
        Ok(())
    }

    pub fn read_max_key(&mut self) -> Result<()> {
        self.begin_value(ElementType::MaxKey)?;
        self.finish_value();
        Ok(())
    }

    /// Read a whole document, at the top level or as the current value
    pub fn read_document(&mut self) -> Result<Document> {
        self.read_start_document()?;
        let mut document = Document::new();
        while self.read_bson_type()?.is_some() {
            let name = self.current_name.take().unwrap_or_default();
            let value = self.read_value()?;
            document.push(name, value);
        }
        self.read_end_document()?;
        Ok(document)
    }

    /// Read the current value into the value model
    pub fn read_value(&mut self) -> Result<Bson> {
        self.expect_state(ReaderState::Value, "read_value")?;
        let ty = self
            .current_type
            .ok_or_else(|| BsonError::reader_state("no current element type"))?;
        let value = match ty {
            ElementType::Double => Bson::Double(self.read_double()?),
            ElementType::String => Bson::String(self.read_string()?),
            ElementType::Document => Bson::Document(self.read_document()?),
            ElementType::Array => {
                self.read_start_array()?;
                let mut items = Vec::new();
                while self.read_bson_type()?.is_some() {
                    items.push(self.read_value()?);
                }
                self.read_end_array()?;
                Bson::Array(items)
            }
            ElementType::Binary => Bson::Binary(self.read_binary()?),
            ElementType::Undefined => {
                self.read_undefined()?;
                Bson::Undefined
            }
            ElementType::ObjectId => Bson::ObjectId(self.read_object_id()?),
            ElementType::Boolean => Bson::Boolean(self.read_boolean()?),
            ElementType::DateTime => Bson::DateTime(self.read_datetime()?),
            ElementType::Null => {
                self.read_null()?;
                Bson::Null
            }
            ElementType::RegularExpression => Bson::RegularExpression(self.read_regex()?),
            ElementType::JavaScriptCode => Bson::JavaScriptCode(self.read_javascript()?),
            ElementType::Symbol => Bson::Symbol(self.read_symbol()?),
            ElementType::JavaScriptCodeWithScope => {
                Bson::JavaScriptCodeWithScope(self.read_javascript_with_scope()?)
            }
            ElementType::Int32 => Bson::Int32(self.read_int32()?),
            ElementType::Timestamp => Bson::Timestamp(self.read_timestamp()?),
            ElementType::Int64 => Bson::Int64(self.read_int64()?),
            ElementType::MaxKey => {
                self.read_max_key()?;
                Bson::MaxKey
            }
            ElementType::MinKey => {
                self.read_min_key()?;
                Bson::MinKey
            }
        };
        Ok(value)
    }

    /// Skip the current value without materializing it
    pub fn skip_value(&mut self) -> Result<()> {
        self.expect_state(ReaderState::Value, "skip_value")?;
        let ty = self
            .current_type
            .ok_or_else(|| BsonError::reader_state("no current element type"))?;
        let size = match ty {
            ElementType::Double
            | ElementType::DateTime
            | ElementType::Int64
            | ElementType::Timestamp => 8,
            ElementType::Int32 => 4,
            ElementType::ObjectId => 12,
            ElementType::Boolean => 1,
            ElementType::Undefined
            | ElementType::Null
            | ElementType::MinKey
            | ElementType::MaxKey => 0,
            ElementType::String | ElementType::Symbol | ElementType::JavaScriptCode => {
                4 + self.peek_length()?
            }
            ElementType::Binary => 5 + self.peek_length()?,
            ElementType::Document
            | ElementType::Array
            | ElementType::JavaScriptCodeWithScope => self.peek_length()?,
            ElementType::RegularExpression => {
                let pattern = self.cstring_len(self.position)?;
                let options = self.cstring_len(self.position + pattern)?;
                pattern + options
            }
        };
        self.take(size)?;
        self.finish_value();
        Ok(())
    }

    /// Scan the current document for `name`
    ///
    /// On success the reader is positioned at that element's value. Elements
    /// before it are skipped; callers that need them should bookmark first.
    pub fn find_element(&mut self, name: &str) -> Result<Option<ElementType>> {
        while let Some(ty) = self.read_bson_type()? {
            if self.current_name.as_deref() == Some(name) {
                return Ok(Some(ty));
            }
            self.skip_value()?;
        }
        Ok(None)
    }

    fn read_embedded_document(&mut self) -> Result<Document> {
        let saved_type = self.current_type;
        self.current_type = Some(ElementType::Document);
        let document = self.read_document();
        self.current_type = saved_type;
        let document = document?;
        self.state = ReaderState::Value;
        Ok(document)
    }

    fn open(&mut self, kind: ContainerKind) -> Result<()> {
        let start = self.position;
        let len = self.read_length()?;
        if len < 5 {
            return Err(BsonError::LengthMismatch(format!(
                "container at offset {} declares impossible length {}",
                start, len
            )));
        }
        let end = start + len;
        if end > self.limit() {
            return Err(BsonError::UnexpectedEof {
                offset: start,
                needed: len,
            });
        }
        self.frames.push(Frame { end, kind });
        self.state = ReaderState::Type;
        Ok(())
    }

    fn close(&mut self, kind: ContainerKind) -> Result<()> {
        self.expect_state(ReaderState::EndOfContainer, "end of container")?;
        match self.frames.last() {
            Some(frame) if frame.kind == kind => {}
            _ => return Err(BsonError::reader_state(format!("not inside {:?}", kind))),
        }
        self.frames.pop();
        self.finish_value();
        Ok(())
    }

    fn begin_value(&mut self, ty: ElementType) -> Result<()> {
        self.expect_state(ReaderState::Value, "read value")?;
        self.expect_type(ty)
    }

    fn finish_value(&mut self) {
        self.current_type = None;
        self.state = if self.frames.is_empty() {
            ReaderState::Done
        } else {
            ReaderState::Type
        };
    }

    fn expect_state(&self, expected: ReaderState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BsonError::reader_state(format!(
                "{} requires state {:?}, reader is in {:?}",
                operation, expected, self.state
            )))
        }
    }

    fn expect_type(&self, expected: ElementType) -> Result<()> {
        match self.current_type {
            Some(ty) if ty == expected => Ok(()),
            Some(ty) => Err(BsonError::type_mismatch(expected.name(), ty.name())),
            None => Err(BsonError::reader_state("no current element type")),
        }
    }

    fn limit(&self) -> usize {
        self.frames
            .last()
            .map(|f| f.end)
            .unwrap_or(self.data.len())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(n)
            .filter(|end| *end <= self.limit())
            .ok_or(BsonError::UnexpectedEof {
                offset: self.position,
                needed: n,
            })?;
        let data: &'a [u8] = self.data;
        let slice = &data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_length(&mut self) -> Result<usize> {
        let offset = self.position;
        let raw = i32::from_le_bytes(self.read_array::<4>()?);
        usize::try_from(raw).map_err(|_| {
            BsonError::LengthMismatch(format!("negative length {} at offset {}", raw, offset))
        })
    }

    fn peek_length(&self) -> Result<usize> {
        if self.position + 4 > self.limit() {
            return Err(BsonError::UnexpectedEof {
                offset: self.position,
                needed: 4,
            });
        }
        let p = self.position;
        let raw = i32::from_le_bytes([self.data[p], self.data[p + 1], self.data[p + 2], self.data[p + 3]]);
        usize::try_from(raw).map_err(|_| {
            BsonError::LengthMismatch(format!("negative length {} at offset {}", raw, p))
        })
    }

    /// Length of the C string at `from`, including its terminator
    fn cstring_len(&self, from: usize) -> Result<usize> {
        let limit = self.limit();
        if from >= limit {
            return Err(BsonError::MissingTerminator(from));
        }
        self.data[from..limit]
            .iter()
            .position(|b| *b == 0)
            .map(|i| i + 1)
            .ok_or(BsonError::MissingTerminator(from))
    }

    fn read_cstring(&mut self) -> Result<String> {
        let offset = self.position;
        let len = self.cstring_len(offset)?;
        let bytes = self.take(len)?;
        std::str::from_utf8(&bytes[..len - 1])
            .map(str::to_string)
            .map_err(|_| BsonError::InvalidUtf8(offset))
    }

    fn read_len_string(&mut self) -> Result<String> {
        let offset = self.position;
        let len = self.read_length()?;
        if len == 0 {
            return Err(BsonError::LengthMismatch(format!(
                "string at offset {} has zero length",
                offset
            )));
        }
        let bytes = self.take(len)?;
        if bytes[len - 1] != 0 {
            return Err(BsonError::MissingTerminator(offset));
        }
        std::str::from_utf8(&bytes[..len - 1])
            .map(str::to_string)
            .map_err(|_| BsonError::InvalidUtf8(offset))
    }
}
