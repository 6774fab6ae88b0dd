//! Encoding and decoding of the legacy wire messages

use ouroboros_bson::codec;
use ouroboros_bson::Document;

use super::flags::{DeleteFlags, InsertFlags, QueryFlags, ReplyFlags, UpdateFlags};
use super::header::{MessageHeader, OpCode, HEADER_LENGTH};
use crate::error::{DriverError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage {
    pub full_collection_name: String,
    pub flags: QueryFlags,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub fields: Option<Document>,
}

impl QueryMessage {
    pub fn new(full_collection_name: impl Into<String>, query: Document) -> Self {
        Self {
            full_collection_name: full_collection_name.into(),
            flags: QueryFlags::empty(),
            number_to_skip: 0,
            number_to_return: 0,
            query,
            fields: None,
        }
    }

    /// A command on `<database>.$cmd` expecting a single reply document
    pub fn command(database: &str, command: Document) -> Self {
        Self {
            number_to_return: -1,
            ..Self::new(format!("{}.$cmd", database), command)
        }
    }

    pub fn flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn skip(mut self, skip: i32) -> Self {
        self.number_to_skip = skip;
        self
    }

    pub fn limit(mut self, limit: i32) -> Self {
        self.number_to_return = limit;
        self
    }

    pub fn fields(mut self, fields: Document) -> Self {
        self.fields = Some(fields);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub full_collection_name: String,
    pub flags: InsertFlags,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    pub full_collection_name: String,
    pub flags: UpdateFlags,
    pub selector: Document,
    pub update: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub full_collection_name: String,
    pub flags: DeleteFlags,
    pub selector: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreMessage {
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsMessage {
    pub cursor_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplyMessage {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl ReplyMessage {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            ..Self::default()
        }
    }

    pub fn number_returned(&self) -> usize {
        self.documents.len()
    }

    pub fn first_document(&self) -> Option<&Document> {
        self.documents.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query(QueryMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    GetMore(GetMoreMessage),
    KillCursors(KillCursorsMessage),
    Reply(ReplyMessage),
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Query(_) => OpCode::Query,
            Message::Insert(_) => OpCode::Insert,
            Message::Update(_) => OpCode::Update,
            Message::Delete(_) => OpCode::Delete,
            Message::GetMore(_) => OpCode::GetMore,
            Message::KillCursors(_) => OpCode::KillCursors,
            Message::Reply(_) => OpCode::Reply,
        }
    }

    /// Only reads and commands get a reply
    pub fn expects_reply(&self) -> bool {
        matches!(self, Message::Query(_) | Message::GetMore(_))
    }

    /// Encode a full frame; every document must fit in `max_document_size`
    pub fn encode(&self, request_id: i32, response_to: i32, max_document_size: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        MessageHeader {
            message_length: 0,
            request_id,
            response_to,
            op_code: self.op_code(),
        }
        .write_to(&mut buf);

        let put_doc = |buf: &mut Vec<u8>, doc: &Document| -> Result<()> {
            buf.extend(codec::to_vec_with_limit(doc, max_document_size)?);
            Ok(())
        };

        match self {
            Message::Query(m) => {
                put_u32(&mut buf, m.flags.bits());
                put_cstring(&mut buf, &m.full_collection_name)?;
                put_i32(&mut buf, m.number_to_skip);
                put_i32(&mut buf, m.number_to_return);
                put_doc(&mut buf, &m.query)?;
                if let Some(fields) = &m.fields {
                    put_doc(&mut buf, fields)?;
                }
            }
            Message::Insert(m) => {
                if m.documents.is_empty() {
                    return Err(DriverError::Protocol("insert requires at least one document".into()));
                }
                put_u32(&mut buf, m.flags.bits());
                put_cstring(&mut buf, &m.full_collection_name)?;
                for doc in &m.documents {
                    put_doc(&mut buf, doc)?;
                }
            }
            Message::Update(m) => {
                put_i32(&mut buf, 0);
                put_cstring(&mut buf, &m.full_collection_name)?;
                put_u32(&mut buf, m.flags.bits());
                put_doc(&mut buf, &m.selector)?;
                put_doc(&mut buf, &m.update)?;
            }
            Message::Delete(m) => {
                put_i32(&mut buf, 0);
                put_cstring(&mut buf, &m.full_collection_name)?;
                put_u32(&mut buf, m.flags.bits());
                put_doc(&mut buf, &m.selector)?;
            }
            Message::GetMore(m) => {
                put_i32(&mut buf, 0);
                put_cstring(&mut buf, &m.full_collection_name)?;
                put_i32(&mut buf, m.number_to_return);
                buf.extend_from_slice(&m.cursor_id.to_le_bytes());
            }
            Message::KillCursors(m) => {
                put_i32(&mut buf, 0);
                put_i32(&mut buf, m.cursor_ids.len() as i32);
                for id in &m.cursor_ids {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
            }
            Message::Reply(m) => {
                put_u32(&mut buf, m.flags.bits());
                buf.extend_from_slice(&m.cursor_id.to_le_bytes());
                put_i32(&mut buf, m.starting_from);
                put_i32(&mut buf, m.documents.len() as i32);
                for doc in &m.documents {
                    put_doc(&mut buf, doc)?;
                }
            }
        }

        let length = i32::try_from(buf.len())
            .map_err(|_| DriverError::Protocol(format!("message of {} bytes is too long", buf.len())))?;
        buf[0..4].copy_from_slice(&length.to_le_bytes());
        Ok(buf)
    }

    /// Decode a full frame, header included
    pub fn decode(frame: &[u8]) -> Result<(MessageHeader, Message)> {
        let header_bytes: &[u8; HEADER_LENGTH] = frame
            .get(..HEADER_LENGTH)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| DriverError::Protocol(format!("frame of {} bytes has no header", frame.len())))?;
        let header = MessageHeader::parse(header_bytes)?;
        if header.message_length as usize != frame.len() {
            return Err(DriverError::Protocol(format!(
                "header declares {} bytes but frame holds {}",
                header.message_length,
                frame.len()
            )));
        }
        let message = Self::decode_body(header.op_code, &frame[HEADER_LENGTH..])?;
        Ok((header, message))
    }

    /// Decode the bytes following a header
    pub fn decode_body(op_code: OpCode, body: &[u8]) -> Result<Message> {
        let mut cursor = Cursor::new(body);
        let message = match op_code {
            OpCode::Query => {
                let flags = QueryFlags::from_bits(cursor.read_u32()?);
                let full_collection_name = cursor.read_cstring()?;
                let number_to_skip = cursor.read_i32()?;
                let number_to_return = cursor.read_i32()?;
                let query = cursor.read_document()?;
                let fields = if cursor.is_empty() {
                    None
                } else {
                    Some(cursor.read_document()?)
                };
                Message::Query(QueryMessage {
                    full_collection_name,
                    flags,
                    number_to_skip,
                    number_to_return,
                    query,
                    fields,
                })
            }
            OpCode::Insert => {
                let flags = InsertFlags::from_bits(cursor.read_u32()?);
                let full_collection_name = cursor.read_cstring()?;
                let documents = codec::read_document_sequence(cursor.rest(), None)?;
                cursor.finish();
                Message::Insert(InsertMessage {
                    full_collection_name,
                    flags,
                    documents,
                })
            }
            OpCode::Update => {
                cursor.read_i32()?;
                let full_collection_name = cursor.read_cstring()?;
                let flags = UpdateFlags::from_bits(cursor.read_u32()?);
                let selector = cursor.read_document()?;
                let update = cursor.read_document()?;
                Message::Update(UpdateMessage {
                    full_collection_name,
                    flags,
                    selector,
                    update,
                })
            }
            OpCode::Delete => {
                cursor.read_i32()?;
                let full_collection_name = cursor.read_cstring()?;
                let flags = DeleteFlags::from_bits(cursor.read_u32()?);
                let selector = cursor.read_document()?;
                Message::Delete(DeleteMessage {
                    full_collection_name,
                    flags,
                    selector,
                })
            }
            OpCode::GetMore => {
                cursor.read_i32()?;
                let full_collection_name = cursor.read_cstring()?;
                let number_to_return = cursor.read_i32()?;
                let cursor_id = cursor.read_i64()?;
                Message::GetMore(GetMoreMessage {
                    full_collection_name,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::KillCursors => {
                cursor.read_i32()?;
                let count = cursor.read_i32()?;
                if count < 0 {
                    return Err(DriverError::Protocol(format!("negative cursor count {}", count)));
                }
                let cursor_ids = (0..count).map(|_| cursor.read_i64()).collect::<Result<Vec<_>>>()?;
                Message::KillCursors(KillCursorsMessage { cursor_ids })
            }
            OpCode::Reply => {
                let flags = ReplyFlags::from_bits(cursor.read_u32()?);
                let cursor_id = cursor.read_i64()?;
                let starting_from = cursor.read_i32()?;
                let number_returned = cursor.read_i32()?;
                if number_returned < 0 {
                    return Err(DriverError::Protocol(format!(
                        "negative number of returned documents {}",
                        number_returned
                    )));
                }
                let documents = codec::read_document_sequence(cursor.rest(), Some(number_returned as usize))?;
                cursor.finish();
                Message::Reply(ReplyMessage {
                    flags,
                    cursor_id,
                    starting_from,
                    documents,
                })
            }
        };

        if !cursor.is_empty() {
            return Err(DriverError::Protocol(format!(
                "{} trailing bytes after {:?} message",
                cursor.remaining(),
                op_code
            )));
        }
        Ok(message)
    }
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_cstring(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(DriverError::Protocol(format!(
            "collection name {:?} contains a NUL byte",
            value
        )));
    }
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

/// Bounds-checked reader over a message body
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    fn finish(&mut self) {
        self.pos = self.bytes.len();
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or_else(|| DriverError::Protocol(format!("truncated message body at offset {}", self.pos)))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    fn read_cstring(&mut self) -> Result<String> {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| DriverError::Protocol(format!("unterminated string at offset {}", self.pos)))?;
        let value = std::str::from_utf8(&rest[..end])
            .map_err(|_| DriverError::Protocol(format!("invalid UTF-8 string at offset {}", self.pos)))?
            .to_string();
        self.pos += end + 1;
        Ok(value)
    }

    fn read_document(&mut self) -> Result<Document> {
        let (document, consumed) = codec::read_document_prefix(self.rest())?;
        self.pos += consumed;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouroboros_bson::doc;

    const LIMIT: usize = 4 * 1024 * 1024;

    fn reencode(message: &Message) -> Message {
        let frame = message.encode(42, 0, LIMIT).unwrap();
        let (header, decoded) = Message::decode(&frame).unwrap();
        assert_eq!(header.request_id, 42);
        assert_eq!(header.message_length as usize, frame.len());
        decoded
    }

    #[test]
    fn test_command_query_layout() {
        let query = QueryMessage::command("admin", doc! { "ismaster": 1 }).flags(QueryFlags::SLAVE_OK);
        let frame = Message::Query(query.clone()).encode(5, 0, LIMIT).unwrap();

        assert_eq!(&frame[16..20], &4_u32.to_le_bytes());
        assert_eq!(&frame[20..31], b"admin.$cmd\0");
        assert_eq!(&frame[31..35], &0_i32.to_le_bytes());
        assert_eq!(&frame[35..39], &(-1_i32).to_le_bytes());
        assert_eq!(reencode(&Message::Query(query.clone())), Message::Query(query));
    }

    #[test]
    fn test_query_with_fields() {
        let query = QueryMessage::new("db.people", doc! { "age": 30 })
            .skip(10)
            .limit(5)
            .fields(doc! { "name": 1 });
        assert_eq!(reencode(&Message::Query(query.clone())), Message::Query(query));
    }

    #[test]
    fn test_write_messages() {
        let insert = Message::Insert(InsertMessage {
            full_collection_name: "db.c".into(),
            flags: InsertFlags::CONTINUE_ON_ERROR,
            documents: vec![doc! { "a": 1 }, doc! { "a": 2 }],
        });
        assert_eq!(reencode(&insert), insert);

        let update = Message::Update(UpdateMessage {
            full_collection_name: "db.c".into(),
            flags: UpdateFlags::UPSERT | UpdateFlags::MULTI,
            selector: doc! { "a": 1 },
            update: doc! { "$set": doc! { "b": 2 } },
        });
        assert_eq!(reencode(&update), update);

        let delete = Message::Delete(DeleteMessage {
            full_collection_name: "db.c".into(),
            flags: DeleteFlags::SINGLE_REMOVE,
            selector: doc! {},
        });
        assert_eq!(reencode(&delete), delete);
    }

    #[test]
    fn test_cursor_messages() {
        let get_more = Message::GetMore(GetMoreMessage {
            full_collection_name: "db.c".into(),
            number_to_return: 100,
            cursor_id: 0x0102_0304_0506_0708,
        });
        assert_eq!(reencode(&get_more), get_more);

        let kill = Message::KillCursors(KillCursorsMessage {
            cursor_ids: vec![1, -2, i64::MAX],
        });
        assert_eq!(reencode(&kill), kill);
    }

    #[test]
    fn test_reply_count_must_match() {
        let reply = Message::Reply(ReplyMessage {
            flags: ReplyFlags::AWAIT_CAPABLE,
            cursor_id: 9,
            starting_from: 0,
            documents: vec![doc! { "ok": 1 }],
        });
        let mut frame = reply.encode(1, 42, LIMIT).unwrap();
        assert_eq!(reencode(&reply), reply);

        // claim two documents while only one follows
        frame[32..36].copy_from_slice(&2_i32.to_le_bytes());
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn test_document_limit_enforced() {
        let insert = Message::Insert(InsertMessage {
            full_collection_name: "db.c".into(),
            flags: InsertFlags::empty(),
            documents: vec![doc! { "payload": "x".repeat(256) }],
        });
        assert!(matches!(insert.encode(1, 0, 64), Err(DriverError::Bson(_))));
    }

    #[test]
    fn test_truncated_and_malformed_frames() {
        let frame = Message::Query(QueryMessage::command("admin", doc! { "ping": 1 }))
            .encode(3, 0, LIMIT)
            .unwrap();
        assert!(Message::decode(&frame[..frame.len() - 1]).is_err());
        assert!(Message::decode(&frame[..10]).is_err());

        let empty = Message::Insert(InsertMessage {
            full_collection_name: "db.c".into(),
            flags: InsertFlags::empty(),
            documents: vec![],
        });
        assert!(empty.encode(1, 0, LIMIT).is_err());
    }
}
