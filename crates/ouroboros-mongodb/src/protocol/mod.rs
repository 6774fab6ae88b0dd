//! Legacy wire protocol: framing, op codes, flags and message bodies

pub mod flags;
pub mod header;
pub mod message;

pub use flags::{DeleteFlags, InsertFlags, QueryFlags, ReplyFlags, UpdateFlags};
pub use header::{next_request_id, MessageHeader, OpCode, HEADER_LENGTH};
pub use message::{
    DeleteMessage, GetMoreMessage, InsertMessage, KillCursorsMessage, Message, QueryMessage,
    ReplyMessage, UpdateMessage,
};
