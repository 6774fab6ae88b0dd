//! In-process server speaking the legacy wire protocol, for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ouroboros_bson::{Bson, Document, doc};
use ouroboros_mongodb::auth::{nonce_key, password_digest};
use ouroboros_mongodb::protocol::{next_request_id, Message, QueryMessage, ReplyFlags, ReplyMessage};
use ouroboros_mongodb::ServerAddress;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const NONCE: &str = "2375531c32080ae8";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// What the mock server knows and has seen
#[derive(Default)]
pub struct MockState {
    pub is_master: Mutex<Document>,
    pub fail_ping: AtomicBool,
    /// Value of `err` returned by `getlasterror`
    pub write_error: Mutex<Option<String>>,
    pub users: Mutex<HashMap<String, String>>,
    pub inserted: Mutex<Vec<Document>>,
    pub commands: Mutex<Vec<String>>,
    pub accepted: AtomicUsize,
}

impl MockState {
    pub fn command_count(&self, name: &str) -> usize {
        self.commands.lock().iter().filter(|c| *c == name).count()
    }
}

pub struct MockServer {
    pub address: ServerAddress,
    pub state: Arc<MockState>,
    accept_loop: JoinHandle<()>,
}

impl MockServer {
    /// A standalone primary
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        let state = Arc::new(MockState::default());
        *state.is_master.lock() = doc! { "ismaster": true, "maxBsonObjectSize": 16 * 1024 * 1024, "ok": 1 };

        let shared = Arc::clone(&state);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });

        Self {
            address,
            state,
            accept_loop,
        }
    }

    pub fn set_is_master(&self, reply: Document) {
        *self.state.is_master.lock() = reply;
    }

    pub fn add_user(&self, username: &str, password: &str) {
        self.state
            .users
            .lock()
            .insert(username.to_string(), password.to_string());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// `ismaster` reply for a replica-set member
pub fn member_reply(set_name: &str, primary: bool, hosts: &[&ServerAddress]) -> Document {
    let hosts: Vec<Bson> = hosts.iter().map(|h| Bson::from(h.to_string())).collect();
    doc! {
        "ismaster": primary,
        "secondary": !primary,
        "setName": set_name,
        "hosts": hosts,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "ok": 1,
    }
}

async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut length = [0u8; 4];
    stream.read_exact(&mut length).await.ok()?;
    let total = i32::from_le_bytes(length) as usize;
    let mut frame = vec![0u8; total];
    frame[..4].copy_from_slice(&length);
    stream.read_exact(&mut frame[4..]).await.ok()?;
    Some(frame)
}

async fn serve(mut stream: TcpStream, state: Arc<MockState>) {
    let mut nonce_issued = false;
    while let Some(frame) = read_frame(&mut stream).await {
        let Ok((header, message)) = Message::decode(&frame) else {
            return;
        };
        let reply = match message {
            Message::Query(query) => {
                let Some(reply) = answer_query(&query, &state, &mut nonce_issued) else {
                    return;
                };
                reply
            }
            Message::Insert(insert) => {
                state.inserted.lock().extend(insert.documents);
                continue;
            }
            Message::GetMore(_) => ReplyMessage {
                flags: ReplyFlags::CURSOR_NOT_FOUND,
                ..ReplyMessage::default()
            },
            _ => continue,
        };

        let Ok(bytes) = Message::Reply(reply).encode(next_request_id(), header.request_id, usize::MAX) else {
            return;
        };
        if stream.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

/// `None` drops the connection
fn answer_query(query: &QueryMessage, state: &MockState, nonce_issued: &mut bool) -> Option<ReplyMessage> {
    if !query.full_collection_name.ends_with(".$cmd") {
        return Some(ReplyMessage::new(Vec::new()));
    }
    let name = query.query.keys().next().cloned().unwrap_or_default();
    state.commands.lock().push(name.clone());

    let document = match name.as_str() {
        "ismaster" => state.is_master.lock().clone(),
        "buildinfo" => doc! { "version": "2.4.9", "versionArray": vec![Bson::from(2), Bson::from(4), Bson::from(9)], "ok": 1 },
        "ping" if state.fail_ping.load(Ordering::SeqCst) => return None,
        "ping" => doc! { "ok": 1 },
        "getnonce" => {
            *nonce_issued = true;
            doc! { "nonce": NONCE, "ok": 1 }
        }
        "authenticate" => authenticate(&query.query, state, *nonce_issued),
        "getlasterror" => match state.write_error.lock().clone() {
            Some(err) => doc! { "err": err, "code": 11000, "n": 0, "ok": 1 },
            None => {
                let mut reply = doc! { "n": 0, "ok": 1 };
                reply.insert("err", Bson::Null);
                reply
            }
        },
        other => doc! { "errmsg": format!("no such cmd: {}", other), "ok": 0 },
    };
    Some(ReplyMessage::new(vec![document]))
}

fn authenticate(command: &Document, state: &MockState, nonce_issued: bool) -> Document {
    let user = command.get_str("user").unwrap_or_default();
    let key = command.get_str("key").unwrap_or_default();
    let expected = state
        .users
        .lock()
        .get(user)
        .map(|password| nonce_key(NONCE, user, &password_digest(user, password)));

    if nonce_issued && expected.as_deref() == Some(key) {
        doc! { "ok": 1 }
    } else {
        doc! { "errmsg": "auth fails", "ok": 0 }
    }
}
