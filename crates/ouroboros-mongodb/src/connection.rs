//! A single TCP connection speaking the wire protocol

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use ouroboros_bson::{Bson, Document};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::address::{AddressResolver, ServerAddress};
use crate::auth::{AuthAction, AuthenticationState, Authenticators, Credential};
use crate::concern::WriteConcern;
use crate::config::{ConnectionSettings, PoolSettings, DEFAULT_MAX_DOCUMENT_SIZE, DEFAULT_MAX_MESSAGE_LENGTH};
use crate::error::{DriverError, Result};
use crate::fault::{classify_fault, FaultAction};
use crate::protocol::{
    next_request_id, GetMoreMessage, KillCursorsMessage, Message, MessageHeader, QueryFlags,
    QueryMessage, ReplyFlags, ReplyMessage, HEADER_LENGTH,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Initial => f.write_str("not yet open"),
            ConnectionState::Open => f.write_str("already open"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// The server node a connection reports to
pub trait ConnectionOwner: Send + Sync {
    fn max_document_size(&self) -> usize;
    fn max_message_length(&self) -> usize;
    fn is_connected(&self) -> bool;
    /// Called after a fault that did not leave the connection usable
    fn on_fault(&self, connection_id: u64, action: FaultAction, error: &DriverError);
}

/// Options for [`Connection::run_command_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOptions {
    /// Set the slave-ok flag so secondaries answer
    pub slave_ok: bool,
    /// Turn `ok: 0` replies into [`DriverError::Command`]
    pub check_ok: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            slave_ok: true,
            check_ok: true,
        }
    }
}

/// One socket to one server
///
/// A connection carries one request/response exchange at a time. It dials
/// lazily on first use and, once closed, fails every operation immediately.
pub struct Connection {
    id: u64,
    address: ServerAddress,
    generation: u64,
    settings: ConnectionSettings,
    resolver: Arc<dyn AddressResolver>,
    authenticators: Authenticators,
    owner: Option<Weak<dyn ConnectionOwner>>,
    state: Mutex<ConnectionState>,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
    auth: Mutex<AuthenticationState>,
    created_at: Instant,
    last_used: Mutex<Instant>,
}

impl Connection {
    pub fn new(
        address: ServerAddress,
        settings: ConnectionSettings,
        resolver: Arc<dyn AddressResolver>,
        authenticators: Authenticators,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            generation: 0,
            settings,
            resolver,
            authenticators,
            owner: None,
            state: Mutex::new(ConnectionState::Initial),
            stream: tokio::sync::Mutex::new(None),
            auth: Mutex::new(AuthenticationState::new()),
            created_at: now,
            last_used: Mutex::new(now),
        }
    }

    /// Attach the owning node and the pool generation this connection belongs to
    pub fn with_owner(mut self, owner: Weak<dyn ConnectionOwner>, generation: u64) -> Self {
        self.owner = Some(owner);
        self.generation = generation;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn is_expired(&self, settings: &PoolSettings) -> bool {
        self.created_at.elapsed() > settings.max_life_time
            || self.last_used().elapsed() > settings.max_idle_time
    }

    fn owner(&self) -> Option<Arc<dyn ConnectionOwner>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    fn max_document_size(&self) -> usize {
        self.owner()
            .map(|o| o.max_document_size())
            .unwrap_or(DEFAULT_MAX_DOCUMENT_SIZE)
    }

    fn max_message_length(&self) -> usize {
        self.owner()
            .map(|o| o.max_message_length())
            .unwrap_or(DEFAULT_MAX_MESSAGE_LENGTH)
    }

    fn state_error(&self, state: ConnectionState) -> DriverError {
        DriverError::ConnectionState {
            address: self.address.clone(),
            connection_id: self.id,
            state: state.to_string(),
        }
    }

    // ==================== Lifecycle ====================

    /// Dial the server; fails unless the connection is still `Initial`
    pub async fn open(&self) -> Result<()> {
        let mut slot = self.stream.lock().await;
        self.open_locked(&mut slot).await
    }

    async fn open_locked(&self, slot: &mut Option<TcpStream>) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Initial {
            return Err(self.state_error(state));
        }
        match self.dial().await {
            Ok(stream) => {
                *slot = Some(stream);
                *self.state.lock() = ConnectionState::Open;
                debug!(address = %self.address, connection_id = self.id, "Opened connection");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let endpoints = self.resolver.resolve(&self.address).await?;
        let mut last_error = None;
        for endpoint in endpoints {
            match timeout(self.settings.connect_timeout, self.connect_endpoint(endpoint)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", endpoint),
                    ))
                }
            }
        }
        let source = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no endpoints to dial"));
        Err(DriverError::io(&self.address, self.id, source))
    }

    async fn connect_endpoint(&self, endpoint: SocketAddr) -> io::Result<TcpStream> {
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(self.settings.send_buffer_size)?;
        socket.set_recv_buffer_size(self.settings.receive_buffer_size)?;
        let stream = socket.connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Close the socket; errors while closing are ignored
    pub async fn close(&self) {
        let mut slot = self.stream.lock().await;
        if let Some(mut stream) = self.close_locked(&mut slot) {
            let _ = stream.shutdown().await;
        }
    }

    fn close_locked(&self, slot: &mut Option<TcpStream>) -> Option<TcpStream> {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            debug!(address = %self.address, connection_id = self.id, "Closing connection");
        }
        *state = ConnectionState::Closed;
        slot.take()
    }

    // ==================== Exchange ====================

    async fn with_deadline<T>(&self, operation: impl Future<Output = io::Result<T>>) -> Result<T> {
        let result = match self.settings.socket_timeout {
            Some(limit) => match timeout(limit, operation).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "socket operation timed out")),
            },
            None => operation.await,
        };
        result.map_err(|e| DriverError::io(&self.address, self.id, e))
    }

    fn encode(&self, message: &Message, request_id: i32) -> Result<Vec<u8>> {
        let frame = message.encode(request_id, 0, self.max_document_size())?;
        let max = self.max_message_length();
        if frame.len() > max {
            return Err(DriverError::Protocol(format!(
                "message of {} bytes exceeds the maximum message length {}",
                frame.len(),
                max
            )));
        }
        Ok(frame)
    }

    /// Send `frame` and, when `reply_to` is set, read the matching reply
    async fn transmit(&self, frame: &[u8], reply_to: Option<i32>) -> Result<Option<ReplyMessage>> {
        let mut slot = self.stream.lock().await;
        match self.state() {
            ConnectionState::Initial => self.open_locked(&mut slot).await?,
            ConnectionState::Open => {}
            ConnectionState::Closed => return Err(self.state_error(ConnectionState::Closed)),
        }

        let result = self.exchange(&mut slot, frame, reply_to).await;
        match &result {
            Ok(_) => *self.last_used.lock() = Instant::now(),
            Err(e) => self.handle_fault(&mut slot, e),
        }
        result
    }

    async fn exchange(
        &self,
        slot: &mut Option<TcpStream>,
        frame: &[u8],
        reply_to: Option<i32>,
    ) -> Result<Option<ReplyMessage>> {
        let stream = slot
            .as_mut()
            .ok_or_else(|| self.state_error(ConnectionState::Closed))?;
        self.with_deadline(stream.write_all(frame)).await?;

        let Some(request_id) = reply_to else {
            return Ok(None);
        };

        let mut header_bytes = [0u8; HEADER_LENGTH];
        self.with_deadline(stream.read_exact(&mut header_bytes)).await?;
        let header = MessageHeader::parse(&header_bytes)?;
        let max = self.max_message_length();
        if header.message_length as usize > max {
            return Err(DriverError::Protocol(format!(
                "reply of {} bytes exceeds the maximum message length {}",
                header.message_length, max
            )));
        }

        let mut body = vec![0u8; header.body_length()];
        self.with_deadline(stream.read_exact(&mut body)).await?;
        if header.response_to != request_id {
            return Err(DriverError::Protocol(format!(
                "reply is for request {} but {} was sent",
                header.response_to, request_id
            )));
        }

        // An undecodable body leaves the stream out of step, so it is a protocol fault
        let message = Message::decode_body(header.op_code, &body)
            .map_err(|e| DriverError::Protocol(format!("malformed reply: {}", e)))?;
        match message {
            Message::Reply(reply) => Ok(Some(reply)),
            other => Err(DriverError::Protocol(format!(
                "expected a reply, received {:?}",
                other.op_code()
            ))),
        }
    }

    fn handle_fault(&self, slot: &mut Option<TcpStream>, error: &DriverError) {
        let action = classify_fault(error);
        if action == FaultAction::KeepConnection {
            return;
        }
        warn!(
            address = %self.address,
            connection_id = self.id,
            ?action,
            error = %error,
            "Connection fault"
        );
        drop(self.close_locked(slot));
        if let Some(owner) = self.owner() {
            owner.on_fault(self.id, action, error);
        }
    }

    /// Send a message that expects a reply
    pub async fn request(&self, message: &Message) -> Result<ReplyMessage> {
        let request_id = next_request_id();
        let frame = self.encode(message, request_id)?;
        self.transmit(&frame, Some(request_id))
            .await?
            .ok_or_else(|| DriverError::Protocol("no reply received".into()))
    }

    /// Send a message without waiting for a reply
    pub async fn send(&self, message: &Message) -> Result<()> {
        let frame = self.encode(message, next_request_id())?;
        self.transmit(&frame, None).await.map(|_| ())
    }

    // ==================== Operations ====================

    /// Run a query, surfacing failure flags as errors
    pub async fn query(&self, query: QueryMessage) -> Result<ReplyMessage> {
        let command = query.query.clone();
        let reply = self.request(&Message::Query(query)).await?;
        self.check_reply_flags(reply, &command)
    }

    pub async fn get_more(
        &self,
        full_collection_name: impl Into<String>,
        cursor_id: i64,
        number_to_return: i32,
    ) -> Result<ReplyMessage> {
        let message = Message::GetMore(GetMoreMessage {
            full_collection_name: full_collection_name.into(),
            number_to_return,
            cursor_id,
        });
        let reply = self.request(&message).await?;
        self.check_reply_flags(reply, &ouroboros_bson::doc! { "getMore": cursor_id })
    }

    pub async fn kill_cursors(&self, cursor_ids: Vec<i64>) -> Result<()> {
        if cursor_ids.is_empty() {
            return Ok(());
        }
        self.send(&Message::KillCursors(KillCursorsMessage { cursor_ids })).await
    }

    fn check_reply_flags(&self, reply: ReplyMessage, command: &Document) -> Result<ReplyMessage> {
        if reply.flags.contains(ReplyFlags::CURSOR_NOT_FOUND) {
            return Err(DriverError::CursorNotFound {
                cursor_id: reply.cursor_id,
                address: self.address.clone(),
            });
        }
        if reply.flags.contains(ReplyFlags::QUERY_FAILURE) {
            let response = reply.documents.into_iter().next().unwrap_or_default();
            let message = response.get_str("$err").unwrap_or("query failure").to_string();
            return Err(self.command_error(command, response, message));
        }
        Ok(reply)
    }

    fn command_error(&self, command: &Document, response: Document, message: String) -> DriverError {
        DriverError::Command {
            command_name: command.keys().next().cloned().unwrap_or_default(),
            message,
            command: Box::new(command.clone()),
            response: Box::new(response),
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    /// Run `command` against `<database>.$cmd`
    pub async fn run_command(&self, database: &str, command: Document) -> Result<Document> {
        self.run_command_with(database, command, CommandOptions::default())
            .await
    }

    pub async fn run_command_with(
        &self,
        database: &str,
        command: Document,
        options: CommandOptions,
    ) -> Result<Document> {
        let mut query = QueryMessage::command(database, command);
        if options.slave_ok {
            query.flags.insert(QueryFlags::SLAVE_OK);
        }
        let sent = query.query.clone();
        let reply = self.query(query).await?;
        let response = reply
            .documents
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Protocol("command reply holds no document".into()))?;

        if options.check_ok && !response.get_truthy("ok") {
            let message = response
                .get_str("errmsg")
                .unwrap_or("command failed")
                .to_string();
            return Err(self.command_error(&sent, response, message));
        }
        Ok(response)
    }

    /// Send an insert, update or delete
    ///
    /// Acknowledged writes are followed by `getlasterror` in the same send and
    /// return its reply; unacknowledged writes return `None`.
    pub async fn send_write(&self, message: &Message, concern: &WriteConcern) -> Result<Option<Document>> {
        let namespace = match message {
            Message::Insert(m) => &m.full_collection_name,
            Message::Update(m) => &m.full_collection_name,
            Message::Delete(m) => &m.full_collection_name,
            other => {
                return Err(DriverError::Protocol(format!(
                    "{:?} is not a write message",
                    other.op_code()
                )))
            }
        };
        if !concern.is_acknowledged() {
            self.send(message).await?;
            return Ok(None);
        }

        let database = namespace.split('.').next().unwrap_or_default();
        let command = concern.to_get_last_error();
        let mut frame = self.encode(message, next_request_id())?;
        let gle_id = next_request_id();
        frame.extend(self.encode(
            &Message::Query(QueryMessage::command(database, command.clone())),
            gle_id,
        )?);

        let reply = self
            .transmit(&frame, Some(gle_id))
            .await?
            .ok_or_else(|| DriverError::Protocol("no acknowledgment received".into()))?;
        let reply = self.check_reply_flags(reply, &command)?;
        let acknowledgment = reply
            .documents
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Protocol("acknowledgment holds no document".into()))?;

        if !acknowledgment.get_truthy("ok") {
            let message = acknowledgment
                .get_str("errmsg")
                .unwrap_or("getlasterror failed")
                .to_string();
            return Err(self.command_error(&command, acknowledgment, message));
        }
        match acknowledgment.get("err") {
            None | Some(Bson::Null) => Ok(Some(acknowledgment)),
            Some(err) => Err(DriverError::WriteConcern {
                message: err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string()),
                acknowledgment: Box::new(acknowledgment),
                address: self.address.clone(),
            }),
        }
    }

    // ==================== Authentication ====================

    pub fn is_authenticated(&self, credential: &Credential) -> bool {
        self.auth.lock().is_authenticated(credential)
    }

    pub fn can_authenticate(&self, credential: &Credential) -> bool {
        self.auth.lock().can_authenticate(credential)
    }

    /// Make sure this connection holds `credential`, running a handshake if needed
    pub async fn check_authentication(&self, credential: Option<&Credential>) -> Result<()> {
        let action = self.auth.lock().check_authentication(credential)?;
        let Some(credential) = credential else {
            return Ok(());
        };
        match action {
            AuthAction::NotRequired => Ok(()),
            AuthAction::AlreadyAuthenticated => {
                self.auth.lock().touch(credential);
                Ok(())
            }
            AuthAction::Authenticate => self.authenticate(credential).await,
        }
    }

    async fn authenticate(&self, credential: &Credential) -> Result<()> {
        let authenticator = self
            .authenticators
            .get(credential.mechanism())
            .ok_or_else(|| DriverError::Authentication {
                username: credential.username().to_string(),
                database: credential.source().to_string(),
                message: format!("unsupported mechanism {}", credential.mechanism()),
            })?;
        authenticator.authenticate(self, credential).await?;
        self.auth.lock().record(credential);
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DnsResolver;

    fn connection(port: u16) -> Connection {
        Connection::new(
            ServerAddress::new("127.0.0.1", port),
            ConnectionSettings::default(),
            Arc::new(DnsResolver),
            Authenticators::default(),
        )
    }

    #[test]
    fn test_ids_are_sequential() {
        let a = connection(1);
        let b = connection(1);
        assert!(b.id() > a.id());
        assert_eq!(a.state(), ConnectionState::Initial);
        assert_eq!(a.generation(), 0);
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = connection(port);

        conn.open().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(matches!(
            conn.open().await,
            Err(DriverError::ConnectionState { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_fast() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = connection(port);
        conn.open().await.unwrap();
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        let err = conn
            .run_command("admin", ouroboros_bson::doc! { "ping": 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::ConnectionState { .. }));
    }

    #[tokio::test]
    async fn test_refused_dial_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = connection(port);
        let err = conn.open().await.unwrap_err();
        assert!(err.is_network_error());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_expiry() {
        let conn = connection(1);
        assert!(!conn.is_expired(&PoolSettings::default()));
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(conn.is_expired(&PoolSettings::default().max_life_time(std::time::Duration::ZERO)));
    }
}
