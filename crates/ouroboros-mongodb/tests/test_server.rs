//! Server node lifecycle and health checks against an in-process server

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{init_tracing, member_reply, MockServer};
use ouroboros_bson::doc;
use ouroboros_mongodb::protocol::{InsertFlags, InsertMessage, Message};
use ouroboros_mongodb::{
    DriverError, DriverSettings, ServerInstance, ServerState, ServerStateChanged, WriteConcern,
};
use parking_lot::Mutex;
use tokio_test::{assert_err, assert_ok};

fn instance(server: &MockServer) -> Arc<ServerInstance> {
    let settings = DriverSettings::new([server.address.clone()]);
    ServerInstance::new(server.address.clone(), &settings)
}

fn record_events(instance: &ServerInstance) -> Arc<Mutex<Vec<ServerStateChanged>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    instance.subscribe(move |event| sink.lock().push(event.clone()));
    events
}

#[tokio::test]
async fn test_connect_primary() {
    init_tracing();
    let server = MockServer::start().await;
    let node = instance(&server);

    assert_ok!(node.connect(false).await);
    let description = node.description();
    assert_eq!(description.state, ServerState::Connected);
    assert!(description.is_primary);
    assert_eq!(description.version.as_deref(), Some("2.4.9"));
    assert_eq!(description.version_array, vec![2, 4, 9]);
    assert!(description.round_trip_time.is_some());
    assert!(description.last_update.is_some());
}

#[tokio::test]
async fn test_secondary_requires_slave_ok() {
    let server = MockServer::start().await;
    server.set_is_master(member_reply("rs0", false, &[&server.address]));

    let node = instance(&server);
    let err = assert_err!(node.connect(false).await);
    assert!(matches!(err, DriverError::NotPrimary(_)));
    assert_eq!(node.state(), ServerState::Disconnected);
    assert!(node.description().last_error.is_some());

    assert_ok!(node.connect(true).await);
    let description = node.description();
    assert!(description.is_secondary);
    assert_eq!(description.replica_set_name.as_deref(), Some("rs0"));
}

#[tokio::test]
async fn test_role_change_notifies_once() {
    let server = MockServer::start().await;
    server.set_is_master(member_reply("rs0", true, &[&server.address]));
    let node = instance(&server);
    assert_ok!(node.connect(true).await);

    let events = record_events(&node);
    server.set_is_master(member_reply("rs0", false, &[&server.address]));
    assert_ok!(node.verify_state().await);
    assert_ok!(node.verify_state().await);

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert!(events[0].previous.is_primary);
    assert!(events[0].current.is_secondary);
    assert_eq!(events[0].current.state, ServerState::Connected);
}

#[tokio::test]
async fn test_unchanged_health_check_is_silent() {
    let server = MockServer::start().await;
    let node = instance(&server);
    assert_ok!(node.connect(false).await);

    let events = record_events(&node);
    assert_ok!(node.verify_state().await);
    assert!(events.lock().is_empty());
}

#[tokio::test]
async fn test_failed_ping_clears_pool() {
    let server = MockServer::start().await;
    let node = instance(&server);
    assert_ok!(node.connect(false).await);

    drop(assert_ok!(node.acquire(None).await));
    let generation = node.pool().generation();
    assert_eq!(node.pool().stats().idle, 1);

    server.state.fail_ping.store(true, Ordering::SeqCst);
    assert_ok!(node.verify_state().await);

    assert_eq!(node.pool().generation(), generation + 1);
    assert_eq!(node.pool().stats().idle, 0);
    assert_eq!(node.state(), ServerState::Connected);
}

#[tokio::test]
async fn test_pooled_fault_marks_unknown() {
    let server = MockServer::start().await;
    let node = instance(&server);
    assert_ok!(node.connect(false).await);

    let conn = assert_ok!(node.acquire(None).await);
    server.state.fail_ping.store(true, Ordering::SeqCst);
    let err = assert_err!(conn.run_command("admin", doc! { "ping": 1 }).await);
    assert!(err.is_network_error());
    drop(conn);
    assert_eq!(node.state(), ServerState::Unknown);

    server.state.fail_ping.store(false, Ordering::SeqCst);
    assert_ok!(node.verify_state().await);
    assert_eq!(node.state(), ServerState::Connected);
}

#[tokio::test]
async fn test_server_limits_apply_to_pooled_connections() {
    let server = MockServer::start().await;
    server.set_is_master(doc! { "ismaster": true, "maxBsonObjectSize": 1024, "ok": 1 });
    let node = instance(&server);
    assert_ok!(node.connect(false).await);

    let description = node.description();
    assert_eq!(description.max_document_size, 1024);
    assert_eq!(description.max_message_length, 16 * 1024 * 1024);

    let conn = assert_ok!(node.acquire(None).await);
    let oversized = Message::Insert(InsertMessage {
        full_collection_name: "app.blobs".into(),
        flags: InsertFlags::empty(),
        documents: vec![doc! { "payload": "x".repeat(2048) }],
    });
    let err = assert_err!(conn.send_write(&oversized, &WriteConcern::acknowledged()).await);
    assert!(matches!(err, DriverError::Bson(_)));
    assert!(server.state.inserted.lock().is_empty());
    assert_ok!(conn.run_command("admin", doc! { "ping": 1 }).await);
}

#[tokio::test]
async fn test_disconnect() {
    let server = MockServer::start().await;
    let node = instance(&server);
    assert_ok!(node.connect(false).await);

    let events = record_events(&node);
    node.disconnect().await;
    assert_eq!(node.state(), ServerState::Disconnected);
    assert!(!node.description().is_primary);

    let states: Vec<ServerState> = events.lock().iter().map(|e| e.current.state).collect();
    assert_eq!(states, vec![ServerState::Disconnecting, ServerState::Disconnected]);
    assert!(matches!(
        node.acquire(None).await,
        Err(DriverError::NotConnected(_))
    ));
}
