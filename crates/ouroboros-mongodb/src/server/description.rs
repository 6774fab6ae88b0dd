//! Snapshot of what a server reported about itself

use std::time::Duration;

use chrono::{DateTime, Utc};
use ouroboros_bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::address::ServerAddress;
use crate::config::{DEFAULT_MAX_DOCUMENT_SIZE, DEFAULT_MAX_MESSAGE_LENGTH};

/// Headroom added to the document limit for message framing
const MESSAGE_OVERHEAD: usize = 1024;

/// Weight of a new sample in the smoothed round-trip time
const ROUND_TRIP_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
    /// A connection faulted; the next health check decides the real state
    Unknown,
    Disconnecting,
}

/// Immutable view of one server, replaced as a whole on every update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub state: ServerState,
    pub is_primary: bool,
    pub is_secondary: bool,
    pub is_passive: bool,
    pub is_arbiter: bool,
    /// Reported by routers in front of a sharded cluster
    pub is_router: bool,
    pub replica_set_name: Option<String>,
    /// Voting, passive and arbiter members, in report order
    pub hosts: Vec<ServerAddress>,
    pub max_document_size: usize,
    pub max_message_length: usize,
    pub version: Option<String>,
    pub version_array: Vec<i32>,
    pub round_trip_time: Option<Duration>,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl ServerDescription {
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            state: ServerState::Disconnected,
            is_primary: false,
            is_secondary: false,
            is_passive: false,
            is_arbiter: false,
            is_router: false,
            replica_set_name: None,
            hosts: Vec::new(),
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            version: None,
            version_array: Vec::new(),
            round_trip_time: None,
            last_error: None,
            last_update: None,
        }
    }

    /// Apply an `ismaster` reply
    ///
    /// A member reporting both `passive` and `arbiterOnly` is recorded as an
    /// arbiter only.
    pub fn apply_is_master(&mut self, reply: &Document) {
        self.is_primary = reply.get_truthy("ismaster");
        self.is_secondary = reply.get_truthy("secondary");
        self.is_arbiter = reply.get_truthy("arbiterOnly");
        self.is_passive = reply.get_truthy("passive") && !self.is_arbiter;
        self.is_router = reply.get_str("msg").is_ok_and(|m| m == "isdbgrid");
        self.replica_set_name = reply.get_str("setName").ok().map(str::to_string);

        let mut hosts = Vec::new();
        for field in ["hosts", "passives", "arbiters"] {
            let Ok(list) = reply.get_array(field) else {
                continue;
            };
            for host in list.iter().filter_map(Bson::as_str) {
                if let Ok(address) = ServerAddress::parse(host) {
                    if !hosts.contains(&address) {
                        hosts.push(address);
                    }
                }
            }
        }
        self.hosts = hosts;

        self.max_document_size = reply
            .get_i64_lossy("maxBsonObjectSize")
            .ok()
            .filter(|n| *n > 0)
            .map_or(DEFAULT_MAX_DOCUMENT_SIZE, |n| n as usize);
        let reported = reply
            .get_i64_lossy("maxMessageSizeBytes")
            .ok()
            .filter(|n| *n > 0)
            .map_or(0, |n| n as usize);
        self.max_message_length = DEFAULT_MAX_MESSAGE_LENGTH
            .max(self.max_document_size + MESSAGE_OVERHEAD)
            .max(reported);
    }

    /// Apply a `buildinfo` reply
    pub fn apply_build_info(&mut self, reply: &Document) {
        self.version = reply.get_str("version").ok().map(str::to_string);
        self.version_array = reply
            .get_array("versionArray")
            .map(|parts| parts.iter().filter_map(Bson::as_i32).collect())
            .unwrap_or_default();
    }

    /// Fold a new latency sample into the smoothed round-trip time
    pub fn record_round_trip(&mut self, sample: Duration) {
        self.round_trip_time = Some(match self.round_trip_time {
            None => sample,
            Some(previous) => previous.mul_f64(1.0 - ROUND_TRIP_WEIGHT) + sample.mul_f64(ROUND_TRIP_WEIGHT),
        });
    }

    /// Clear everything learned from the server, keeping the address and limits
    pub fn reset_role(&mut self) {
        self.is_primary = false;
        self.is_secondary = false;
        self.is_passive = false;
        self.is_arbiter = false;
        self.is_router = false;
    }

    /// True when state or any role flag differs
    pub fn role_changed(&self, other: &ServerDescription) -> bool {
        self.state != other.state
            || self.is_primary != other.is_primary
            || self.is_secondary != other.is_secondary
            || self.is_passive != other.is_passive
            || self.is_arbiter != other.is_arbiter
            || self.is_router != other.is_router
            || self.replica_set_name != other.replica_set_name
    }

    pub fn is_connected(&self) -> bool {
        self.state == ServerState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouroboros_bson::{bson_array, doc};

    fn description() -> ServerDescription {
        ServerDescription::new(ServerAddress::new("db1", 27017))
    }

    #[test]
    fn test_passive_arbiter_normalized() {
        let mut desc = description();
        desc.apply_is_master(&doc! { "ismaster": false, "passive": true, "arbiterOnly": true, "ok": 1 });
        assert!(desc.is_arbiter);
        assert!(!desc.is_passive);

        desc.apply_is_master(&doc! { "ismaster": false, "secondary": true, "passive": 1, "ok": 1 });
        assert!(desc.is_passive);
        assert!(desc.is_secondary);
        assert!(!desc.is_arbiter);
    }

    #[test]
    fn test_max_message_length_derivation() {
        let mut desc = description();
        desc.apply_is_master(&doc! { "ismaster": true, "maxBsonObjectSize": 16 * 1024 * 1024 });
        assert_eq!(desc.max_document_size, 16 * 1024 * 1024);
        assert_eq!(desc.max_message_length, 16 * 1024 * 1024 + 1024);

        desc.apply_is_master(&doc! { "ismaster": true, "maxBsonObjectSize": 1024 });
        assert_eq!(desc.max_message_length, DEFAULT_MAX_MESSAGE_LENGTH);

        desc.apply_is_master(&doc! {
            "ismaster": true,
            "maxBsonObjectSize": 1024,
            "maxMessageSizeBytes": 48_000_000,
        });
        assert_eq!(desc.max_message_length, 48_000_000);

        desc.apply_is_master(&doc! { "ismaster": true });
        assert_eq!(desc.max_document_size, DEFAULT_MAX_DOCUMENT_SIZE);
        assert!(desc.max_message_length >= DEFAULT_MAX_MESSAGE_LENGTH.max(DEFAULT_MAX_DOCUMENT_SIZE + 1024));
    }

    #[test]
    fn test_hosts_union() {
        let mut desc = description();
        desc.apply_is_master(&doc! {
            "ismaster": true,
            "setName": "rs0",
            "hosts": bson_array!["db1:27017", "db2:27017"],
            "passives": bson_array!["db3:27017", "db1:27017"],
            "arbiters": bson_array!["db4:27018"],
        });
        assert_eq!(desc.replica_set_name.as_deref(), Some("rs0"));
        assert_eq!(
            desc.hosts,
            vec![
                ServerAddress::new("db1", 27017),
                ServerAddress::new("db2", 27017),
                ServerAddress::new("db3", 27017),
                ServerAddress::new("db4", 27018),
            ]
        );
    }

    #[test]
    fn test_round_trip_smoothing() {
        let mut desc = description();
        desc.record_round_trip(Duration::from_millis(100));
        assert_eq!(desc.round_trip_time, Some(Duration::from_millis(100)));
        desc.record_round_trip(Duration::from_millis(200));
        let smoothed = desc.round_trip_time.unwrap().as_secs_f64();
        assert!((smoothed - 0.120).abs() < 1e-6);
    }

    #[test]
    fn test_role_change_detection() {
        let before = description();
        let mut after = before.clone();
        after.round_trip_time = Some(Duration::from_millis(5));
        assert!(!before.role_changed(&after));

        after.is_secondary = true;
        assert!(before.role_changed(&after));
    }

    #[test]
    fn test_build_info_and_router() {
        let mut desc = description();
        desc.apply_build_info(&doc! { "version": "2.4.9", "versionArray": bson_array![2, 4, 9, 0] });
        assert_eq!(desc.version.as_deref(), Some("2.4.9"));
        assert_eq!(desc.version_array, vec![2, 4, 9, 0]);

        desc.apply_is_master(&doc! { "ismaster": true, "msg": "isdbgrid" });
        assert!(desc.is_router);
    }

    #[test]
    fn test_snapshot_serializes() {
        let value = serde_json::to_value(description()).unwrap();
        assert_eq!(value["state"], "disconnected");
        assert_eq!(value["address"]["port"], 27017);
    }
}
