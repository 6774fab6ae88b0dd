//! Server selection over description snapshots
//!
//! Selectors are pure filters: they never touch live server state and can
//! run concurrently with health checks. Chain them with [`CompositeSelector`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::server::{ServerDescription, ServerState};

/// A filter over candidate servers
pub trait ServerSelector: Send + Sync {
    fn select<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription>;
}

/// Servers whose state is Connected
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectedSelector;

impl ServerSelector for ConnectedSelector {
    fn select<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
        servers
            .iter()
            .copied()
            .filter(|s| s.state == ServerState::Connected)
            .collect()
    }
}

/// Servers that accept writes
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimarySelector;

impl ServerSelector for PrimarySelector {
    fn select<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
        servers.iter().copied().filter(|s| s.is_primary).collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SecondarySelector;

impl ServerSelector for SecondarySelector {
    fn select<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
        servers.iter().copied().filter(|s| s.is_secondary).collect()
    }
}

/// Keeps servers whose latency is below the fastest latency plus a window
///
/// A `None` window, or one too large to add to the fastest latency, keeps
/// every candidate. Servers without a measured latency are kept only when no
/// candidate has been measured.
#[derive(Debug, Clone, Copy)]
pub struct LatencyWindowSelector {
    window: Option<Duration>,
}

impl LatencyWindowSelector {
    pub fn new(window: Option<Duration>) -> Self {
        Self { window }
    }
}

impl ServerSelector for LatencyWindowSelector {
    fn select<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
        let Some(window) = self.window else {
            return servers.to_vec();
        };
        let Some(fastest) = servers.iter().filter_map(|s| s.round_trip_time).min() else {
            return servers.to_vec();
        };
        let Some(limit) = fastest.checked_add(window) else {
            return servers.to_vec();
        };
        servers
            .iter()
            .copied()
            .filter(|s| s.round_trip_time.is_some_and(|rtt| rtt < limit))
            .collect()
    }
}

/// Where reads may go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreference {
    pub fn allows_secondary(&self) -> bool {
        !matches!(self, ReadPreference::Primary)
    }
}

/// Applies a [`ReadPreference`] with a secondary latency window
#[derive(Debug, Clone, Copy)]
pub struct ReadPreferenceSelector {
    preference: ReadPreference,
    latency: LatencyWindowSelector,
}

impl ReadPreferenceSelector {
    pub fn new(preference: ReadPreference, window: Option<Duration>) -> Self {
        Self {
            preference,
            latency: LatencyWindowSelector::new(window),
        }
    }

    fn primaries<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
        PrimarySelector.select(servers)
    }

    fn secondaries<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
        self.latency.select(&SecondarySelector.select(servers))
    }
}

impl ServerSelector for ReadPreferenceSelector {
    fn select<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
        let connected = ConnectedSelector.select(servers);
        match self.preference {
            ReadPreference::Primary => self.primaries(&connected),
            ReadPreference::PrimaryPreferred => {
                let primaries = self.primaries(&connected);
                if primaries.is_empty() {
                    self.secondaries(&connected)
                } else {
                    primaries
                }
            }
            ReadPreference::Secondary => self.secondaries(&connected),
            ReadPreference::SecondaryPreferred => {
                let secondaries = self.secondaries(&connected);
                if secondaries.is_empty() {
                    self.primaries(&connected)
                } else {
                    secondaries
                }
            }
            ReadPreference::Nearest => {
                let members: Vec<&ServerDescription> = connected
                    .into_iter()
                    .filter(|s| s.is_primary || s.is_secondary)
                    .collect();
                self.latency.select(&members)
            }
        }
    }
}

/// Runs selectors in order, each over the previous result
#[derive(Clone, Default)]
pub struct CompositeSelector {
    selectors: Vec<Arc<dyn ServerSelector>>,
}

impl CompositeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, selector: impl ServerSelector + 'static) -> Self {
        self.selectors.push(Arc::new(selector));
        self
    }
}

impl ServerSelector for CompositeSelector {
    fn select<'a>(&self, servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
        let mut candidates = servers.to_vec();
        for selector in &self.selectors {
            if candidates.is_empty() {
                break;
            }
            candidates = selector.select(&candidates);
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ServerAddress;

    fn server(host: &str, rtt_ms: u64, primary: bool) -> ServerDescription {
        let mut desc = ServerDescription::new(ServerAddress::new(host, 27017));
        desc.state = ServerState::Connected;
        desc.is_primary = primary;
        desc.is_secondary = !primary;
        desc.round_trip_time = Some(Duration::from_millis(rtt_ms));
        desc
    }

    fn hosts(selected: &[&ServerDescription]) -> Vec<String> {
        selected.iter().map(|s| s.address.host().to_string()).collect()
    }

    #[test]
    fn test_latency_window() {
        let a = server("a", 10, false);
        let b = server("b", 12, false);
        let c = server("c", 40, false);
        let all = [&a, &b, &c];

        let selected = LatencyWindowSelector::new(Some(Duration::from_millis(15))).select(&all);
        assert_eq!(hosts(&selected), vec!["a", "b"]);

        let selected = LatencyWindowSelector::new(None).select(&all);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_latency_window_is_strict() {
        let a = server("a", 10, false);
        let b = server("b", 25, false);
        let selected = LatencyWindowSelector::new(Some(Duration::from_millis(15))).select(&[&a, &b]);
        assert_eq!(hosts(&selected), vec!["a"]);
    }

    #[test]
    fn test_unbounded_window_keeps_all() {
        let a = server("a", 10, false);
        let b = server("b", 900, false);
        let selected = LatencyWindowSelector::new(Some(Duration::MAX)).select(&[&a, &b]);
        assert_eq!(hosts(&selected), vec!["a", "b"]);
    }

    #[test]
    fn test_composite_chain() {
        let p = server("p", 30, true);
        let s1 = server("s1", 5, false);
        let mut down = server("s2", 1, false);
        down.state = ServerState::Unknown;

        let chain = CompositeSelector::new()
            .then(ConnectedSelector)
            .then(SecondarySelector)
            .then(LatencyWindowSelector::new(Some(Duration::from_millis(15))));
        assert_eq!(hosts(&chain.select(&[&p, &s1, &down])), vec!["s1"]);
    }

    #[test]
    fn test_read_preferences() {
        let p = server("p", 30, true);
        let s = server("s", 5, false);
        let window = Some(Duration::from_millis(15));

        let select = |pref| hosts(&ReadPreferenceSelector::new(pref, window).select(&[&p, &s]));
        assert_eq!(select(ReadPreference::Primary), vec!["p"]);
        assert_eq!(select(ReadPreference::Secondary), vec!["s"]);
        assert_eq!(select(ReadPreference::SecondaryPreferred), vec!["s"]);
        assert_eq!(select(ReadPreference::PrimaryPreferred), vec!["p"]);
        assert_eq!(select(ReadPreference::Nearest), vec!["s"]);

        let only_secondary =
            ReadPreferenceSelector::new(ReadPreference::PrimaryPreferred, window).select(&[&s]);
        assert_eq!(hosts(&only_secondary), vec!["s"]);
        let only_primary =
            ReadPreferenceSelector::new(ReadPreference::SecondaryPreferred, window).select(&[&p]);
        assert_eq!(hosts(&only_primary), vec!["p"]);
    }
}
