//! Write acknowledgment settings

use std::time::Duration;

use ouroboros_bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

/// The `w` value of a write concern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledgment {
    Nodes(i32),
    Majority,
    Tag(String),
}

impl From<&Acknowledgment> for Bson {
    fn from(value: &Acknowledgment) -> Self {
        match value {
            Acknowledgment::Nodes(n) => Bson::Int32(*n),
            Acknowledgment::Majority => Bson::String("majority".into()),
            Acknowledgment::Tag(tag) => Bson::String(tag.clone()),
        }
    }
}

/// How a write is confirmed, expressed as a trailing `getlasterror`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: Option<Acknowledgment>,
    pub wtimeout: Option<Duration>,
    pub fsync: bool,
    pub journal: bool,
}

impl WriteConcern {
    /// Server default acknowledgment
    pub fn acknowledged() -> Self {
        Self::default()
    }

    /// Fire and forget
    pub fn unacknowledged() -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(0)),
            ..Self::default()
        }
    }

    pub fn nodes(n: i32) -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(n)),
            ..Self::default()
        }
    }

    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            ..Self::default()
        }
    }

    pub fn wtimeout(mut self, timeout: Duration) -> Self {
        self.wtimeout = Some(timeout);
        self
    }

    pub fn fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn journal(mut self, journal: bool) -> Self {
        self.journal = journal;
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.fsync || self.journal
    }

    /// The `getlasterror` command sent after the write
    pub fn to_get_last_error(&self) -> Document {
        let mut command = doc! { "getlasterror": 1 };
        if let Some(w) = &self.w {
            command.insert("w", Bson::from(w));
        }
        if let Some(timeout) = self.wtimeout {
            command.insert("wtimeout", timeout.as_millis() as i64);
        }
        if self.fsync {
            command.insert("fsync", true);
        }
        if self.journal {
            command.insert("j", true);
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledgment_rules() {
        assert!(WriteConcern::acknowledged().is_acknowledged());
        assert!(!WriteConcern::unacknowledged().is_acknowledged());
        assert!(WriteConcern::unacknowledged().journal(true).is_acknowledged());
    }

    #[test]
    fn test_get_last_error_command() {
        assert_eq!(WriteConcern::acknowledged().to_get_last_error(), doc! { "getlasterror": 1 });

        let concern = WriteConcern::majority()
            .wtimeout(Duration::from_millis(2500))
            .journal(true);
        assert_eq!(
            concern.to_get_last_error(),
            doc! { "getlasterror": 1, "w": "majority", "wtimeout": 2500_i64, "j": true }
        );
        assert_eq!(
            WriteConcern::nodes(2).fsync(true).to_get_last_error(),
            doc! { "getlasterror": 1, "w": 2, "fsync": true }
        );
    }
}
