//! Data models shared between processes and callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current on-disk schema version for lease records.
pub const LEASE_RECORD_VERSION: u32 = 1;

/// Opaque identity of one participating process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Generate a fresh random owner id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A time-bounded claim over a shared key.
///
/// Serialized as camelCase JSON. Records written before versioning existed
/// carry no `version` field and are read as version 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Process that wrote the record
    pub owner_id: OwnerId,
    /// Epoch milliseconds of the last write
    pub acquired_at: i64,
}

fn default_version() -> u32 {
    LEASE_RECORD_VERSION
}

impl LeaseRecord {
    pub fn new(owner_id: OwnerId, acquired_at: i64) -> Self {
        Self {
            version: LEASE_RECORD_VERSION,
            owner_id,
            acquired_at,
        }
    }

    /// Age of the record relative to `now_ms`. Clock skew into the future counts as zero.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.acquired_at).max(0)
    }
}

/// Messages carried by the broadcast bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    /// Silence every process, whoever is sounding the alert.
    #[serde(rename = "STOP_ALL_SOUNDS")]
    StopAllSounds,
}

/// Result of asking the coordinator to start the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlayOutcome {
    /// This process is now (or already was) sounding the alert
    pub success: bool,
    /// Playback is not possible here until audio is unlocked
    pub blocked: bool,
}

impl PlayOutcome {
    /// Alert is sounding in this process.
    pub const PLAYING: Self = Self {
        success: true,
        blocked: false,
    };
    /// Audio is locked (or broken) in this process.
    pub const BLOCKED: Self = Self {
        success: false,
        blocked: true,
    };
    /// Another process already holds a fresh lease.
    pub const OWNED_ELSEWHERE: Self = Self {
        success: false,
        blocked: false,
    };
}

/// Local playback state of one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Playing => write!(f, "playing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_message_wire_format() {
        let json = serde_json::to_string(&BusMessage::StopAllSounds).unwrap();
        assert_eq!(json, r#"{"type":"STOP_ALL_SOUNDS"}"#);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let parsed: Result<BusMessage, _> = serde_json::from_str(r#"{"type":"PLAY"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_lease_record_camel_case() {
        let record = LeaseRecord::new(OwnerId::from("tab-a"), 1_700_000_000_000);
        let value: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["ownerId"], "tab-a");
        assert_eq!(value["acquiredAt"], 1_700_000_000_000i64);
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn test_legacy_record_without_version() {
        let record: LeaseRecord =
            serde_json::from_str(r#"{"ownerId":"tab-b","acquiredAt":42}"#).unwrap();
        assert_eq!(record.version, LEASE_RECORD_VERSION);
        assert_eq!(record.owner_id.as_str(), "tab-b");
    }

    #[test]
    fn test_age_never_negative() {
        let record = LeaseRecord::new(OwnerId::from("x"), 10_000);
        assert_eq!(record.age_ms(16_000), 6_000);
        assert_eq!(record.age_ms(9_000), 0);
    }
}
