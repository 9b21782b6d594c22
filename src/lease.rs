//! Best-effort leases over the shared store.
//!
//! Read-then-write is not atomic: two processes claiming within the same
//! instant can both believe they won. The loser finds out when it sees the
//! winner's write land and backs off. Store failures fail open.

use crate::clock::Clock;
use crate::models::{LEASE_RECORD_VERSION, LeaseRecord, OwnerId};
use crate::store::{LockStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Key of the playback lease.
pub const PLAYBACK_LEASE_KEY: &str = "singlebell.playback-lock";
/// Key of the coarser "active tab" lease.
pub const ACTIVE_TAB_LEASE_KEY: &str = "singlebell.active-tab";

pub const PLAYBACK_STALENESS: Duration = Duration::from_secs(5);
pub const ACTIVE_TAB_STALENESS: Duration = Duration::from_secs(30);

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Acquired,
    HeldBy(LeaseRecord),
}

/// A lease bound to one key of a shared store.
#[derive(Clone)]
pub struct Lease {
    store: Arc<dyn LockStore>,
    key: String,
    staleness: Duration,
    clock: Arc<dyn Clock>,
}

impl Lease {
    pub fn new(
        store: Arc<dyn LockStore>,
        key: impl Into<String>,
        staleness: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            staleness,
            clock,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Whatever record is stored, fresh or not. A failed read is an error
    /// here rather than an empty key.
    pub fn lookup(&self) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(self.store.read(&self.key)?.as_deref().and_then(decode_record))
    }

    /// Whatever record is stored, fresh or not.
    pub fn current(&self) -> Option<LeaseRecord> {
        self.lookup().unwrap_or_else(|e| {
            warn!(key = %self.key, "Lease read failed, treating as free: {}", e);
            None
        })
    }

    pub fn is_fresh(&self, record: &LeaseRecord) -> bool {
        record.age_ms(self.clock.now_ms()) < self.staleness.as_millis() as i64
    }

    /// The current holder, if its record has not gone stale.
    pub fn holder(&self) -> Option<LeaseRecord> {
        self.current().filter(|r| self.is_fresh(r))
    }

    /// Claim the lease unless a different owner holds a fresh record.
    pub fn claim(&self, owner: &OwnerId) -> Claim {
        if let Some(record) = self.holder() {
            if &record.owner_id != owner {
                debug!(key = %self.key, holder = %record.owner_id, "Lease held elsewhere");
                return Claim::HeldBy(record);
            }
        }
        self.renew(owner);
        Claim::Acquired
    }

    /// Rewrite the record with the current time. Fire and forget; returns
    /// whether the write landed.
    pub fn renew(&self, owner: &OwnerId) -> bool {
        let record = LeaseRecord::new(owner.clone(), self.clock.now_ms());
        let encoded = match serde_json::to_string(&record) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to encode lease record: {}", e);
                return false;
            }
        };
        match self.store.write(&self.key, &encoded) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %self.key, "Lease write failed, continuing without exclusion: {}", e);
                false
            }
        }
    }

    /// Clear the key only if `owner` is the recorded owner.
    pub fn release_if_owner(&self, owner: &OwnerId) -> bool {
        match self.current() {
            Some(record) if &record.owner_id == owner => {
                self.clear();
                true
            }
            _ => false,
        }
    }

    /// Clear the key regardless of who holds it.
    pub fn clear(&self) {
        if let Err(e) = self.store.clear(&self.key) {
            warn!(key = %self.key, "Lease clear failed: {}", e);
        }
    }
}

/// Decode a stored record. Unknown versions and garbage read as no lease.
pub fn decode_record(raw: &str) -> Option<LeaseRecord> {
    match serde_json::from_str::<LeaseRecord>(raw) {
        Ok(record) if record.version == LEASE_RECORD_VERSION => Some(record),
        Ok(record) => {
            warn!(version = record.version, "Ignoring lease record with unknown version");
            None
        }
        Err(e) => {
            warn!("Ignoring unparseable lease record: {}", e);
            None
        }
    }
}
