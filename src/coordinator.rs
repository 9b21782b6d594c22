//! Alert coordination across processes.
//!
//! At most one process sounds the alert: a process must claim the playback
//! lease before it starts, and renews it on every burst. Any process may
//! silence every other one by publishing a stop on the bus, and clearing the
//! lease key doubles as a slower stop signal for processes without a bus.
//!
//! The lease is best effort. Two processes calling `play` in the same instant
//! can both start; whichever write lands first is overwritten, and its owner
//! backs off as soon as it observes the other owner's record.

use crate::bus::Bus;
use crate::channel::Inbox;
use crate::clock::Clock;
use crate::gate::UnlockGate;
use crate::lease::{Claim, Lease, PLAYBACK_LEASE_KEY, PLAYBACK_STALENESS, decode_record};
use crate::models::{BusMessage, LeaseRecord, OwnerId, PlayOutcome, PlaybackState};
use crate::store::{LockStore, StoreChange};
use crate::tone::{BurstHandle, ToneEngine, ToneSpec};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default time between bursts.
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(2000);
/// Shortest accepted time between bursts.
pub const MIN_CADENCE: Duration = Duration::from_millis(100);

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time between bursts while playing
    pub cadence: Duration,
    /// Store key of the playback lease
    pub lease_key: String,
    /// Age after which a lease may be taken over
    pub staleness: Duration,
    pub tone: ToneSpec,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cadence: DEFAULT_CADENCE,
            lease_key: PLAYBACK_LEASE_KEY.to_string(),
            staleness: PLAYBACK_STALENESS,
            tone: ToneSpec::default(),
        }
    }
}

/// Point-in-time view of a coordinator, for display.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub owner: OwnerId,
    pub state: PlaybackState,
    pub unlocked: bool,
    /// Fresh lease holder, if any
    pub holder: Option<LeaseRecord>,
}

impl CoordinatorStatus {
    pub fn holds_lease(&self) -> bool {
        self.holder.as_ref().is_some_and(|h| h.owner_id == self.owner)
    }
}

/// Per-process playback. Exists only while this process is sounding the alert.
struct PlaybackSession {
    cadence: Option<JoinHandle<()>>,
    bursts: Vec<BurstHandle>,
    /// Our last lease write reached the store.
    lease_written: bool,
}

impl PlaybackSession {
    fn tear_down(mut self) {
        if let Some(handle) = self.cadence.take() {
            handle.abort();
        }
        for burst in &mut self.bursts {
            burst.silence();
        }
    }
}

struct Inner {
    owner: OwnerId,
    gate: Arc<UnlockGate>,
    tone: ToneEngine,
    lease: Lease,
    store: Arc<dyn LockStore>,
    bus: Option<Arc<dyn Bus>>,
    cadence: Duration,
    session: Mutex<Option<PlaybackSession>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Inner {
    fn play_burst(&self) -> Option<BurstHandle> {
        let ctx = self.gate.context();
        self.tone.play_burst(ctx.as_deref())
    }

    /// Local half of `stop`: mute, clear the cadence, go idle. Announces nothing.
    fn silence(&self, reason: &str) -> bool {
        let session = lock(&self.session).take();
        match session {
            Some(session) => {
                session.tear_down();
                info!(owner = %self.owner, reason, "Alert silenced");
                true
            }
            None => false,
        }
    }

    /// One cadence tick. Returns `false` when the cadence should end.
    fn heartbeat(&self) -> bool {
        let mut session = lock(&self.session);
        let Some(active) = session.as_mut() else {
            return false;
        };

        match self.lease.lookup() {
            Ok(Some(holder)) if holder.owner_id != self.owner && self.lease.is_fresh(&holder) => {
                info!(owner = %self.owner, holder = %holder.owner_id, "Lease taken over, yielding");
                if let Some(s) = session.take() {
                    s.tear_down();
                }
                return false;
            }
            // Our record is gone: someone issued a stop we may not have been told about.
            Ok(None) if active.lease_written => {
                if let Some(s) = session.take() {
                    s.tear_down();
                }
                info!(owner = %self.owner, reason = "lease cleared elsewhere", "Alert silenced");
                return false;
            }
            Ok(_) => {}
            Err(e) => debug!(owner = %self.owner, "Lease unreadable, playing on: {}", e),
        }

        match self.play_burst() {
            Some(burst) => {
                active.bursts.retain_mut(|b| b.is_sounding());
                active.bursts.push(burst);
            }
            None => {
                warn!(owner = %self.owner, "Burst failed mid-alert, going idle");
                if let Some(s) = session.take() {
                    s.tear_down();
                }
                drop(session);
                self.lease.release_if_owner(&self.owner);
                return false;
            }
        }

        active.lease_written = self.lease.renew(&self.owner);
        debug!(owner = %self.owner, "Heartbeat");
        true
    }

    fn on_store_change(&self, change: StoreChange) {
        if change.key != self.lease.key() {
            return;
        }
        let foreign = match change.value.as_deref().and_then(decode_record) {
            // Events can arrive after a later write of ours; the store decides.
            Some(record) if record.owner_id != self.owner => self
                .lease
                .current()
                .is_none_or(|current| current.owner_id != self.owner),
            Some(_) => false,
            None => true,
        };
        if foreign {
            self.silence("lease changed elsewhere");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
        if let Some(session) = lock(&self.session).take() {
            session.tear_down();
        }
    }
}

/// Coordinates the alert for one process. Cheap to clone.
#[derive(Clone)]
pub struct AlertCoordinator {
    inner: Arc<Inner>,
}

impl AlertCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        gate: Arc<UnlockGate>,
        store: Arc<dyn LockStore>,
        bus: Option<Arc<dyn Bus>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let owner = OwnerId::random();
        let lease = Lease::new(Arc::clone(&store), config.lease_key, config.staleness, clock);
        if config.cadence < MIN_CADENCE {
            warn!(cadence = ?config.cadence, "Cadence too short, using {:?}", MIN_CADENCE);
        }
        debug!(%owner, bus = bus.is_some(), "Coordinator created");
        Self {
            inner: Arc::new(Inner {
                owner,
                gate,
                tone: ToneEngine::new(config.tone),
                lease,
                store,
                bus,
                cadence: config.cadence.max(MIN_CADENCE),
                session: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Begin listening for stop signals. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut listener = lock(&self.inner.listener);
        if listener.is_some() {
            return;
        }
        let bus = self.inner.bus.as_ref().map(|b| b.subscribe());
        let store = self.inner.store.subscribe();
        *listener = Some(tokio::spawn(listen(Arc::downgrade(&self.inner), bus, store)));
        debug!(owner = %self.inner.owner, "Coordinator listening");
    }

    /// Start sounding the alert here, unless audio is locked or another
    /// process already is.
    pub fn play(&self) -> PlayOutcome {
        let inner = &self.inner;
        if !inner.gate.is_unlocked() {
            debug!(owner = %inner.owner, "Play blocked: audio locked");
            return PlayOutcome::BLOCKED;
        }

        if let Claim::HeldBy(holder) = inner.lease.claim(&inner.owner) {
            debug!(owner = %inner.owner, holder = %holder.owner_id, "Alert already sounding elsewhere");
            return PlayOutcome::OWNED_ELSEWHERE;
        }

        let mut session = lock(&inner.session);
        if session.is_some() {
            return PlayOutcome::PLAYING;
        }

        let Some(burst) = inner.play_burst() else {
            drop(session);
            inner.lease.release_if_owner(&inner.owner);
            warn!(owner = %inner.owner, "Play failed: audio engine refused burst");
            return PlayOutcome::BLOCKED;
        };

        let cadence = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(run_cadence(Arc::downgrade(inner), inner.cadence))),
            Err(_) => {
                warn!("No async runtime; alert will not repeat");
                None
            }
        };
        let lease_written = inner
            .lease
            .current()
            .is_some_and(|record| record.owner_id == inner.owner);
        *session = Some(PlaybackSession {
            cadence,
            bursts: vec![burst],
            lease_written,
        });
        info!(owner = %inner.owner, "Alert playing");
        PlayOutcome::PLAYING
    }

    /// Silence the alert in every process.
    pub fn stop(&self) {
        let inner = &self.inner;
        let was_playing = inner.silence("stop");
        let released = inner.lease.release_if_owner(&inner.owner);

        if let Some(bus) = &inner.bus {
            match bus.publish(BusMessage::StopAllSounds) {
                Ok(reached) => debug!(reached, "Stop broadcast"),
                Err(e) => warn!("Stop broadcast failed, relying on store: {}", e),
            }
        }
        // Processes without a bus see the key vanish.
        inner.lease.clear();
        info!(owner = %inner.owner, was_playing, released, "Stop issued");
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.inner.owner
    }

    pub fn gate(&self) -> &Arc<UnlockGate> {
        &self.inner.gate
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            owner: self.inner.owner.clone(),
            state: if self.is_playing() {
                PlaybackState::Playing
            } else {
                PlaybackState::Idle
            },
            unlocked: self.inner.gate.is_unlocked(),
            holder: self.inner.lease.holder(),
        }
    }

    /// Process teardown: go quiet, give up the lease, stop listening.
    /// Other processes are not told to stop.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if let Some(handle) = lock(&inner.listener).take() {
            handle.abort();
        }
        inner.silence("shutdown");
        inner.lease.release_if_owner(&inner.owner);
        debug!(owner = %inner.owner, "Coordinator shut down");
    }
}

async fn run_cadence(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.heartbeat() {
            break;
        }
    }
}

async fn listen(inner: Weak<Inner>, mut bus: Option<Inbox<BusMessage>>, mut store: Inbox<StoreChange>) {
    loop {
        let mut bus_closed = false;
        let next_message = async {
            match bus.as_mut() {
                Some(inbox) => inbox.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            message = next_message => match message {
                Some(BusMessage::StopAllSounds) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.silence("stop broadcast");
                }
                None => bus_closed = true,
            },
            change = store.recv() => match change {
                Some(change) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_store_change(change);
                }
                None => break,
            },
        }

        if bus_closed {
            debug!("Bus closed; relying on store events");
            bus = None;
        }
    }
}
