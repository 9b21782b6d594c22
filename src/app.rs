//! Application state and logic.
//!
//! Wires the shared store, the bus and the audio gate into one coordinator
//! and keeps the bits of state the terminal session needs.

use crate::cli::Args;
use crate::config::Config;
use singlebell::bus::{self, Bus};
use singlebell::clock::{Clock, SystemClock};
use singlebell::lease::{Claim, Lease};
use singlebell::store::{FileStore, LockStore, MemoryStore};
use singlebell::{AlertCoordinator, PlayOutcome, UnlockGate};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Store, bus and clock shared by everything in one process.
pub struct Shared {
    pub store: Arc<dyn LockStore>,
    /// Store for hints that must not outlive the login session
    pub session: Option<Arc<dyn LockStore>>,
    pub bus: Option<Arc<dyn Bus>>,
    pub clock: Arc<dyn Clock>,
}

impl Shared {
    /// Open the configured store and bus. Neither failing is fatal: without a
    /// store this process runs alone, without a bus it waits on store events.
    pub fn open(config: &Config, args: &Args) -> Self {
        let dir = args
            .store_dir
            .clone()
            .or_else(|| config.store.dir.clone())
            .unwrap_or_else(FileStore::default_dir);

        let store: Arc<dyn LockStore> = match FileStore::open(&dir, config.poll_interval()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!("Shared store unavailable, running without exclusion: {}", e);
                Arc::new(MemoryStore::new())
            }
        };

        let session = FileStore::session_dir().and_then(|dir| {
            match FileStore::open(&dir, config.poll_interval()) {
                Ok(store) => Some(Arc::new(store) as Arc<dyn LockStore>),
                Err(e) => {
                    debug!("Session store unavailable: {}", e);
                    None
                }
            }
        });

        let bus = if config.bus.enabled && !args.no_bus {
            let bus_dir = config.bus.dir.clone().unwrap_or_else(|| match &args.store_dir {
                // Keep an explicitly chosen store and its bus together.
                Some(store_dir) => store_dir.join("bus"),
                None => bus::default_bus_dir(),
            });
            match bus::open_socket_bus(&bus_dir) {
                Ok(bus) => Some(bus),
                Err(e) => {
                    warn!("Broadcast bus unavailable, falling back to store events: {}", e);
                    None
                }
            }
        } else {
            debug!("Broadcast bus disabled");
            None
        };

        Self {
            store,
            session,
            bus,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Interactive session state.
pub struct App {
    pub coordinator: AlertCoordinator,
    active_tab: Lease,
    /// How often to renew the active-process lease
    pub active_tab_heartbeat: Duration,
    /// Is the app running
    pub running: bool,
    /// Last thing worth telling the user
    pub message: Option<String>,
    /// Show help text
    pub show_help: bool,
    /// A play is waiting for the unlock
    play_queued: Arc<AtomicBool>,
}

impl App {
    /// Create a new application from CLI args and config.
    pub fn new(args: &Args, config: &Config) -> Self {
        let shared = Shared::open(config, args);

        let backend = config
            .audio
            .build_backend(args.backend.unwrap_or(config.audio.backend));
        info!(backend = backend.name(), "Audio backend selected");
        let mut gate = UnlockGate::new(backend);
        if let Some(session) = shared.session {
            gate = gate.with_session_store(session);
        }
        let gate = Arc::new(gate);

        let coordinator = AlertCoordinator::new(
            config.coordinator_config(args.interval),
            gate,
            Arc::clone(&shared.store),
            shared.bus,
            Arc::clone(&shared.clock),
        );

        let active_tab = Lease::new(
            shared.store,
            config.active_tab.key.clone(),
            Duration::from_millis(config.active_tab.staleness_ms),
            shared.clock,
        );

        Self {
            coordinator,
            active_tab,
            active_tab_heartbeat: Duration::from_millis(config.active_tab.heartbeat_ms.max(100)),
            running: true,
            message: None,
            show_help: false,
            play_queued: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start listening and claim the active-process lease if it is free.
    pub fn start(&mut self) {
        self.coordinator.start();
        self.heartbeat_active_tab();
        if !self.coordinator.gate().is_unlocked() {
            self.message = Some(if self.coordinator.gate().unlocked_earlier_in_session() {
                "Sound is locked in this terminal. Press u to enable it.".to_string()
            } else {
                "Sound needs one key press before it can play: press u to enable it.".to_string()
            });
        }
    }

    /// Unlock audio. Only ever called from a key press.
    pub async fn unlock(&mut self) {
        if self.coordinator.gate().unlock().await {
            self.message = Some("Sound enabled.".to_string());
        } else {
            self.message = Some("Could not enable sound here.".to_string());
        }
    }

    /// Ask for the alert. Queues a retry for after unlocking when audio is locked.
    pub fn play(&mut self) {
        let outcome = self.coordinator.play();
        self.message = Some(match outcome {
            PlayOutcome::PLAYING => "Alert playing.".to_string(),
            PlayOutcome::OWNED_ELSEWHERE => "Alert is already sounding in another process.".to_string(),
            _ if !self.coordinator.gate().is_unlocked() => {
                self.queue_play_after_unlock();
                "Sound is locked. Press u to enable it; the alert will start then.".to_string()
            }
            _ => "Sound is not available in this terminal.".to_string(),
        });
    }

    fn queue_play_after_unlock(&self) {
        if self.play_queued.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = self.coordinator.clone();
        let queued = Arc::clone(&self.play_queued);
        self.coordinator.gate().on_unlock(move || {
            queued.store(false, Ordering::SeqCst);
            let outcome = coordinator.play();
            debug!(?outcome, "Queued play ran after unlock");
        });
    }

    /// Silence every process.
    pub fn stop(&mut self) {
        self.coordinator.stop();
        self.message = Some("Alert silenced everywhere.".to_string());
    }

    /// Renew the active-process lease if this process holds it or it is free.
    pub fn heartbeat_active_tab(&self) {
        match self.active_tab.claim(self.coordinator.owner_id()) {
            Claim::Acquired => debug!("Active-process lease renewed"),
            Claim::HeldBy(holder) => debug!(holder = %holder.owner_id, "Another process is active"),
        }
    }

    pub fn is_active_tab(&self) -> bool {
        self.active_tab
            .holder()
            .is_some_and(|h| &h.owner_id == self.coordinator.owner_id())
    }

    /// Toggle help display.
    pub fn toggle_help(&mut self) {
        self.show_help = !self.show_help;
    }

    /// Quit the application.
    pub fn quit(&mut self) {
        self.running = false;
    }

    pub fn should_quit(&self) -> bool {
        !self.running
    }

    /// Process teardown. Other processes keep ringing if they were.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        self.active_tab.release_if_owner(self.coordinator.owner_id());
        self.coordinator.gate().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn app_in(dir: &std::path::Path) -> App {
        let args = Args::parse_from([
            "singlebell",
            "--no-bus",
            "--backend",
            "none",
            "--store-dir",
            dir.to_str().unwrap(),
        ]);
        App::new(&args, &Config::default())
    }

    #[tokio::test]
    async fn test_first_app_becomes_active() {
        let dir = tempdir().unwrap();
        let mut first = app_in(dir.path());
        let mut second = app_in(dir.path());
        first.start();
        second.start();

        assert!(first.is_active_tab());
        assert!(!second.is_active_tab());

        first.shutdown();
        second.heartbeat_active_tab();
        assert!(second.is_active_tab());
    }

    #[tokio::test]
    async fn test_play_before_unlock_is_queued() {
        let dir = tempdir().unwrap();
        let mut app = app_in(dir.path());
        app.start();
        app.play();

        assert!(!app.coordinator.is_playing());
        assert!(app.play_queued.load(Ordering::SeqCst));
        assert!(app.message.as_deref().unwrap().contains("Press u"));

        // No audio backend: unlocking fails and the queue stays put.
        app.unlock().await;
        assert!(!app.coordinator.gate().is_unlocked());
        assert!(app.play_queued.load(Ordering::SeqCst));
    }
}
