//! One-way unlock gate for audio playback.
//!
//! Audio stays locked until [`UnlockGate::unlock`] is called from an explicit
//! user action. Once unlocked it never re-locks for the life of the process.
//! The flag is only ever set by `unlock`; nothing infers it.

use crate::audio::{AudioBackend, AudioContext, Burst, ContextState};
use crate::store::LockStore;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Store key remembering that audio was unlocked earlier in this session.
pub const SESSION_UNLOCK_KEY: &str = "singlebell.audio-unlocked";

/// Samples in the inaudible validation burst.
const VALIDATION_SAMPLES: usize = 64;
const VALIDATION_RATE: u32 = 44_100;

type UnlockCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct UnlockState {
    unlocked: bool,
    context: Option<Arc<dyn AudioContext>>,
    pending: Vec<UnlockCallback>,
}

pub struct UnlockGate {
    backend: Arc<dyn AudioBackend>,
    state: Mutex<UnlockState>,
    session: Option<Arc<dyn LockStore>>,
}

impl UnlockGate {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(UnlockState::default()),
            session: None,
        }
    }

    /// Record successful unlocks in `store` so later processes can skip the
    /// "press a key to enable sound" explanation.
    pub fn with_session_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.session = Some(store);
        self
    }

    fn state(&self) -> MutexGuard<'_, UnlockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_unlocked(&self) -> bool {
        self.state().unlocked
    }

    /// The running context, only once unlocked.
    pub fn context(&self) -> Option<Arc<dyn AudioContext>> {
        let state = self.state();
        if state.unlocked {
            state.context.clone()
        } else {
            None
        }
    }

    /// Run `callback` now if unlocked, otherwise right after the next successful unlock.
    pub fn on_unlock(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state();
        if state.unlocked {
            drop(state);
            callback();
        } else {
            state.pending.push(Box::new(callback));
        }
    }

    /// Whether an earlier process in this session already unlocked audio.
    /// This is a hint for messaging only; it does not unlock anything.
    pub fn unlocked_earlier_in_session(&self) -> bool {
        let Some(store) = &self.session else {
            return false;
        };
        matches!(store.read(SESSION_UNLOCK_KEY), Ok(Some(v)) if v == "true")
    }

    /// Activate audio. Call this directly from a user input handler.
    ///
    /// Returns `false` and leaves the gate locked if any step fails.
    /// Calling again after success returns `true` without touching the engine.
    pub async fn unlock(&self) -> bool {
        let ctx = {
            let mut state = self.state();
            if state.unlocked {
                return true;
            }
            let reusable = state
                .context
                .as_ref()
                .filter(|ctx| ctx.state() != ContextState::Closed)
                .cloned();
            match reusable {
                Some(ctx) => ctx,
                None => match self.backend.open() {
                    Ok(ctx) => {
                        debug!(backend = self.backend.name(), "Audio context created");
                        state.context = Some(Arc::clone(&ctx));
                        ctx
                    }
                    Err(e) => {
                        warn!(backend = self.backend.name(), "Audio unavailable: {}", e);
                        return false;
                    }
                },
            }
        };

        if ctx.state() == ContextState::Suspended {
            if let Err(e) = ctx.resume().await {
                warn!("Audio context resume failed: {}", e);
                return false;
            }
        }

        // An inaudible burst commits the unlock with the platform.
        match ctx.play(&Burst::silent(VALIDATION_RATE, VALIDATION_SAMPLES)) {
            Ok(mut voice) => voice.silence(),
            Err(e) => {
                warn!("Audio validation burst failed: {}", e);
                return false;
            }
        }

        let pending = {
            let mut state = self.state();
            if state.unlocked {
                return true;
            }
            state.unlocked = true;
            std::mem::take(&mut state.pending)
        };
        info!(callbacks = pending.len(), "Audio unlocked");

        if let Some(store) = &self.session {
            if let Err(e) = store.write(SESSION_UNLOCK_KEY, "true") {
                debug!("Could not record session unlock: {}", e);
            }
        }

        for callback in pending {
            callback();
        }
        true
    }

    /// Close the audio context. Used at process teardown.
    pub fn close(&self) {
        if let Some(ctx) = self.state().context.take() {
            ctx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, Voice};
    use crate::store::MemoryStore;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        opened: AtomicUsize,
        fail_open: bool,
        fail_resume: bool,
    }

    struct FakeContext {
        running: AtomicBool,
        fail_resume: bool,
    }

    struct FakeVoice;

    impl Voice for FakeVoice {
        fn silence(&mut self) {}
        fn is_sounding(&mut self) -> bool {
            false
        }
    }

    impl AudioContext for FakeContext {
        fn state(&self) -> ContextState {
            if self.running.load(Ordering::SeqCst) {
                ContextState::Running
            } else {
                ContextState::Suspended
            }
        }

        fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>> {
            Box::pin(async move {
                if self.fail_resume {
                    return Err(AudioError::Unsupported("policy".into()));
                }
                self.running.store(true, Ordering::SeqCst);
                Ok(())
            })
        }

        fn play(&self, _burst: &Burst) -> Result<Box<dyn Voice>, AudioError> {
            Ok(Box::new(FakeVoice))
        }

        fn close(&self) {}
    }

    impl AudioBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn open(&self) -> Result<Arc<dyn AudioContext>, AudioError> {
            if self.fail_open {
                return Err(AudioError::Unsupported("none".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeContext {
                running: AtomicBool::new(false),
                fail_resume: self.fail_resume,
            }))
        }
    }

    #[tokio::test]
    async fn test_unlock_is_idempotent() {
        let backend = Arc::new(FakeBackend::default());
        let gate = UnlockGate::new(backend.clone());

        assert!(!gate.is_unlocked());
        assert!(gate.context().is_none());
        assert!(gate.unlock().await);
        assert!(gate.unlock().await);
        assert!(gate.is_unlocked());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert_eq!(gate.context().unwrap().state(), ContextState::Running);
    }

    #[tokio::test]
    async fn test_unsupported_environment_stays_locked() {
        let gate = UnlockGate::new(Arc::new(FakeBackend {
            fail_open: true,
            ..Default::default()
        }));
        assert!(!gate.unlock().await);
        assert!(!gate.is_unlocked());
    }

    #[tokio::test]
    async fn test_failed_resume_keeps_single_context() {
        let backend = Arc::new(FakeBackend {
            fail_resume: true,
            ..Default::default()
        });
        let gate = UnlockGate::new(backend.clone());
        assert!(!gate.unlock().await);
        assert!(!gate.unlock().await);
        assert!(!gate.is_unlocked());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callbacks_flush_once_on_unlock() {
        let gate = UnlockGate::new(Arc::new(FakeBackend::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        gate.on_unlock(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        gate.unlock().await;
        gate.unlock().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Already unlocked: runs immediately.
        let c = calls.clone();
        gate.on_unlock(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_session_hint_recorded() {
        let store = MemoryStore::new();
        let first = UnlockGate::new(Arc::new(FakeBackend::default()))
            .with_session_store(Arc::new(store.attach()));
        let second = UnlockGate::new(Arc::new(FakeBackend::default()))
            .with_session_store(Arc::new(store.attach()));

        assert!(!second.unlocked_earlier_in_session());
        first.unlock().await;
        assert!(second.unlocked_earlier_in_session());
        // The hint alone does not unlock.
        assert!(!second.is_unlocked());
    }
}
