//! Fan-out plumbing shared by the store and the bus.
//!
//! Every event carries the id of the handle that produced it so a receiver
//! can skip its own echoes, the way storage events only fire in other pages.

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Origin used for events that come from outside this process.
pub const FOREIGN: Uuid = Uuid::nil();

/// An event tagged with the handle that produced it.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub origin: Uuid,
    pub payload: T,
}

/// Receiving end of a fan-out channel, filtered to foreign events.
pub struct Inbox<T> {
    rx: broadcast::Receiver<Envelope<T>>,
    me: Uuid,
}

impl<T: Clone> Inbox<T> {
    pub fn new(rx: broadcast::Receiver<Envelope<T>>, me: Uuid) -> Self {
        Self { rx, me }
    }

    /// Wait for the next event not produced by this handle.
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(env) if env.origin == self.me => continue,
                Ok(env) => return Some(env.payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Inbox lagged, dropping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
