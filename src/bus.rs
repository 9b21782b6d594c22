//! Best-effort broadcast bus between processes.
//!
//! Delivery is asynchronous and unordered with respect to store writes.
//! A sender never hears its own messages.

use crate::channel::{Envelope, Inbox};
use crate::models::BusMessage;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const BUS_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broadcast transport is not supported on this platform")]
    Unsupported,
    #[error("bus I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode bus message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fan-out channel to every other live process.
pub trait Bus: Send + Sync {
    /// Send to all other processes. Returns how many endpoints were reached.
    fn publish(&self, message: BusMessage) -> Result<usize, BusError>;
    fn subscribe(&self) -> Inbox<BusMessage>;
}

/// In-process bus. Each `attach()`ed endpoint plays one process.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Envelope<BusMessage>>,
    id: Uuid,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            id: Uuid::new_v4(),
        }
    }

    pub fn attach(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            id: Uuid::new_v4(),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for MemoryBus {
    fn publish(&self, message: BusMessage) -> Result<usize, BusError> {
        let reached = self
            .tx
            .send(Envelope {
                origin: self.id,
                payload: message,
            })
            .unwrap_or(0);
        debug!(?message, reached, "Published on memory bus");
        Ok(reached)
    }

    fn subscribe(&self) -> Inbox<BusMessage> {
        Inbox::new(self.tx.subscribe(), self.id)
    }
}

/// Default directory for bus sockets, next to the file store.
pub fn default_bus_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("singlebell")
        .join("bus")
}

/// Open the cross-process socket bus, or explain why it is unavailable.
///
/// Must be called from within a tokio runtime.
pub fn open_socket_bus(dir: impl Into<PathBuf>) -> Result<Arc<dyn Bus>, BusError> {
    #[cfg(unix)]
    {
        let bus: Arc<dyn Bus> = Arc::new(unix::SocketBus::bind(dir)?);
        Ok(bus)
    }
    #[cfg(not(unix))]
    {
        let _ = dir.into();
        Err(BusError::Unsupported)
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::channel::FOREIGN;
    use std::fs;
    use std::os::unix::net::UnixDatagram as StdDatagram;
    use tokio::net::UnixDatagram;
    use tokio::task::JoinHandle;
    use tracing::{trace, warn};

    const MAX_DATAGRAM: usize = 512;

    /// One datagram socket per process in a shared directory.
    /// Publishing fans out to every other socket file found there.
    pub struct SocketBus {
        dir: PathBuf,
        path: PathBuf,
        sender: StdDatagram,
        tx: broadcast::Sender<Envelope<BusMessage>>,
        reader: JoinHandle<()>,
        id: Uuid,
    }

    impl SocketBus {
        pub fn bind(dir: impl Into<PathBuf>) -> Result<Self, BusError> {
            let dir = dir.into();
            fs::create_dir_all(&dir).map_err(|source| BusError::Io {
                path: dir.clone(),
                source,
            })?;

            let id = Uuid::new_v4();
            let path = dir.join(format!("{}.sock", id.simple()));
            let socket = UnixDatagram::bind(&path).map_err(|source| BusError::Io {
                path: path.clone(),
                source,
            })?;
            let sender = StdDatagram::unbound()
                .and_then(|s| s.set_nonblocking(true).map(|_| s))
                .map_err(|source| BusError::Io {
                    path: path.clone(),
                    source,
                })?;

            let (tx, _) = broadcast::channel(BUS_CAPACITY);
            let reader = tokio::spawn(read_loop(socket, tx.clone()));
            debug!(socket = %path.display(), "Bound socket bus");

            Ok(Self {
                dir,
                path,
                sender,
                tx,
                reader,
                id,
            })
        }
    }

    async fn read_loop(socket: UnixDatagram, tx: broadcast::Sender<Envelope<BusMessage>>) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match socket.recv(&mut buf).await {
                Ok(n) => match serde_json::from_slice::<BusMessage>(&buf[..n]) {
                    Ok(message) => {
                        trace!(?message, "Bus datagram received");
                        let _ = tx.send(Envelope {
                            origin: FOREIGN,
                            payload: message,
                        });
                    }
                    Err(e) => warn!("Dropping unrecognised bus datagram: {}", e),
                },
                Err(e) => {
                    warn!("Bus socket closed: {}", e);
                    break;
                }
            }
        }
    }

    impl Bus for SocketBus {
        fn publish(&self, message: BusMessage) -> Result<usize, BusError> {
            let bytes = serde_json::to_vec(&message)?;
            let entries = fs::read_dir(&self.dir).map_err(|source| BusError::Io {
                path: self.dir.clone(),
                source,
            })?;

            let mut reached = 0;
            for entry in entries.flatten() {
                let peer = entry.path();
                if peer == self.path || peer.extension().and_then(|e| e.to_str()) != Some("sock") {
                    continue;
                }
                match self.sender.send_to(&bytes, &peer) {
                    Ok(_) => reached += 1,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                        ) =>
                    {
                        // Owner died without cleaning up.
                        debug!(peer = %peer.display(), "Pruning dead bus socket");
                        let _ = fs::remove_file(&peer);
                    }
                    Err(e) => warn!(peer = %peer.display(), "Bus send failed: {}", e),
                }
            }
            debug!(?message, reached, "Published on socket bus");
            Ok(reached)
        }

        fn subscribe(&self) -> Inbox<BusMessage> {
            Inbox::new(self.tx.subscribe(), self.id)
        }
    }

    impl Drop for SocketBus {
        fn drop(&mut self) {
            self.reader.abort();
            let _ = fs::remove_file(&self.path);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;
        use tempfile::tempdir;

        #[tokio::test]
        async fn test_socket_bus_fans_out_to_peers() {
            let dir = tempdir().unwrap();
            let a = SocketBus::bind(dir.path()).unwrap();
            let b = SocketBus::bind(dir.path()).unwrap();
            let mut a_inbox = a.subscribe();
            let mut b_inbox = b.subscribe();

            assert_eq!(a.publish(BusMessage::StopAllSounds).unwrap(), 1);

            let got = tokio::time::timeout(Duration::from_secs(2), b_inbox.recv())
                .await
                .unwrap();
            assert_eq!(got, Some(BusMessage::StopAllSounds));

            // The sender does not hear itself.
            let echo = tokio::time::timeout(Duration::from_millis(100), a_inbox.recv()).await;
            assert!(echo.is_err());
        }

        #[tokio::test]
        async fn test_socket_bus_prunes_dead_peers() {
            let dir = tempdir().unwrap();
            let a = SocketBus::bind(dir.path()).unwrap();
            let stale = dir.path().join("gone.sock");
            {
                let _dead = StdDatagram::bind(&stale).unwrap();
            }
            assert_eq!(a.publish(BusMessage::StopAllSounds).unwrap(), 0);
            assert!(!stale.exists());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bus_delivers_to_others() {
        let bus = MemoryBus::new();
        let a = bus.attach();
        let b = bus.attach();
        let mut a_inbox = a.subscribe();
        let mut b_inbox = b.subscribe();

        a.publish(BusMessage::StopAllSounds).unwrap();
        b.publish(BusMessage::StopAllSounds).unwrap();

        assert_eq!(b_inbox.recv().await, Some(BusMessage::StopAllSounds));
        // a only ever sees b's message.
        assert_eq!(a_inbox.recv().await, Some(BusMessage::StopAllSounds));
    }

    #[test]
    fn test_memory_bus_without_subscribers() {
        let bus = MemoryBus::new();
        assert_eq!(bus.publish(BusMessage::StopAllSounds).unwrap(), 0);
    }
}
