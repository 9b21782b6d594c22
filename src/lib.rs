//! Singlebell - one alert tone across many processes.
//!
//! Any number of processes of the same user session may want to sound the
//! same alert. Singlebell makes sure exactly one of them does, and lets any
//! of them silence all of them.
//!
//! The pieces, leaf first:
//!
//! - [`store`]: shared key/value store ([`store::FileStore`], [`store::MemoryStore`])
//! - [`bus`]: best-effort broadcast between processes
//! - [`lease`]: time-bounded ownership records on top of the store
//! - [`gate`]: the one-way audio unlock gate
//! - [`tone`]: burst synthesis and playback
//! - [`coordinator`]: the part callers talk to

pub mod audio;
pub mod bus;
pub mod channel;
pub mod clock;
pub mod coordinator;
pub mod gate;
pub mod lease;
pub mod models;
pub mod store;
pub mod tone;

pub use coordinator::{AlertCoordinator, CoordinatorConfig, CoordinatorStatus};
pub use gate::UnlockGate;
pub use models::{BusMessage, LeaseRecord, OwnerId, PlayOutcome, PlaybackState};
