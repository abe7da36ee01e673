//! Shared state and per-session state machines for the LSNP engine.
//!
//! Everything here is socket-free: the daemon crate owns I/O and feeds
//! these types from its dispatch loop. Registries are concurrent maps
//! shared across tasks; session state (a transfer, a game) is owned by one
//! task and reached through its table.

pub mod dedupe;
pub mod events;
pub mod file_transfer;
pub mod game;
pub mod group;
pub mod messaging;
pub mod peer;

pub use dedupe::{DedupeCache, Fingerprint};
pub use events::{Command, UiEvent};
pub use peer::{Peer, PeerRegistry};
