//! lsnpd — the LSNP protocol engine.
//!
//! One UDP socket, one receive pump, a timer-driven presence service, and
//! per-domain handlers over the shared state in `lsnp-services`. The
//! terminal UI talks to the engine exclusively through the command/event
//! channels exposed by [`engine::Engine`].

pub mod dispatch;
pub mod engine;
pub mod handlers;
pub mod presence;
pub mod transport;

pub use engine::Engine;
