//! Protocol-level types shared by every LSNP crate.
//!
//! This crate owns the things two peers must agree on: the line-oriented
//! wire format, the `name@ipv4` identity form, the capability-token format,
//! and the configuration keys that parameterize the protocol timers.
//! Nothing here touches a socket.

pub mod config;
pub mod identity;
pub mod token;
pub mod wire;

pub use identity::UserId;
