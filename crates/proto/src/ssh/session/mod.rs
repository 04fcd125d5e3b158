//! Session-level services shared by client and server connections.

pub mod keepalive;

pub use keepalive::{KeepaliveHandle, KeepaliveRegistry, KeepaliveSignal, KEEPALIVE_REQUEST};
