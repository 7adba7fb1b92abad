//! Live connections: wire envelope, per-connection tasks, the hub and its dispatcher.

pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod handler;
pub mod hub;
pub mod typing;

pub use connection::{ConnectionHandle, ConnectionLimits};
pub use envelope::{Envelope, MessageType};
pub use hub::{Collaborators, Hub};
