//! Startup/shutdown signalling between supervisor and worker.
//!
//! Frames are newline-delimited JSON objects tagged by `type`. JSON string
//! escaping guarantees a frame never contains a raw newline, so the newline
//! is a sufficient delimiter. Unknown fields are ignored on both sides.

pub mod channel;
pub mod message;

pub use channel::{DEFAULT_MAX_FRAME, HandshakeChannel, HandshakeReader, HandshakeWriter};
pub use message::HandshakeMessage;
