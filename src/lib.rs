//! An AMQP 0-10 style session core.
//!
//! This crate implements the per-channel protocol state machine of a
//! message broker — command sequence tracking, frame assembly, producer
//! rate flow control and asynchronous receive completion — together with
//! the client-side reconnect engine that mirrors it across transport
//! failures.
//!
//! The wire codec, TCP/TLS transport, queues and message store live below
//! and above this crate; they are reached through the narrow traits in
//! [`endpoint`].

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod session;
pub mod util;

pub use connection::{ClientSession, ReconnectEngine, ReconnectState};
pub use error::Error;
pub use framing::{Frame, FrameBody, FrameFlags, Header, Method, SequenceNumber, SequenceSet};
pub use session::{
    Attachment, MessageEnvelope, SessionConfig, SessionCore, SessionEngine, SessionId,
    SessionLifecycle,
};
