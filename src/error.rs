//! Session-side error kinds.
//!
//! Connection/reconnect errors live in [`crate::connection::error`].

use crate::framing::SequenceNumber;

/// Reply codes carried on a peer-visible session close.
pub mod reply_code {
    pub const COMMAND_INVALID: u16 = 503;
    pub const NOT_IMPLEMENTED: u16 = 540;
    pub const INTERNAL_ERROR: u16 = 541;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed frame sequence; the session is closed with a protocol
    /// reply code.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Command not recognized by the adapter.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Internal bug; the session is aborted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Producer sent while flow was stopped. Reported to the peer via
    /// `message.stop`, logged, not fatal.
    #[error("producer rate violation at command {0}")]
    RateViolation(SequenceNumber),

    /// Non-transport session failure.
    #[error("session error: {0}")]
    Session(String),
}

impl Error {
    /// The reply code a handler puts on the peer-visible close.
    pub fn reply_code(&self) -> u16 {
        match self {
            Error::ProtocolViolation(_) => reply_code::COMMAND_INVALID,
            Error::NotImplemented(_) => reply_code::NOT_IMPLEMENTED,
            Error::InvariantViolation(_) | Error::RateViolation(_) | Error::Session(_) => {
                reply_code::INTERNAL_ERROR
            }
        }
    }
}
