//! In-memory frame model for the 0-10 command stream.
//!
//! The wire codec lives below this crate; the session layer only cares about
//! frame boundaries, method identity and payload bytes.

use std::fmt;

use bytes::Bytes;

mod sequence_set;
pub use sequence_set::SequenceSet;

/// Command sequence number with RFC 1982 serial ordering.
///
/// Command ids are a wrap-around `u32` sequence; comparisons are made on the
/// signed distance so that ids remain ordered across the wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    /// The id immediately after this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.wrapping_sub(other.0) as i32).cmp(&0)
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The four 0-10 frame boundary bits.
///
/// Segment flags delimit one segment (method, header or content); frameset
/// flags delimit the group of segments that carry one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const BEGIN_FRAMESET: u8 = 0x08;
    pub const END_FRAMESET: u8 = 0x04;
    pub const BEGIN_SEGMENT: u8 = 0x02;
    pub const END_SEGMENT: u8 = 0x01;

    pub fn new(bits: u8) -> Self {
        Self(bits & 0x0f)
    }

    /// All four bits set: a complete single-frame command.
    pub fn full_command() -> Self {
        Self(Self::BEGIN_FRAMESET | Self::END_FRAMESET | Self::BEGIN_SEGMENT | Self::END_SEGMENT)
    }

    /// A complete single-frame segment inside a larger frameset.
    pub fn full_segment() -> Self {
        Self(Self::BEGIN_SEGMENT | Self::END_SEGMENT)
    }

    pub fn with(self, bits: u8) -> Self {
        Self::new(self.0 | bits)
    }

    pub fn begin_frameset(self) -> bool {
        self.0 & Self::BEGIN_FRAMESET != 0
    }

    pub fn end_frameset(self) -> bool {
        self.0 & Self::END_FRAMESET != 0
    }

    pub fn begin_segment(self) -> bool {
        self.0 & Self::BEGIN_SEGMENT != 0
    }

    pub fn end_segment(self) -> bool {
        self.0 & Self::END_SEGMENT != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

/// Class and method codes for the commands the session layer itself must
/// recognize. Everything else is opaque to the core and is dispatched to the
/// adapter by code pair.
pub mod codes {
    pub const CLASS_SESSION: u8 = 0x02;
    pub const CLASS_EXECUTION: u8 = 0x03;
    pub const CLASS_MESSAGE: u8 = 0x04;

    pub const EXECUTION_SYNC: u8 = 0x01;
    pub const EXECUTION_RESULT: u8 = 0x02;
    pub const EXECUTION_EXCEPTION: u8 = 0x03;

    pub const MESSAGE_TRANSFER: u8 = 0x01;
    pub const MESSAGE_ACCEPT: u8 = 0x02;
    pub const MESSAGE_SET_FLOW_MODE: u8 = 0x09;
    pub const MESSAGE_FLOW: u8 = 0x0a;
    pub const MESSAGE_STOP: u8 = 0x0c;
}

/// A single protocol method.
///
/// `sync` is the peer's request for immediate completion notification;
/// `requires_accept` is only meaningful on `message.transfer` and mirrors an
/// explicit accept-mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub class_code: u8,
    pub method_code: u8,
    pub sync: bool,
    pub requires_accept: bool,
    pub arguments: Bytes,
}

impl Method {
    pub fn new(class_code: u8, method_code: u8, arguments: Bytes) -> Self {
        Self {
            class_code,
            method_code,
            sync: false,
            requires_accept: false,
            arguments,
        }
    }

    /// `message.transfer` carrying content.
    pub fn transfer(arguments: Bytes, requires_accept: bool) -> Self {
        Self {
            class_code: codes::CLASS_MESSAGE,
            method_code: codes::MESSAGE_TRANSFER,
            sync: false,
            requires_accept,
            arguments,
        }
    }

    /// `execution.sync`.
    pub fn execution_sync() -> Self {
        Self {
            class_code: codes::CLASS_EXECUTION,
            method_code: codes::EXECUTION_SYNC,
            sync: true,
            requires_accept: false,
            arguments: Bytes::new(),
        }
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Whether this method opens a content-bearing frameset.
    pub fn is_content_bearing(&self) -> bool {
        self.class_code == codes::CLASS_MESSAGE && self.method_code == codes::MESSAGE_TRANSFER
    }

    pub fn is_execution_sync(&self) -> bool {
        self.class_code == codes::CLASS_EXECUTION && self.method_code == codes::EXECUTION_SYNC
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "method({:#04x}, {:#04x})",
            self.class_code, self.method_code
        )
    }
}

/// Message headers as an opaque blob; the session synthesizes an empty one
/// for command-only content envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub properties: Bytes,
}

impl Header {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Method(Method),
    Header(Header),
    Content(Bytes),
}

/// One frame of the inbound or outbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(flags: FrameFlags, body: FrameBody) -> Self {
        Self { flags, body }
    }

    /// A complete single-frame command.
    pub fn command(method: Method) -> Self {
        Self::new(FrameFlags::full_command(), FrameBody::Method(method))
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.body {
            FrameBody::Method(method) => Some(method),
            _ => None,
        }
    }

    pub fn is_method(&self) -> bool {
        matches!(self.body, FrameBody::Method(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_ordering_across_wrap() {
        let a = SequenceNumber(u32::MAX);
        let b = a.next();
        assert_eq!(b, SequenceNumber(0));
        assert!(a < b);
        assert!(b > a);
    }

    #[test]
    fn full_command_flags() {
        let flags = FrameFlags::full_command();
        assert!(flags.begin_frameset());
        assert!(flags.end_frameset());
        assert!(flags.begin_segment());
        assert!(flags.end_segment());
    }

    #[test]
    fn transfer_is_content_bearing() {
        assert!(Method::transfer(Bytes::new(), false).is_content_bearing());
        assert!(!Method::execution_sync().is_content_bearing());
        assert!(Method::execution_sync().is_execution_sync());
    }
}
