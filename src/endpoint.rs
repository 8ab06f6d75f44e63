//! Trait seams for the collaborators the session core consumes.
//!
//! The session owns none of these: the frame sink and proxies belong to the
//! transport, the semantic layer and adapter to the broker above, the store
//! and timer to the host process.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::error::NewSessionError;
use crate::connection::ConnectionSettings;
use crate::error::Error;
use crate::framing::{Frame, Method, SequenceNumber, SequenceSet};
use crate::session::pending::CompletionHandle;
use crate::session::{CommandContext, MessageEnvelope};

/// Accepts one outbound frame.
pub trait FrameSink: Send {
    fn out(&mut self, frame: Frame) -> Result<(), Error>;
}

/// Typed stubs for the commands the session sends to its peer.
///
/// Implementations buffer onto the connection's output; they do not fail
/// locally, so the stubs are infallible.
pub trait PeerProxy: Send + Sync {
    fn message_stop(&self, destination: &str);
    fn message_flow(&self, destination: &str, unit: u8, value: u32);
    fn message_set_flow_mode(&self, destination: &str, mode: u8);
    fn message_accept(&self, transfers: &SequenceSet);
    fn execution_result(&self, id: SequenceNumber, value: Bytes);
    fn execution_sync(&self);
    fn session_send_completion(&self, commands: &SequenceSet);
    fn session_send_detach(&self);
}

/// The layer above the session: queue matching, subscriptions, delivery
/// bookkeeping. Out of scope here beyond this surface.
pub trait SemanticLayer: Send {
    /// Take ownership of an assembled inbound message. The layer may keep
    /// the message incomplete past this call by deferring its completion
    /// through [`MessageEnvelope::completion`].
    fn handle(&mut self, envelope: &mut MessageEnvelope) -> Result<(), Error>;

    fn attached(&mut self);

    /// Outbound activation is disabled until the next attach.
    fn detached(&mut self);

    fn closed(&mut self);

    /// The peer confirmed completion of these outbound commands; their
    /// resources may be released.
    fn completed(&mut self, commands: &SequenceSet);
}

/// Result of dispatching one command to the adapter.
#[derive(Debug, Default)]
pub struct Invocation {
    pub handled: bool,
    pub result: Option<Bytes>,
}

impl Invocation {
    pub fn handled() -> Self {
        Self {
            handled: true,
            result: None,
        }
    }

    pub fn with_result(value: Bytes) -> Self {
        Self {
            handled: true,
            result: Some(value),
        }
    }

    pub fn not_handled() -> Self {
        Self::default()
    }
}

/// Dispatch target for non-content commands.
pub trait Adapter: Send {
    fn invoke(&mut self, ctx: &mut CommandContext, method: &Method) -> Invocation;
}

/// Persistence hook for inbound messages. A no-op store must drop the
/// completion handle without deferring, which reads as synchronous
/// completion to the session.
pub trait MessageStore: Send {
    fn enqueue(&mut self, envelope: &MessageEnvelope, completion: CompletionHandle);
}

/// A store that persists nothing and completes immediately.
#[derive(Debug, Default)]
pub struct NullMessageStore;

impl MessageStore for NullMessageStore {
    fn enqueue(&mut self, _envelope: &MessageEnvelope, completion: CompletionHandle) {
        completion.complete();
    }
}

/// Cancellable one-shot timer facility for scheduled credit.
pub trait Timer: Send + Sync {
    fn add(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Handle to a scheduled task. `cancel` is race-free against an in-flight
/// fire only in cooperation with the fire path, which must re-check session
/// state before acting.
#[derive(Debug)]
pub struct TimerHandle {
    token: tokio_util::sync::CancellationToken,
}

impl TimerHandle {
    pub fn new(token: tokio_util::sync::CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// An outbound delivery that knows how to frame itself.
pub trait DeliveryRecord {
    fn deliver(
        &mut self,
        sink: &mut dyn FrameSink,
        command_id: SequenceNumber,
        max_frame_size: usize,
    ) -> Result<(), Error>;
}

/// An established broker connection, as seen by the reconnect engine.
#[async_trait]
pub trait Transport: Send {
    /// URLs the broker advertised for failover.
    fn known_hosts(&self) -> Vec<String>;

    fn is_open(&self) -> bool;

    /// Username the broker accepted during negotiation.
    fn authenticated_username(&self) -> String;

    async fn new_session(&mut self, name: &str) -> Result<SessionBinding, NewSessionError>;

    async fn close(&mut self);
}

/// The transport-level session created for a client session; opaque to the
/// reconnect engine beyond its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub name: String,
    pub channel: u16,
}

/// Dials a broker URL. The reconnect engine drives this through its back-off
/// loop; a failed dial is a `TransportFailure` string.
#[async_trait]
pub trait Connector: Send {
    async fn connect(
        &mut self,
        url: &str,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Transport>, String>;
}
