//! The per-session protocol core.
//!
//! A [`SessionCore`] owns the protocol state for one logical channel:
//! command sequence tracking, frame assembly, producer flow control and the
//! registry of inbound messages awaiting asynchronous completion. All
//! mutation happens on the owning engine task; foreign threads reach the
//! session only through the event channel recorded at attach.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use uuid::Uuid;

use crate::endpoint::{
    Adapter, DeliveryRecord, FrameSink, MessageStore, PeerProxy, SemanticLayer, Timer,
    TimerHandle,
};
use crate::error::Error;
use crate::framing::{Frame, Method, SequenceNumber, SequenceSet};

pub mod assembler;
pub mod cursor;
pub mod engine;
mod flow;
pub mod pending;

pub use assembler::{MessageAssembler, MessageEnvelope};
pub use cursor::{CommandCursor, CommandPoint};
pub use engine::{SessionControl, SessionEngine, SessionEvent};
pub use pending::{CompletionHandle, PendingReceiveRegistry, PendingToken};

use flow::RateFlowControl;
use pending::CompleteMode;

/// Session identity: caller-visible name plus a broker-minted uuid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    name: String,
    uuid: Uuid,
}

impl SessionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.uuid)
    }
}

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    NotAttached,
    Attaching,
    Attached,
    Detached,
    Closed,
}

/// What the owning handler supplies on attach: the channel, the peer
/// proxies, the frame sink and the way back onto the session task.
pub struct Attachment {
    pub channel: u16,
    /// Identity of the producing connection, stamped onto inbound messages.
    pub connection_id: String,
    pub max_frame_size: usize,
    /// Whether the client negotiated support for producer throttling.
    pub client_throttling: bool,
    pub peer: Arc<dyn PeerProxy>,
    /// Proxy for commands that must traverse the cluster-ordering hook.
    pub cluster_order: Arc<dyn PeerProxy>,
    pub sink: Box<dyn FrameSink>,
    pub events: UnboundedSender<SessionEvent>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    /// Producer rate cap in messages per second; `None` disables rate flow
    /// control.
    pub max_session_rate: Option<u32>,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_session_rate: None,
        }
    }

    pub fn max_session_rate(mut self, rate: u32) -> Self {
        self.max_session_rate = Some(rate);
        self
    }
}

/// Management counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    pub attached: bool,
    /// Credit currently held by the producer.
    pub client_credit: u32,
    /// Total credit granted over the session lifetime.
    pub credit_granted: u64,
}

/// Management method surface. Only `Detach` is live; `Close` remains
/// unimplemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtMethod {
    Detach,
    Close,
    SolicitAck,
    ResetLifespan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtStatus {
    Ok,
    NotImplemented,
}

/// Per-invocation view handed to the adapter. The adapter reports whether
/// the command completed in place and whether an execution.sync must wait
/// for earlier commands.
#[derive(Debug)]
pub struct CommandContext {
    command_id: SequenceNumber,
    lowest_incomplete: Option<SequenceNumber>,
    complete: bool,
    deferred_sync: bool,
    acked_sent: Option<SequenceSet>,
}

impl CommandContext {
    pub fn command_id(&self) -> SequenceNumber {
        self.command_id
    }

    /// The peer acknowledged these outbound commands as complete; applied
    /// to the cursor and semantic layer once the invocation returns.
    pub fn sender_completed(&mut self, commands: SequenceSet) {
        self.acked_sent = Some(commands);
    }

    /// Mark the command incomplete; completion will come later through the
    /// receive path.
    pub fn defer_completion(&mut self) {
        self.complete = false;
    }

    /// The current command is execution.sync: it may only complete once
    /// every strictly-earlier command has completed.
    pub fn add_pending_execution_sync(&mut self) {
        if let Some(low) = self.lowest_incomplete {
            if low < self.command_id {
                self.complete = false;
                self.deferred_sync = true;
            }
        }
    }
}

pub struct SessionCore {
    id: SessionId,
    state: SessionLifecycle,
    attachment: Option<Attachment>,
    cursor: CommandCursor,
    assembler: MessageAssembler,
    rate_flow: Option<Mutex<RateFlowControl>>,
    max_session_rate: Option<u32>,
    incomplete: PendingReceiveRegistry,
    accepted: SequenceSet,
    pending_execution_syncs: VecDeque<SequenceNumber>,
    current_command_complete: bool,
    semantic: Box<dyn SemanticLayer>,
    adapter: Box<dyn Adapter>,
    store: Box<dyn MessageStore>,
    timer: Arc<dyn Timer>,
    credit_task: Option<TimerHandle>,
    metrics: SessionMetrics,
}

impl SessionCore {
    pub fn new(
        config: SessionConfig,
        semantic: Box<dyn SemanticLayer>,
        adapter: Box<dyn Adapter>,
        store: Box<dyn MessageStore>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        Self {
            id: SessionId::new(config.name.clone()),
            state: SessionLifecycle::NotAttached,
            attachment: None,
            cursor: CommandCursor::new(),
            assembler: MessageAssembler::new(),
            rate_flow: None,
            max_session_rate: config.max_session_rate,
            incomplete: PendingReceiveRegistry::new(),
            accepted: SequenceSet::new(),
            pending_execution_syncs: VecDeque::new(),
            current_command_complete: true,
            semantic,
            adapter,
            store,
            timer,
            credit_task: None,
            metrics: SessionMetrics::default(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionLifecycle {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.metrics
    }

    pub fn cursor(&self) -> &CommandCursor {
        &self.cursor
    }

    pub fn registry(&self) -> &PendingReceiveRegistry {
        &self.incomplete
    }

    /// Associate the session with a handler. Allowed from fresh and from a
    /// cleanly detached state; a closed session cannot be reattached.
    pub fn attach(&mut self, attachment: Attachment) -> Result<(), Error> {
        match self.state {
            SessionLifecycle::NotAttached | SessionLifecycle::Detached => {}
            SessionLifecycle::Closed => {
                return Err(Error::Session("attach on a closed session".into()))
            }
            SessionLifecycle::Attaching | SessionLifecycle::Attached => {
                return Err(Error::Session(
                    "attach while a handler is already recorded".into(),
                ))
            }
        }
        self.state = SessionLifecycle::Attaching;
        tracing::debug!(session = %self.id, channel = attachment.channel, "attached on broker");
        if let Some(rate) = self.max_session_rate.filter(|r| *r > 0) {
            if self.rate_flow.is_none() {
                if attachment.client_throttling {
                    self.rate_flow = Some(Mutex::new(RateFlowControl::new(rate)));
                } else {
                    tracing::warn!(
                        session = %self.id,
                        "unable to flow control client - client doesn't support"
                    );
                }
            }
        }
        self.attachment = Some(attachment);
        self.state = SessionLifecycle::Attached;
        self.metrics.attached = true;
        Ok(())
    }

    /// Disassociate from the handler. The cursor and all pending receives
    /// survive for a later resume; completions arriving while detached are
    /// wire no-ops.
    pub fn detach(&mut self) {
        tracing::debug!(session = %self.id, "detached on broker");
        self.disable_output();
        self.attachment = None;
        self.state = SessionLifecycle::Detached;
        self.metrics.attached = false;
    }

    fn disable_output(&mut self) {
        // prevents further outbound activation until reattached
        self.semantic.detached();
    }

    /// Terminal teardown: the semantic layer is told, the scheduled credit
    /// timer is cancelled, and every outstanding pending receive is
    /// cancelled under join semantics.
    pub fn close(&mut self) {
        if self.state == SessionLifecycle::Closed {
            return;
        }
        self.semantic.closed();
        if let Some(task) = self.credit_task.take() {
            task.cancel();
        }
        self.incomplete.cancel_all();
        self.attachment = None;
        self.state = SessionLifecycle::Closed;
        self.metrics.attached = false;
    }

    /// Drop output without the completion handshake. Used on invariant
    /// violations where the session state can no longer be trusted.
    pub fn abort(&mut self) {
        if self.attachment.is_some() {
            tracing::warn!(session = %self.id, "aborting session output");
            self.attachment = None;
            self.state = SessionLifecycle::Detached;
            self.metrics.attached = false;
        }
    }

    /// Session resume is not fully implemented, so a detached lifetime is
    /// accepted and ignored.
    pub fn set_timeout(&mut self, _seconds: u32) {}

    /// Convert a session exception into a peer-visible close with a reply
    /// code, then tear down.
    pub fn fail(&mut self, err: &Error) {
        if let Some(att) = &self.attachment {
            tracing::warn!(
                session = %self.id,
                reply_code = err.reply_code(),
                error = %err,
                "session exception, detaching"
            );
            att.peer.session_send_detach();
        }
        self.close();
    }

    pub fn management_method(&mut self, method: MgmtMethod) -> MgmtStatus {
        match method {
            MgmtMethod::Detach => {
                if let Some(att) = &self.attachment {
                    att.peer.session_send_detach();
                }
                MgmtStatus::Ok
            }
            MgmtMethod::Close | MgmtMethod::SolicitAck | MgmtMethod::ResetLifespan => {
                MgmtStatus::NotImplemented
            }
        }
    }

    /// Dispatch one inbound frame by shape.
    pub fn handle_in(&mut self, frame: Frame) -> Result<(), Error> {
        match frame.method().filter(|m| !m.is_content_bearing()).cloned() {
            Some(method) => {
                if frame.flags.begin_frameset() && frame.flags.end_frameset() {
                    let id = self.cursor.command_received();
                    self.handle_command(&method, id)
                } else {
                    Err(Error::NotImplemented(
                        "multi-frame command segments".into(),
                    ))
                }
            }
            None => self.handle_content(frame),
        }
    }

    fn handle_command(&mut self, method: &Method, id: SequenceNumber) -> Result<(), Error> {
        // assumed complete; the invoker may clear it (e.g. execution.sync
        // arriving before its dependencies have completed)
        self.current_command_complete = true;
        let mut ctx = CommandContext {
            command_id: id,
            lowest_incomplete: self.cursor.lowest_incomplete(),
            complete: true,
            deferred_sync: false,
            acked_sent: None,
        };
        let invocation = self.adapter.invoke(&mut ctx, method);
        if let Some(acked) = ctx.acked_sent.take() {
            self.sender_completed(&acked);
        }
        if ctx.deferred_sync {
            tracing::debug!(session = %self.id, command = %id, "delaying completion of execution.sync");
            self.pending_execution_syncs.push_back(id);
        }
        self.current_command_complete = ctx.complete;
        if self.current_command_complete {
            self.cursor.receiver_completed(id);
        }

        if !invocation.handled {
            return Err(Error::NotImplemented(method.to_string()));
        }
        if let Some(result) = invocation.result {
            self.peer()?.execution_result(id, result);
        }

        if method.sync && self.current_command_complete {
            self.send_accept_and_completion()?;
        }
        Ok(())
    }

    fn handle_content(&mut self, frame: Frame) -> Result<(), Error> {
        let opening = frame.flags.begin_frameset() && frame.flags.begin_segment();
        let id = if opening {
            self.cursor.command_received()
        } else {
            self.cursor.next_receive()
        };

        if let Some(mut envelope) = self.assembler.handle(frame, id)? {
            if let Some(att) = &self.attachment {
                envelope.set_publisher(att.connection_id.clone());
            }
            let completion = Arc::clone(envelope.completion());
            completion.begin();
            self.semantic.handle(&mut envelope)?;
            let store_hold = envelope.completion().defer();
            self.store.enqueue(&envelope, store_hold);
            let events = self.attachment.as_ref().map(|a| a.events.clone());
            let token = self.incomplete.register(envelope, events)?;
            if completion.end() {
                // nothing kept the message incomplete: finish on this thread
                let registry = self.incomplete.clone();
                registry.complete(token, CompleteMode::Sync(self))?;
            }
        }

        // producer session flow control
        if self.rate_flow.is_some() && opening && !self.process_send_credit(1)? {
            tracing::debug!(session = %self.id, "schedule sending credit");
            self.schedule_credit();
        }
        Ok(())
    }

    /// Invoked when an inbound message has been fully processed by all
    /// interested parties; the message is now complete as this receiver
    /// sees it.
    pub fn complete_rcv_msg(&mut self, envelope: MessageEnvelope) -> Result<(), Error> {
        if !self.is_attached() {
            // detached: clear silently, nothing goes on the wire
            return Ok(());
        }
        let id = envelope.command_id();
        tracing::debug!(session = %self.id, command = %id, "receive completed");
        self.cursor.receiver_completed(id);
        if envelope.requires_accept() {
            // will appear in the next message.accept we send
            self.accepted.add(id);
        }

        // complete any execution.sync commands that were waiting on this
        let mut flush_completion = false;
        while let Some(&sync_id) = self.pending_execution_syncs.front() {
            let ready = match self.cursor.lowest_incomplete() {
                None => true,
                Some(low) => low >= sync_id,
            };
            if !ready {
                break;
            }
            self.pending_execution_syncs.pop_front();
            tracing::debug!(session = %self.id, command = %sync_id, "delayed execution.sync completed");
            self.cursor.receiver_completed(sync_id);
            // likely the peer is waiting on this completion
            flush_completion = true;
        }

        if envelope.is_sync() {
            self.send_accept_and_completion()?;
        } else if flush_completion {
            self.send_completion()?;
        }
        Ok(())
    }

    fn send_accept_and_completion(&mut self) -> Result<(), Error> {
        if !self.accepted.is_empty() {
            let accepted = self.accepted.take();
            self.peer()?.message_accept(&accepted);
        }
        self.send_completion()
    }

    /// Flush the completed-ids set to the peer.
    pub fn send_completion(&mut self) -> Result<(), Error> {
        if !self.cursor.has_completed_to_send() {
            return Ok(());
        }
        let completed = self.cursor.take_completed();
        self.peer()?.session_send_completion(&completed);
        Ok(())
    }

    /// The peer acknowledged these outbound commands; the semantic layer may
    /// release their resources.
    pub fn sender_completed(&mut self, commands: &SequenceSet) {
        self.cursor.sender_completed(commands);
        self.semantic.completed(commands);
    }

    /// Outbound delivery at the current send point.
    pub fn deliver(&mut self, record: &mut dyn DeliveryRecord, sync: bool) -> Result<(), Error> {
        let point = self.cursor.command_point();
        if point.offset != 0 {
            return Err(Error::InvariantViolation(format!(
                "delivery starting at non-zero send offset {}",
                point.offset
            )));
        }
        let command_id = point.command;
        let att = self
            .attachment
            .as_mut()
            .ok_or_else(|| Error::Session("deliver on a detached session".into()))?;
        let max_frame_size = att.max_frame_size;
        record.deliver(&mut *att.sink, command_id, max_frame_size)?;
        self.cursor.advance_send_point()?;
        if sync {
            self.peer()?.execution_sync();
        }
        Ok(())
    }

    /// The session is ready to send: activate the semantic layer and issue
    /// the initial producer credit.
    pub fn ready_to_send(&mut self) -> Result<(), Error> {
        tracing::debug!(session = %self.id, "ready to send, activating output");
        self.semantic.attached();
        if self.rate_flow.is_none() {
            return Ok(());
        }
        let cluster = self.cluster_order()?;
        let (credit, now) = {
            let flow = self.lock_flow();
            (flow.initial_credit(), Instant::now())
        };
        tracing::debug!(session = %self.id, credit, "issuing producer message credit");
        cluster.message_set_flow_mode("", 0);
        cluster.message_flow("", 0, credit);
        let held = {
            let mut flow = self.lock_flow();
            flow.sent_credit(now, credit);
            flow.credit()
        };
        self.metrics.client_credit = held;
        self.metrics.credit_granted += u64::from(credit);
        Ok(())
    }

    /// Account for received producer messages and grant credit back when
    /// the window allows. Returns false when no credit could be granted but
    /// unacknowledged capacity exists, i.e. a deferred grant is needed.
    fn process_send_credit(&mut self, msgs: u32) -> Result<bool, Error> {
        let now = Instant::now();
        let (violation, send_credit, stopped, held) = {
            let mut flow = self.lock_flow();
            if msgs > 0 && flow.flow_stopped(now) {
                (true, 0, true, flow.credit())
            } else {
                let credit = flow.received_message(now, msgs);
                (false, credit, flow.flow_stopped(now), flow.credit())
            }
        };

        if violation {
            let id = self.cursor.next_receive();
            tracing::warn!(session = %self.id, "{}", Error::RateViolation(id));
            self.cluster_order()?.message_stop("");
            return Ok(true);
        }

        self.metrics.client_credit = held;
        if send_credit > 0 {
            tracing::debug!(session = %self.id, credit = send_credit, "send producer credit");
            self.cluster_order()?.message_flow("", 0, send_credit);
            let held = {
                let mut flow = self.lock_flow();
                flow.sent_credit(now, send_credit);
                flow.credit()
            };
            self.metrics.client_credit = held;
            self.metrics.credit_granted += u64::from(send_credit);
            Ok(true)
        } else {
            Ok(!stopped)
        }
    }

    fn schedule_credit(&mut self) {
        let Some(att) = &self.attachment else {
            return;
        };
        let delay = self.lock_flow().scheduled_delay();
        let events = att.events.clone();
        let handle = self.timer.add(
            delay,
            Box::new(move || {
                let _ = events.send(SessionEvent::ScheduledCredit);
            }),
        );
        if let Some(previous) = self.credit_task.replace(handle) {
            previous.cancel();
        }
    }

    /// Timed credit replenishment. The timer's cancel is best-effort, so
    /// the fire path re-checks the session is attached before acting.
    pub fn scheduled_credit_fire(&mut self) -> Result<(), Error> {
        if !self.is_attached() || self.rate_flow.is_none() {
            return Ok(());
        }
        let now = Instant::now();
        let grant = self.lock_flow().replenish(now);
        if grant > 0 {
            tracing::debug!(session = %self.id, credit = grant, "scheduled producer credit");
            self.cluster_order()?.message_flow("", 0, grant);
            let held = {
                let mut flow = self.lock_flow();
                flow.sent_credit(now, grant);
                flow.credit()
            };
            self.metrics.client_credit = held;
            self.metrics.credit_granted += u64::from(grant);
        } else if self.lock_flow().flow_stopped(now) {
            tracing::warn!(session = %self.id, "reschedule sending credit");
            self.schedule_credit();
        }
        Ok(())
    }

    /// Drain completions that foreign threads batched for this task.
    pub fn drain_scheduled_completions(&mut self) -> Result<(), Error> {
        let registry = self.incomplete.clone();
        registry.drain_scheduled(self)
    }

    fn lock_flow(&self) -> std::sync::MutexGuard<'_, RateFlowControl> {
        // rate_flow is Some on every path that calls this
        self.rate_flow
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()))
            .unwrap_or_else(|| unreachable!("flow control accessed while disabled"))
    }

    fn peer(&self) -> Result<Arc<dyn PeerProxy>, Error> {
        self.attachment
            .as_ref()
            .map(|a| Arc::clone(&a.peer))
            .ok_or_else(|| Error::Session("session is not attached".into()))
    }

    fn cluster_order(&self) -> Result<Arc<dyn PeerProxy>, Error> {
        self.attachment
            .as_ref()
            .map(|a| Arc::clone(&a.cluster_order))
            .ok_or_else(|| Error::Session("session is not attached".into()))
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.close();
    }
}
