//! In-flight inbound messages awaiting asynchronous completion.
//!
//! The registry retains each assembled envelope until every interested party
//! (store, downstream queues) has released it. Completion may arrive on the
//! session task or on a foreign thread; foreign completions are batched onto
//! a scheduled deque and drained back on the session task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use tokio::sync::mpsc::UnboundedSender;

use crate::error::Error;
use crate::session::engine::SessionEvent;
use crate::session::{MessageEnvelope, SessionCore};

/// Stable identity of a registered pending receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingToken(u64);

/// How a completion reaches the session.
pub enum CompleteMode<'a> {
    /// On the session task; the registry invokes
    /// [`SessionCore::complete_rcv_msg`] directly with its lock dropped.
    Sync(&'a mut SessionCore),
    /// From a foreign thread; batched for the session task to drain.
    Async,
}

struct Entry {
    envelope: MessageEnvelope,
    /// Back-reference to the owning session's event queue. Nullable: cancel
    /// clears it so a completion enqueued elsewhere can no longer reach the
    /// session.
    session: Option<UnboundedSender<SessionEvent>>,
}

struct Scheduled {
    token: PendingToken,
    envelope: MessageEnvelope,
}

#[derive(Default)]
struct State {
    next_token: u64,
    entries: HashMap<PendingToken, Entry>,
    /// Tokens whose completion body is running outside the lock.
    completing: Vec<PendingToken>,
    scheduled: VecDeque<Scheduled>,
}

struct Inner {
    state: Mutex<State>,
    joined: Condvar,
}

/// Shared handle to the registry. The session owns one; completer threads
/// hold clones through [`CompletionHandle`]s.
#[derive(Clone)]
pub struct PendingReceiveRegistry {
    inner: Arc<Inner>,
}

impl Default for PendingReceiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReceiveRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                joined: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens of the currently live entries.
    pub fn tokens(&self) -> Vec<PendingToken> {
        self.lock().entries.keys().copied().collect()
    }

    /// Insert an envelope and arm its completion tracker with the returned
    /// token. Registering the same envelope twice is an invariant violation.
    pub fn register(
        &self,
        envelope: MessageEnvelope,
        session: Option<UnboundedSender<SessionEvent>>,
    ) -> Result<PendingToken, Error> {
        let completion = envelope.completion();
        let mut state = self.lock();
        let token = PendingToken(state.next_token);
        state.next_token += 1;
        completion
            .arm(Gate {
                registry: self.clone(),
                token,
            })
            .map_err(|_| {
                Error::InvariantViolation(format!(
                    "message {} registered twice",
                    envelope.command_id()
                ))
            })?;
        state.entries.insert(token, Entry { envelope, session });
        Ok(token)
    }

    /// Complete a pending receive. Unknown tokens are no-ops: the entry was
    /// cancelled or a duplicate callback fired.
    pub fn complete(&self, token: PendingToken, mode: CompleteMode<'_>) -> Result<(), Error> {
        let mut state = self.lock();
        let Some(entry) = state.entries.remove(&token) else {
            return Ok(());
        };
        match mode {
            CompleteMode::Sync(session) => {
                state.completing.push(token);
                // The lock is dropped before touching the session so a
                // foreign completion can never invert lock order with the
                // session's receive tracking.
                drop(state);
                let result = session.complete_rcv_msg(entry.envelope);
                let mut state = self.lock();
                state.completing.retain(|t| *t != token);
                drop(state);
                self.inner.joined.notify_all();
                result
            }
            CompleteMode::Async => {
                let Entry { envelope, session } = entry;
                state.scheduled.push_back(Scheduled { token, envelope });
                if state.scheduled.len() == 1 {
                    // first item: ask the session task to drain
                    if let Some(session) = &session {
                        let _ = session.send(SessionEvent::CompletionsScheduled);
                    }
                }
                Ok(())
            }
        }
    }

    /// Drain the scheduled deque on the session task. Each envelope is
    /// completed without the registry lock held; entries cancelled since
    /// they were scheduled have already been dropped from the deque.
    pub fn drain_scheduled(&self, session: &mut SessionCore) -> Result<(), Error> {
        loop {
            let scheduled = {
                let mut state = self.lock();
                match state.scheduled.pop_front() {
                    Some(s) => s,
                    None => return Ok(()),
                }
            };
            tracing::debug!(
                command = %scheduled.envelope.command_id(),
                "scheduled receive completion"
            );
            session.complete_rcv_msg(scheduled.envelope)?;
        }
    }

    /// Detach a pending receive from the session and wait for any in-flight
    /// completion of it to finish. After return, no completion callback for
    /// this token will reach the session.
    pub fn cancel(&self, token: PendingToken) {
        let mut state = self.lock();
        // Dropping the entry clears the session back-reference; anything
        // already scheduled is pruned so the drainer skips it.
        if let Some(mut entry) = state.entries.remove(&token) {
            entry.session = None;
        }
        state.scheduled.retain(|s| s.token != token);
        while state.completing.contains(&token) {
            state = self
                .inner
                .joined
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Cancel every live entry and discard anything scheduled. Used by
    /// session teardown.
    pub fn cancel_all(&self) {
        let tokens: Vec<PendingToken> = self.lock().entries.keys().copied().collect();
        for token in tokens {
            tracing::debug!(?token, "cancelling outstanding receive completion");
            self.cancel(token);
        }
        self.lock().scheduled.clear();
    }
}

struct Gate {
    registry: PendingReceiveRegistry,
    token: PendingToken,
}

/// Reference-counted receive-completion tracker carried by each envelope.
///
/// `begin` holds the message incomplete while the semantic layer inspects
/// it; every deferral adds another hold. When the count returns to zero the
/// message is complete: synchronously if the session observed it via
/// [`ReceiveCompletion::end`], otherwise through the registry's async path.
pub struct ReceiveCompletion {
    outstanding: AtomicUsize,
    gate: OnceLock<Gate>,
}

impl std::fmt::Debug for ReceiveCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveCompletion")
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("armed", &self.gate.get().is_some())
            .finish()
    }
}

impl ReceiveCompletion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            outstanding: AtomicUsize::new(0),
            gate: OnceLock::new(),
        })
    }

    fn arm(&self, gate: Gate) -> Result<(), Gate> {
        self.gate.set(gate)
    }

    /// Hold the message incomplete while it is being handed around on the
    /// session task.
    pub(crate) fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Release the `begin` hold. Returns true when this was the last hold,
    /// in which case the caller completes the message synchronously.
    pub(crate) fn end(&self) -> bool {
        self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Take an extra hold that an asynchronous party releases later.
    pub fn defer(self: &Arc<Self>) -> CompletionHandle {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        CompletionHandle {
            tracker: Arc::clone(self),
            released: false,
        }
    }

    fn release_deferred(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last hold released from an asynchronous completer. The gate is
        // always armed before `end` drops the begin hold, so a count of
        // zero here implies registration happened.
        if let Some(gate) = self.gate.get() {
            let _ = gate.registry.complete(gate.token, CompleteMode::Async);
        }
    }
}

/// A single deferral of receive completion. Completing twice is impossible;
/// dropping an unreleased handle counts as completion so an aborted
/// completer cannot wedge the message.
pub struct CompletionHandle {
    tracker: Arc<ReceiveCompletion>,
    released: bool,
}

impl CompletionHandle {
    pub fn complete(mut self) {
        self.released = true;
        self.tracker.release_deferred();
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if !self.released {
            self.tracker.release_deferred();
        }
    }
}
