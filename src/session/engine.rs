//! The session's event loop: the "I/O thread" that owns all protocol-state
//! mutation.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::endpoint::DeliveryRecord;
use crate::error::Error;
use crate::framing::{Frame, SequenceSet};
use crate::util::Running;

use super::{Attachment, SessionCore};

/// Cross-thread notifications posted back onto the session task.
#[derive(Debug)]
pub enum SessionEvent {
    /// The scheduled-completion deque went non-empty; drain it.
    CompletionsScheduled,
    /// The deferred credit task fired.
    ScheduledCredit,
}

/// Host-driven operations serialized onto the session task.
pub enum SessionControl {
    Attach(Attachment),
    ReadyToSend,
    Detach,
    Close,
    Deliver {
        record: Box<dyn DeliveryRecord + Send>,
        sync: bool,
    },
    SenderCompleted(SequenceSet),
}

pub struct SessionEngine {
    session: SessionCore,
    incoming: mpsc::Receiver<Frame>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    control: mpsc::Receiver<SessionControl>,
}

impl SessionEngine {
    pub fn new(
        session: SessionCore,
        incoming: mpsc::Receiver<Frame>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        control: mpsc::Receiver<SessionControl>,
    ) -> Self {
        Self {
            session,
            incoming,
            events,
            control,
        }
    }

    pub fn session(&self) -> &SessionCore {
        &self.session
    }

    pub fn spawn(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.event_loop())
    }

    fn on_incoming(&mut self, frame: Frame) -> Result<Running, Error> {
        self.session.handle_in(frame)?;
        Ok(Running::Continue)
    }

    fn on_event(&mut self, event: SessionEvent) -> Result<Running, Error> {
        match event {
            SessionEvent::CompletionsScheduled => self.session.drain_scheduled_completions()?,
            SessionEvent::ScheduledCredit => self.session.scheduled_credit_fire()?,
        }
        Ok(Running::Continue)
    }

    fn on_control(&mut self, control: SessionControl) -> Result<Running, Error> {
        match control {
            SessionControl::Attach(attachment) => {
                self.session.attach(attachment)?;
                Ok(Running::Continue)
            }
            SessionControl::ReadyToSend => {
                self.session.ready_to_send()?;
                Ok(Running::Continue)
            }
            SessionControl::Detach => {
                self.session.detach();
                Ok(Running::Continue)
            }
            SessionControl::Close => Ok(Running::Stop),
            SessionControl::Deliver { mut record, sync } => {
                self.session.deliver(record.as_mut(), sync)?;
                Ok(Running::Continue)
            }
            SessionControl::SenderCompleted(commands) => {
                self.session.sender_completed(&commands);
                Ok(Running::Continue)
            }
        }
    }

    async fn event_loop(mut self) -> Result<(), Error> {
        let outcome = loop {
            let step = tokio::select! {
                frame = self.incoming.recv() => match frame {
                    Some(frame) => self.on_incoming(frame),
                    // inbound side of the connection dropped
                    None => Ok(Running::Stop),
                },
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => Ok(Running::Stop),
                },
                control = self.control.recv() => match control {
                    Some(control) => self.on_control(control),
                    None => Ok(Running::Stop),
                },
            };
            match step {
                Ok(Running::Continue) => {}
                Ok(Running::Stop) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        match &outcome {
            Err(err @ Error::InvariantViolation(_)) => {
                tracing::error!(session = %self.session.id(), error = %err, "aborting session");
                self.session.abort();
            }
            Err(err) => self.session.fail(err),
            Ok(()) => {}
        }
        self.session.close();
        tracing::debug!(session = %self.session.id(), "session engine exiting event loop");
        outcome
    }
}
