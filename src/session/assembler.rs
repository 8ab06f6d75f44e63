use std::sync::Arc;

use crate::error::Error;
use crate::framing::{Frame, FrameBody, FrameFlags, Header, Method, SequenceNumber};
use crate::session::pending::ReceiveCompletion;

/// An assembled inbound message: the frames of one content-bearing command
/// plus its receive-completion tracker.
#[derive(Debug)]
pub struct MessageEnvelope {
    command_id: SequenceNumber,
    publisher: Option<String>,
    frames: Vec<Frame>,
    requires_accept: bool,
    completion: Arc<ReceiveCompletion>,
}

impl MessageEnvelope {
    fn new(command_id: SequenceNumber, requires_accept: bool) -> Self {
        Self {
            command_id,
            publisher: None,
            frames: Vec::new(),
            requires_accept,
            completion: ReceiveCompletion::new(),
        }
    }

    pub fn command_id(&self) -> SequenceNumber {
        self.command_id
    }

    /// The method that opened the frameset.
    pub fn method(&self) -> Option<&Method> {
        self.frames.first().and_then(Frame::method)
    }

    pub fn is_sync(&self) -> bool {
        self.method().map(|m| m.sync).unwrap_or(false)
    }

    pub fn requires_accept(&self) -> bool {
        self.requires_accept
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn publisher(&self) -> Option<&str> {
        self.publisher.as_deref()
    }

    pub(crate) fn set_publisher(&mut self, publisher: String) {
        self.publisher = Some(publisher);
    }

    pub fn completion(&self) -> &Arc<ReceiveCompletion> {
        &self.completion
    }
}

/// Assembles one [`MessageEnvelope`] at a time from the inbound frame
/// stream. Framesets on one channel never interleave, so a single open slot
/// is enough.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    current: Option<MessageEnvelope>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Feed one frame; returns the envelope when the frameset closes.
    pub fn handle(
        &mut self,
        frame: Frame,
        id: SequenceNumber,
    ) -> Result<Option<MessageEnvelope>, Error> {
        if frame.flags.begin_frameset() && frame.flags.begin_segment() {
            if self.current.is_some() {
                return Err(Error::ProtocolViolation(format!(
                    "begin of frameset at command {id} while previous frameset is open"
                )));
            }
            let method = frame.method().ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "frameset at command {id} does not open with a method"
                ))
            })?;
            self.current = Some(MessageEnvelope::new(id, method.requires_accept));
        }

        let Some(mut envelope) = self.current.take() else {
            return Err(Error::ProtocolViolation(format!(
                "content frame at command {id} without an open frameset"
            )));
        };

        let closing = frame.flags.end_frameset() && frame.flags.end_segment();
        let lone_command = closing && frame.flags.begin_frameset();
        envelope.frames.push(frame);

        if !closing {
            self.current = Some(envelope);
            return Ok(None);
        }
        if lone_command && envelope.frames.len() == 1 {
            // A command-only envelope with content semantics: give it the
            // method+header shape the rest of the broker expects.
            envelope.frames.push(Frame::new(
                FrameFlags::full_segment(),
                FrameBody::Header(Header::empty()),
            ));
        }
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::framing::FrameFlags as F;

    fn transfer_frames(payload: &[&[u8]]) -> Vec<Frame> {
        let mut frames = vec![Frame::new(
            F::new(F::BEGIN_FRAMESET | F::BEGIN_SEGMENT | F::END_SEGMENT),
            FrameBody::Method(Method::transfer(Bytes::from_static(b"dest"), true)),
        )];
        frames.push(Frame::new(
            F::full_segment(),
            FrameBody::Header(Header::empty()),
        ));
        for (i, chunk) in payload.iter().enumerate() {
            let mut flags = F::new(0);
            if i == 0 {
                flags = flags.with(F::BEGIN_SEGMENT);
            }
            if i == payload.len() - 1 {
                flags = flags.with(F::END_SEGMENT | F::END_FRAMESET);
            }
            frames.push(Frame::new(flags, FrameBody::Content(Bytes::copy_from_slice(chunk))));
        }
        frames
    }

    #[test]
    fn round_trips_method_header_content() {
        let mut assembler = MessageAssembler::new();
        let frames = transfer_frames(&[b"abc", b"def"]);
        let id = SequenceNumber(7);

        let mut out = None;
        for frame in frames.clone() {
            out = assembler.handle(frame, id).unwrap();
        }
        let envelope = out.expect("frameset closed");
        assert_eq!(envelope.command_id(), id);
        assert!(envelope.requires_accept());
        assert_eq!(envelope.frames(), &frames[..]);
    }

    #[test]
    fn lone_command_gets_dummy_header() {
        let mut assembler = MessageAssembler::new();
        let frame = Frame::command(Method::transfer(Bytes::new(), false));
        let envelope = assembler
            .handle(frame, SequenceNumber(0))
            .unwrap()
            .expect("single-frame command closes immediately");
        assert_eq!(envelope.frames().len(), 2);
        assert!(matches!(envelope.frames()[1].body, FrameBody::Header(_)));
    }

    #[test]
    fn content_without_open_frameset_is_rejected() {
        let mut assembler = MessageAssembler::new();
        let frame = Frame::new(
            F::new(F::END_SEGMENT | F::END_FRAMESET),
            FrameBody::Content(Bytes::from_static(b"x")),
        );
        assert!(matches!(
            assembler.handle(frame, SequenceNumber(0)),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn reopened_frameset_is_rejected() {
        let mut assembler = MessageAssembler::new();
        let open = Frame::new(
            F::new(F::BEGIN_FRAMESET | F::BEGIN_SEGMENT | F::END_SEGMENT),
            FrameBody::Method(Method::transfer(Bytes::new(), false)),
        );
        assembler.handle(open.clone(), SequenceNumber(0)).unwrap();
        assert!(matches!(
            assembler.handle(open, SequenceNumber(1)),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn at_most_one_envelope_per_command() {
        let mut assembler = MessageAssembler::new();
        let mut envelopes = 0;
        for frame in transfer_frames(&[b"payload"]) {
            if assembler.handle(frame, SequenceNumber(3)).unwrap().is_some() {
                envelopes += 1;
            }
        }
        assert_eq!(envelopes, 1);
        assert!(!assembler.in_progress());
    }
}
