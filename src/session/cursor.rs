use crate::error::Error;
use crate::framing::{SequenceNumber, SequenceSet};

/// A position in a directional command stream: the command id and the byte
/// offset within that command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandPoint {
    pub command: SequenceNumber,
    pub offset: u32,
}

/// Sender/receiver sequence-number bookkeeping for one session.
///
/// Survives detach/attach untouched; resume relies on the cursor carrying
/// the exact pre-detach state.
#[derive(Debug, Default)]
pub struct CommandCursor {
    // receiver direction
    receive_current: SequenceNumber,
    incomplete_in: SequenceSet,
    completed_to_send: SequenceSet,
    // sender direction
    send_point: CommandPoint,
    outstanding_sent: SequenceSet,
}

impl CommandCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the command currently being received. Does not advance.
    pub fn next_receive(&self) -> SequenceNumber {
        self.receive_current
    }

    /// Record that a full command has arrived: the current id joins the
    /// incomplete set and the receive cursor moves on.
    pub fn command_received(&mut self) -> SequenceNumber {
        let id = self.receive_current;
        self.incomplete_in.add(id);
        self.receive_current = id.next();
        id
    }

    /// Mark a received command complete. Completing an id that is not
    /// incomplete is a no-op, so duplicate async callbacks are harmless.
    pub fn receiver_completed(&mut self, id: SequenceNumber) {
        if !self.incomplete_in.contains(id) {
            return;
        }
        self.incomplete_in.remove(id);
        self.completed_to_send.add(id);
    }

    pub fn lowest_incomplete(&self) -> Option<SequenceNumber> {
        self.incomplete_in.front()
    }

    pub fn incomplete(&self) -> &SequenceSet {
        &self.incomplete_in
    }

    /// Drain the ids awaiting a completion frame.
    pub fn take_completed(&mut self) -> SequenceSet {
        self.completed_to_send.take()
    }

    pub fn has_completed_to_send(&self) -> bool {
        !self.completed_to_send.is_empty()
    }

    pub fn command_point(&self) -> CommandPoint {
        self.send_point
    }

    /// Move the send point past the command just delivered. The offset must
    /// be back at zero; a non-zero offset means a delivery was left half
    /// written.
    pub fn advance_send_point(&mut self) -> Result<SequenceNumber, Error> {
        if self.send_point.offset != 0 {
            return Err(Error::InvariantViolation(format!(
                "send point offset {} at delivery boundary",
                self.send_point.offset
            )));
        }
        let id = self.send_point.command;
        self.outstanding_sent.add(id);
        self.send_point.command = id.next();
        Ok(id)
    }

    /// The peer acknowledged these outbound commands as complete.
    pub fn sender_completed(&mut self, commands: &SequenceSet) {
        self.outstanding_sent.remove_set(commands);
    }

    pub fn outstanding_sent(&self) -> &SequenceSet {
        &self.outstanding_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_moves_id_between_sets() {
        let mut cursor = CommandCursor::new();
        let a = cursor.command_received();
        let b = cursor.command_received();
        assert_eq!(cursor.lowest_incomplete(), Some(a));

        cursor.receiver_completed(a);
        assert_eq!(cursor.lowest_incomplete(), Some(b));
        let completed = cursor.take_completed();
        assert!(completed.contains(a));
        assert!(!completed.contains(b));
        // a never reappears in incomplete
        assert!(!cursor.incomplete().contains(a));
    }

    #[test]
    fn duplicate_completion_is_idempotent() {
        let mut cursor = CommandCursor::new();
        let a = cursor.command_received();
        cursor.receiver_completed(a);
        let first = cursor.take_completed();
        assert_eq!(first.len(), 1);

        // second callback for the same command
        cursor.receiver_completed(a);
        assert!(cursor.take_completed().is_empty());
    }

    #[test]
    fn completing_unknown_id_is_noop() {
        let mut cursor = CommandCursor::new();
        cursor.receiver_completed(SequenceNumber(42));
        assert!(cursor.take_completed().is_empty());
    }

    #[test]
    fn send_point_advances_by_one() {
        let mut cursor = CommandCursor::new();
        let first = cursor.advance_send_point().unwrap();
        let second = cursor.advance_send_point().unwrap();
        assert_eq!(second, first.next());
        assert_eq!(cursor.command_point().command, second.next());
        assert_eq!(cursor.command_point().offset, 0);
        assert!(cursor.outstanding_sent().contains(first));
    }

    #[test]
    fn advance_with_partial_write_fails() {
        let mut cursor = CommandCursor::new();
        cursor.send_point.offset = 17;
        assert!(matches!(
            cursor.advance_send_point(),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn sender_completed_releases_outstanding() {
        let mut cursor = CommandCursor::new();
        let a = cursor.advance_send_point().unwrap();
        let b = cursor.advance_send_point().unwrap();
        let acked: SequenceSet = [a].into_iter().collect();
        cursor.sender_completed(&acked);
        assert!(!cursor.outstanding_sent().contains(a));
        assert!(cursor.outstanding_sent().contains(b));
    }
}
