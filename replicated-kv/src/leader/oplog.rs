use crate::message::Message;

/// Append-only record of every committed write, in sequence order.
///
/// Kept in memory for the leader's lifetime so a follower that reconnects can
/// be replayed everything it missed. Entries are never compacted.
#[derive(Debug, Default)]
pub struct OperationLog {
    entries: Vec<Message>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a committed write.
    ///
    /// Hands the entry back if its sequence does not follow the last one.
    pub fn append(&mut self, entry: Message) -> Result<(), Message> {
        if entry.sequence <= self.last_sequence() {
            return Err(entry);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Entries with a sequence strictly greater than `after`, ascending.
    pub fn since(&self, after: u64) -> &[Message] {
        let start = self.entries.partition_point(|entry| entry.sequence <= after);
        &self.entries[start..]
    }

    /// Sequence of the newest entry, or 0 when empty.
    pub fn last_sequence(&self) -> u64 {
        self.entries.last().map(|entry| entry.sequence).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
