//! Requests awaiting their reply, bounded and kept in insertion order.

use std::time::Instant;

use crate::messages::MessageKind;
use crate::timer::TimerId;
use crate::{Error, Result};

use super::queue::ReplyMatch;

#[derive(Debug)]
pub struct WaitEntry {
    /// Unique per connection, used by the response timer to find its entry.
    pub id: u64,
    pub reply: ReplyMatch,
    pub submitted: Instant,
    /// None until the response timer is armed.
    pub timer: Option<TimerId>,
}

impl WaitEntry {
    pub fn matches(&self, kind: MessageKind, seq: u32) -> bool {
        self.reply.kind == kind && self.reply.seq == seq
    }
}

#[derive(Debug)]
pub struct WaitResponseSet {
    entries: Vec<WaitEntry>,
    capacity: usize,
    discarded: u64,
}

impl WaitResponseSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            discarded: 0,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Requests dropped because the set was full.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    // === Public Methods ===

    /// Append an entry. A full set drops it and returns [Error::Resource].
    pub fn insert(&mut self, entry: WaitEntry) -> Result<(), (Error, WaitEntry)> {
        if self.is_full() {
            self.discarded += 1;
            return Err((Error::Resource("wait response set full"), entry));
        }

        self.entries.push(entry);

        Ok(())
    }

    /// Count a request dropped before it reached [Self::insert].
    pub fn count_discard(&mut self) -> u64 {
        self.discarded += 1;
        self.discarded
    }

    /// Attach the armed response timer. Returns false if the entry is gone.
    pub fn attach_timer(&mut self, id: u64, timer: TimerId) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.timer = Some(timer);
                true
            }
            None => false,
        }
    }

    /// Remove the oldest entry waiting for `kind` with sequence `seq`.
    pub fn take(&mut self, kind: MessageKind, seq: u32) -> Result<WaitEntry> {
        let position = self
            .entries
            .iter()
            .position(|e| e.matches(kind, seq))
            .ok_or(Error::NotFound)?;

        Ok(self.entries.remove(position))
    }

    pub fn take_by_id(&mut self, id: u64) -> Option<WaitEntry> {
        let position = self.entries.iter().position(|e| e.id == id)?;

        Some(self.entries.remove(position))
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<WaitEntry> {
        std::mem::take(&mut self.entries)
    }
}
