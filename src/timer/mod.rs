//! Hierarchical timing wheel.
//!
//! Four cascading rings of [RING_SLOTS] slots each: seconds, minutes, hours and days
//! (named after their role, a "second" is one tick). Setting and cancelling a timer is
//! O(1); a tick touches only the current slot of each ring that advanced.
//!
//! Every entry lives in exactly one slot. An entry is placed in the coarsest ring whose
//! digit of the expiry tick differs from the current position, and is relocated into a
//! finer ring when that coarse slot comes around, until it reaches the seconds ring and
//! fires.

mod service;

pub use service::TimerService;

use std::fmt::{self, Debug, Formatter};

use bytes::Bytes;
use slab::Slab;

/// Bits of the tick counter consumed by a single ring.
pub const RING_BITS: u32 = 5;
/// Number of slots per ring.
pub const RING_SLOTS: usize = 1 << RING_BITS;
/// Number of cascading rings (seconds, minutes, hours, days).
pub const RINGS: usize = 4;
/// Shortest accepted duration, in ticks.
pub const MIN_TICKS: u64 = 1;
/// Longest accepted duration, in ticks (32⁴).
pub const MAX_TICKS: u64 = 1 << (RING_BITS * RINGS as u32);

const SLOT_MASK: u64 = RING_SLOTS as u64 - 1;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors returned by [TimerWheel] and [TimerService].
pub enum TimerError {
    #[error("Timer duration of {0} ticks is below one tick")]
    TooShort(u64),

    #[error("Timer duration of {0} ticks exceeds the wheel range")]
    TooLong(u64),

    /// The handle does not refer to a pending timer (fired, cancelled, or never existed).
    #[error("Unknown timer")]
    UnknownTimer,

    #[error("Timer service was shutdown")]
    Shutdown,
}

/// Handle to a pending timer.
///
/// Handles are never reused: a stale handle to a fired or cancelled timer is rejected
/// even if its arena slot has been recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: usize,
    generation: u64,
}

/// Boxed expiry callback, receives the timer handle and its payload.
pub type TimerCallback<T> = Box<dyn FnOnce(TimerId, T) + Send>;

struct Entry<T> {
    generation: u64,
    /// Absolute tick at which the timer expires.
    expires: u64,
    /// Target slot of the expiry tick in each ring, finest first.
    remain: [usize; RINGS],
    /// Ring, slot and position within the slot's bucket this entry occupies.
    position: (usize, usize, usize),
    key: Option<Bytes>,
    payload: T,
    callback: TimerCallback<T>,
}

/// An expired timer detached from the wheel; call [Fired::fire] to run its callback.
pub struct Fired<T> {
    id: TimerId,
    payload: T,
    callback: TimerCallback<T>,
}

impl<T> Fired<T> {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn fire(self) {
        (self.callback)(self.id, self.payload)
    }
}

/// Four-ring hierarchical timing wheel. Not internally synchronized, see [TimerService].
pub struct TimerWheel<T> {
    /// Ticks elapsed since creation.
    now: u64,
    next_generation: u64,
    entries: Slab<Entry<T>>,
    rings: [[Vec<usize>; RING_SLOTS]; RINGS],
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for TimerWheel<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("now", &self.now)
            .field("pending", &self.entries.len())
            .finish()
    }
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        TimerWheel {
            now: 0,
            next_generation: 0,
            entries: Slab::new(),
            rings: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
        }
    }

    // === Getters ===

    /// Ticks processed so far.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Current pointer of each ring, finest first.
    pub fn pointers(&self) -> [usize; RINGS] {
        digits(self.now)
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entry(id).is_some()
    }

    /// Ticks left before `id` fires.
    pub fn remaining(&self, id: TimerId) -> Option<u64> {
        self.entry(id).map(|entry| entry.expires - self.now)
    }

    pub fn key(&self, id: TimerId) -> Option<&Bytes> {
        self.entry(id).and_then(|entry| entry.key.as_ref())
    }

    // === Public Methods ===

    /// Schedule `callback` to run with `payload` after `ticks` ticks.
    pub fn insert(
        &mut self,
        ticks: u64,
        payload: T,
        callback: TimerCallback<T>,
    ) -> Result<TimerId, TimerError> {
        if ticks < MIN_TICKS {
            return Err(TimerError::TooShort(ticks));
        }
        if ticks > MAX_TICKS {
            return Err(TimerError::TooLong(ticks));
        }

        let expires = self.now + ticks;
        let generation = self.next_generation;
        self.next_generation += 1;

        let index = self.entries.insert(Entry {
            generation,
            expires,
            remain: digits(expires),
            position: (0, 0, 0),
            key: None,
            payload,
            callback,
        });
        self.place(index);

        Ok(TimerId { index, generation })
    }

    /// Attach a key to a pending timer, replacing any previous one.
    pub fn set_key(&mut self, id: TimerId, key: Bytes) -> Result<(), TimerError> {
        let entry = self.entry_mut(id).ok_or(TimerError::UnknownTimer)?;
        entry.key = Some(key);
        Ok(())
    }

    /// Remove a pending timer without running its callback, returning its payload.
    pub fn cancel(&mut self, id: TimerId) -> Result<T, TimerError> {
        if self.entry(id).is_none() {
            return Err(TimerError::UnknownTimer);
        }

        self.unlink(id.index);
        let entry = self.entries.remove(id.index);

        Ok(entry.payload)
    }

    /// Advance one tick and run the callbacks of every timer that expired.
    ///
    /// Returns the number of callbacks run.
    pub fn tick(&mut self) -> usize {
        let fired = self.advance();
        let count = fired.len();

        for timer in fired {
            timer.fire();
        }

        count
    }

    /// Advance one tick and detach the expired timers without running their callbacks.
    pub fn advance(&mut self) -> Vec<Fired<T>> {
        self.now += 1;
        let pointers = digits(self.now);

        // A ring advances only when every finer ring wrapped to zero.
        let mut coarsest = 0;
        while coarsest + 1 < RINGS && pointers[coarsest] == 0 {
            coarsest += 1;
        }

        for ring in (1..=coarsest).rev() {
            let bucket = std::mem::take(&mut self.rings[ring][pointers[ring]]);
            for index in bucket {
                self.place(index);
            }
        }

        let bucket = std::mem::take(&mut self.rings[0][pointers[0]]);
        let mut fired = Vec::with_capacity(bucket.len());

        for index in bucket {
            if self.entries[index].expires > self.now {
                // Only possible for entries a full wheel revolution away.
                self.place(index);
                continue;
            }

            let entry = self.entries.remove(index);
            fired.push(Fired {
                id: TimerId {
                    index,
                    generation: entry.generation,
                },
                payload: entry.payload,
                callback: entry.callback,
            });
        }

        fired
    }

    // === Private Methods ===

    fn entry(&self, id: TimerId) -> Option<&Entry<T>> {
        self.entries
            .get(id.index)
            .filter(|entry| entry.generation == id.generation)
    }

    fn entry_mut(&mut self, id: TimerId) -> Option<&mut Entry<T>> {
        self.entries
            .get_mut(id.index)
            .filter(|entry| entry.generation == id.generation)
    }

    /// Put an entry into the bucket matching its expiry relative to the current tick.
    fn place(&mut self, index: usize) {
        let pointers = digits(self.now);
        let entry = &self.entries[index];

        let ring = if entry.expires == self.now {
            // Expires during this tick; the seconds slot is processed last.
            0
        } else {
            (0..RINGS)
                .rev()
                .find(|&ring| entry.remain[ring] != pointers[ring])
                // Same digits everywhere: exactly one full revolution away.
                .unwrap_or(RINGS - 1)
        };
        let slot = entry.remain[ring];

        let bucket = &mut self.rings[ring][slot];
        bucket.push(index);
        let position = bucket.len() - 1;

        self.entries[index].position = (ring, slot, position);
    }

    /// Remove an entry from its bucket in O(1), fixing up the entry moved into its place.
    fn unlink(&mut self, index: usize) {
        let (ring, slot, position) = self.entries[index].position;
        let bucket = &mut self.rings[ring][slot];

        bucket.swap_remove(position);

        if let Some(&moved) = bucket.get(position) {
            self.entries[moved].position = (ring, slot, position);
        }
    }
}

/// Split a tick count into one slot index per ring, finest first.
fn digits(ticks: u64) -> [usize; RINGS] {
    std::array::from_fn(|ring| ((ticks >> (RING_BITS * ring as u32)) & SLOT_MASK) as usize)
}
