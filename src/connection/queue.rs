//! Bounded transmit queue feeding the transmit worker.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use flume::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::frame::Package;
use crate::managers::ResponseConsumer;
use crate::messages::MessageKind;
use crate::{Error, Result};

use super::DISCARD_LOG_MASK;

#[derive(Clone)]
/// Reply a request waits for, and who gets it.
pub struct ReplyMatch {
    pub kind: MessageKind,
    pub seq: u32,
    pub consumer: Arc<dyn ResponseConsumer>,
}

impl Debug for ReplyMatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyMatch")
            .field("kind", &self.kind)
            .field("seq", &self.seq)
            .finish()
    }
}

#[derive(Debug)]
/// A package waiting to be written.
pub struct PendingPackage {
    pub package: Package,
    /// None for fire-and-forget packages.
    pub reply: Option<ReplyMatch>,
    pub submitted: Instant,
}

impl PendingPackage {
    pub fn new(package: Package, reply: Option<ReplyMatch>) -> Self {
        Self {
            package,
            reply,
            submitted: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct TxQueue {
    sender: Sender<PendingPackage>,
    receiver: Receiver<PendingPackage>,
    discarded: AtomicU64,
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity);

        Self {
            sender,
            receiver,
            discarded: AtomicU64::new(0),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(usize::MAX)
    }

    /// Packages dropped because the queue was full.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Receiving end, for the transmit worker.
    pub fn receiver(&self) -> &Receiver<PendingPackage> {
        &self.receiver
    }

    // === Public Methods ===

    /// Enqueue without blocking, dropping the package if the queue is full.
    pub fn push(&self, pending: PendingPackage) -> Result<()> {
        match self.sender.try_send(pending) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let discarded = self.discarded.fetch_add(1, Ordering::Relaxed) + 1;

                if discarded & DISCARD_LOG_MASK == 1 {
                    debug!(discarded, "Transmit queue full, package discarded");
                }

                Err(Error::Resource("transmit queue full"))
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::Internal("transmit queue closed")),
        }
    }

    /// Remove every queued package, for cleanup.
    pub fn drain(&self) -> Vec<PendingPackage> {
        self.receiver.drain().collect()
    }
}
