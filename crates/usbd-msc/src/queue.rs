//! Bounded queue of parsed commands.
//!
//! The interrupt-side CBW parser produces command records, the main loop
//! consumes them. Records live in a fixed ring of pre-sized slots; there
//! is no allocation on the enqueue path, only slot acquisition, which
//! fails exactly when the queue is full.

use thiserror::Error;

use crate::scsi::cdb::Cdb;

/// Maximum number of commands pending execution.
pub const MAX_QUEUE_DEPTH: usize = 10;

/// A parsed command awaiting execution.
///
/// For the streaming commands, `rw_offset` and `rw_count` carry the
/// transfer window normalized to bytes with the block size that was
/// current at parse time.
#[derive(Debug, Clone, Copy)]
pub struct QueuedCommand {
    pub cdb: Cdb,
    /// Byte offset of the transfer on the medium.
    pub rw_offset: u64,
    /// Byte count of the transfer.
    pub rw_count: u64,
}

impl QueuedCommand {
    pub fn new(cdb: Cdb) -> Self {
        QueuedCommand {
            cdb,
            rw_offset: 0,
            rw_count: 0,
        }
    }
}

/// Enqueueing into a full queue. The transport treats this as a fatal
/// out-of-resource condition: phase error plus reset recovery.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("command queue is full ({MAX_QUEUE_DEPTH} entries)")]
pub struct QueueFull;

/// Fixed-capacity FIFO ring of command records.
#[derive(Debug)]
pub struct CommandQueue {
    slots: [Option<QueuedCommand>; MAX_QUEUE_DEPTH],
    head: usize,
    len: usize,
}

impl CommandQueue {
    pub const fn new() -> Self {
        CommandQueue {
            slots: [None; MAX_QUEUE_DEPTH],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn enqueue(&mut self, cmd: QueuedCommand) -> Result<(), QueueFull> {
        if self.len == MAX_QUEUE_DEPTH {
            return Err(QueueFull);
        }
        let tail = (self.head + self.len) % MAX_QUEUE_DEPTH;
        self.slots[tail] = Some(cmd);
        self.len += 1;
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<QueuedCommand> {
        if self.len == 0 {
            return None;
        }
        let cmd = self.slots[self.head].take();
        self.head = (self.head + 1) % MAX_QUEUE_DEPTH;
        self.len -= 1;
        cmd
    }

    /// Drop every pending record (reset recovery).
    pub fn clear(&mut self) {
        self.slots = [None; MAX_QUEUE_DEPTH];
        self.head = 0;
        self.len = 0;
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        CommandQueue::new()
    }
}
