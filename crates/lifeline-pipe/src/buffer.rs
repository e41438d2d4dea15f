use std::collections::VecDeque;

use crate::{PipeError, Result};

/// Bounded log of the most recently written bytes, addressed by absolute
/// sequence number.
///
/// The window never grows past `capacity`; the oldest bytes are dropped
/// first. Sequence numbers keep counting from the first byte ever pushed.
#[derive(Debug)]
pub struct RetainedBuffer {
    capacity: usize,
    /// Sequence number one past the last byte pushed.
    end_seq: u64,
    bytes: VecDeque<u8>,
}

impl RetainedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            end_seq: 0,
            bytes: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of bytes ever pushed.
    pub fn write_seq(&self) -> u64 {
        self.end_seq
    }

    /// Sequence number of the oldest byte still retained.
    pub fn oldest_seq(&self) -> u64 {
        self.end_seq - self.bytes.len() as u64
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.end_seq = self.end_seq.saturating_add(data.len() as u64);

        // Only the tail of an oversized write can survive anyway.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        self.bytes.extend(data.iter().copied());

        let excess = self.bytes.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.bytes.drain(..excess);
        }
    }

    /// Bytes from `seq` up to the end of the log.
    pub fn replay_from(&self, seq: u64) -> Result<Vec<u8>> {
        if seq > self.end_seq {
            return Err(PipeError::InvalidSequence {
                peer: seq,
                written: self.end_seq,
            });
        }
        let oldest = self.oldest_seq();
        if seq < oldest {
            return Err(PipeError::ReplayUnavailable {
                requested: seq,
                oldest,
            });
        }

        let skip = (seq - oldest) as usize;
        Ok(self.bytes.iter().skip(skip).copied().collect())
    }
}
