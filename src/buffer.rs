//! In-memory queue of small chunks waiting for the delivery timer.
//!
//! Large chunks read back from the chunk store are split into small chunks
//! here; the delivery loop pulls exactly one small chunk (or silence) per tick.

use bytes::Bytes;
use std::collections::VecDeque;

/// What the delivery loop should write on a tick.
#[derive(Debug, PartialEq)]
pub enum Pull {
    Audio(Bytes),

    /// Nothing to play right now (paused or starved)
    Silence,
}

#[derive(Default)]
pub struct DeliveryBuffer {
    chunks: VecDeque<Bytes>,
    small_chunk_bytes: usize,
    paused: bool,
    /// Small chunks handed out since creation, for progress tracking
    consumed: u64,
    silence: Bytes,
}

impl DeliveryBuffer {
    pub fn new(small_chunk_bytes: usize) -> Self {
        Self {
            small_chunk_bytes,
            silence: Bytes::from(vec![0; small_chunk_bytes]),
            ..Default::default()
        }
    }

    /// Splits a large chunk into small chunks. The last piece may be shorter.
    pub fn push_large(&mut self, mut data: Bytes) {
        while !data.is_empty() {
            let len = self.small_chunk_bytes.min(data.len());
            self.chunks.push_back(data.split_to(len));
        }
    }

    /// Takes the next small chunk, or silence while paused or starved.
    pub fn pull(&mut self) -> Pull {
        if self.paused {
            return Pull::Silence;
        }

        match self.chunks.pop_front() {
            Some(chunk) => {
                self.consumed += 1;
                Pull::Audio(chunk)
            }
            None => Pull::Silence,
        }
    }

    /// A buffer of zeroes the size of one small chunk.
    pub fn silence(&self) -> Bytes {
        self.silence.clone()
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Small chunks waiting to be delivered
    pub fn queued(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }
}
