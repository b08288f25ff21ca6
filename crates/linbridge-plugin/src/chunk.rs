//! State chunk transfer region and the two-tier size policy.

use crate::error::{BridgeError, Result};
use crate::protocol::ChunkMode;
use crate::shared_memory::SharedRegion;

/// How a chunk of a given size travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTier {
    /// Fits the region in one go.
    Inline,
    /// Moved in region-sized segments.
    Segmented,
    /// Too large and segmented transfer is off; only the size is reported.
    Refused,
}

impl ChunkTier {
    pub fn for_size(size: usize, capacity: usize, mode: ChunkMode) -> Self {
        if size < capacity {
            ChunkTier::Inline
        } else {
            match mode {
                ChunkMode::Buffered => ChunkTier::Segmented,
                ChunkMode::Inline => ChunkTier::Refused,
            }
        }
    }
}

/// `(offset, len)` pairs covering `total` bytes in steps of at most `capacity`.
pub fn segments(total: usize, capacity: usize) -> impl Iterator<Item = (usize, usize)> {
    let step = capacity.max(1);
    (0..total)
        .step_by(step)
        .map(move |offset| (offset, step.min(total - offset)))
}

pub struct ChunkArea {
    region: SharedRegion,
}

impl ChunkArea {
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        Ok(Self {
            region: SharedRegion::create(name, capacity.max(1))?,
        })
    }

    pub fn open(name: &str, capacity: usize) -> Result<Self> {
        Ok(Self {
            region: SharedRegion::open(name, capacity.max(1))?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Caller must hold the control mailbox turn.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity() {
            return Err(BridgeError::PayloadTooLarge {
                what: "chunk segment",
                required: data.len(),
                capacity: self.capacity(),
            });
        }
        self.region.write_bytes(0, data)
    }

    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        if len > self.capacity() {
            return Err(BridgeError::PayloadTooLarge {
                what: "chunk segment",
                required: len,
                capacity: self.capacity(),
            });
        }
        let mut out = vec![0u8; len];
        self.region.read_bytes_into(0, &mut out)?;
        Ok(out)
    }
}

/// Server-side buffer for a chunk arriving in segments.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buffer: Vec<u8>,
    total: usize,
    received: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the segment at `offset` of a `total`-byte chunk. A segment at
    /// offset 0 starts a new chunk; segments must arrive in order.
    pub fn push(&mut self, offset: usize, total: usize, data: &[u8]) -> Result<()> {
        if offset == 0 {
            self.buffer.clear();
            self.buffer.reserve(total);
            self.total = total;
            self.received = 0;
        }
        if total != self.total || offset != self.received || offset + data.len() > total {
            return Err(BridgeError::ProtocolError(format!(
                "chunk segment {}..{} of {} does not follow {} of {}",
                offset,
                offset + data.len(),
                total,
                self.received,
                self.total
            )));
        }
        self.buffer.extend_from_slice(data);
        self.received += data.len();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.received == self.total
    }

    /// Hand over the finished chunk and reset.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        self.total = 0;
        self.received = 0;
        Some(std::mem::take(&mut self.buffer))
    }
}
