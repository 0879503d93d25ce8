//! The Chunk record produced by the MigrationEngine (C_ME) and consumed by
//! the ChunkPipeline (C_CP), plus the batch type chunks are grouped into
//! before being pushed onto a TaskQueue.

use std::io;

use crate::device::ChunkBuf;

/// Non-owning index into the engine's device list. Chunks reference their
/// device this way instead of holding a strong reference, so there is no
/// cycle between `MigrationEngine` and the chunks it produces.
pub type DeviceHandle = usize;

/// Maximum chunks per `TaskBody` before the pipeline pushes it.
pub const BATCH_LEN: usize = 64;
/// Below this many ready chunks, a mid-iteration flush is skipped to avoid
/// shipping undersized batches.
pub const BATCH_MIN_LEN: usize = BATCH_LEN / 2;
/// Backpressure threshold: sleep the producer rather than grow the queue
/// past this many outstanding `TaskBody`s.
pub const MAX_TASK_PENDING: usize = 512;

/// A single chunk-aligned read result.
pub struct Chunk {
    pub device: DeviceHandle,
    pub sector: u64,
    pub nr_sectors: u32,
    pub buffer: ChunkBuf,
    pub read_nanos: u64,
    pub read_status: io::Result<()>,
}

impl Chunk {
    /// Byte length of the valid (non-padding) payload.
    pub fn valid_len(&self) -> usize {
        self.nr_sectors as usize * crate::device::SECTOR_SIZE as usize
    }
}

/// A batch of chunks tagged with the iteration number they were produced
/// under, pushed as a unit onto a `TaskQueue`.
pub struct TaskBody {
    pub iter_num: u8,
    pub chunks: Vec<Chunk>,
}

impl TaskBody {
    pub fn new(iter_num: u8) -> Self {
        TaskBody {
            iter_num,
            chunks: Vec::with_capacity(BATCH_LEN),
        }
    }

    pub fn is_full(&self) -> bool {
        self.chunks.len() >= BATCH_LEN
    }

    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(Chunk::valid_len).sum()
    }
}
