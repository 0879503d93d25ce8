//! ChunkPipeline (C_CP): drains the engine's ready FIFO into `TaskBody`
//! batches and pushes them onto a bounded `TaskQueue`, or (legacy mode)
//! encodes chunks directly onto the `Stream`. Grounded on
//! `original_source/block-migration.c`'s `flush_blks`/`flush_blks_master`
//! and the `blk_mig_save_bulked_block_sync` batching/backpressure loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::chunk::{Chunk, TaskBody, BATCH_LEN, BATCH_MIN_LEN, MAX_TASK_PENDING};
use crate::error::{MigrationError, Result};
use crate::stream::Stream;
use crate::wire::Record;

/// A bounded queue of `TaskBody` batches, drained by a writer thread that
/// owns serialization onto the `Stream`. Backpressure is exposed through
/// `pending()`; the caller (the engine's synchronous bulk/dirty sweep) is
/// responsible for sleeping when it returns too high, mirroring the
/// original's 100 ms `nanosleep` loop.
pub trait TaskQueue: Send + Sync {
    fn push(&self, body: TaskBody) -> Result<()>;
    fn pending(&self) -> usize;
}

pub struct BoundedTaskQueue {
    tx: Sender<TaskBody>,
    rx: Receiver<TaskBody>,
}

impl BoundedTaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        BoundedTaskQueue { tx, rx }
    }

    pub fn receiver(&self) -> Receiver<TaskBody> {
        self.rx.clone()
    }
}

impl Default for BoundedTaskQueue {
    fn default() -> Self {
        Self::new(MAX_TASK_PENDING)
    }
}

impl TaskQueue for BoundedTaskQueue {
    fn push(&self, body: TaskBody) -> Result<()> {
        self.tx.send(body).map_err(|_| MigrationError::EnqueueTask)
    }

    fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Sleeps in the same 100 ms steps the original bulk/dirty sync paths used,
/// while the task queue is over `MAX_TASK_PENDING`.
pub fn wait_for_queue_headroom(queue: &dyn TaskQueue) {
    while queue.pending() > MAX_TASK_PENDING {
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Whether chunks are encoded straight onto the stream (`Legacy`, used by
/// stage 1's per-device negotiation/flush) or batched into `TaskBody`s for a
/// `TaskQueue`-driven writer thread (`Pipelined`, used by stage 2/3).
pub enum PipelineMode<'a> {
    Legacy { iter_num: u8 },
    Pipelined { queue: &'a dyn TaskQueue, iter_num: u8 },
}

/// Drains the ready FIFO non-blockingly while the stream's rate limiter
/// permits it. Returns the number of chunks consumed. `device_names` maps
/// each chunk's `DeviceHandle` to the name negotiated during stage 1 (the
/// wire format carries names, not handles).
pub fn flush_async(
    ready_rx: &Receiver<Chunk>,
    stream: &mut dyn Stream,
    mode: &mut PipelineMode,
    device_names: &[String],
    read_done: &AtomicU64,
    transferred: &AtomicU64,
    pending_body: &mut Option<TaskBody>,
) -> Result<usize> {
    let mut drained = 0usize;
    while stream.rate_limit_ok() {
        let chunk = match ready_rx.try_recv() {
            Ok(chunk) => chunk,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        };
        if let Err(e) = &chunk.read_status {
            stream.set_error();
            return Err(MigrationError::TransientRead {
                sector: chunk.sector,
                nr_sectors: chunk.nr_sectors,
                source: io_error_clone(e),
            });
        }
        read_done.fetch_sub(1, Ordering::SeqCst);
        transferred.fetch_add(1, Ordering::SeqCst);
        drained += 1;

        match mode {
            PipelineMode::Legacy { iter_num } => {
                let record = Record::Data {
                    device: device_names[chunk.device].clone(),
                    sector: chunk.sector,
                    iter_num: *iter_num,
                    payload: chunk.buffer,
                };
                record.encode(stream)?;
            }
            PipelineMode::Pipelined { queue, iter_num } => {
                let body = pending_body.get_or_insert_with(|| TaskBody::new(*iter_num));
                body.chunks.push(chunk);
                if body.is_full() {
                    let full = pending_body.take().unwrap();
                    queue.push(full)?;
                }
            }
        }
    }
    Ok(drained)
}

/// Pushes one batch of up to `BATCH_LEN` ready chunks as a single
/// `TaskBody`, unless the batch would be too small for a mid-iteration
/// flush (`last == false && read_done < BATCH_MIN_LEN`) or there is nothing
/// left to send on the final flush (`last == true && read_done == 0`).
/// Returns the number of bytes the pushed batch carries.
pub fn flush_pipeline(
    last: bool,
    ready_rx: &Receiver<Chunk>,
    queue: &dyn TaskQueue,
    read_done: &AtomicU64,
    iter_num: u8,
) -> Result<usize> {
    let available = read_done.load(Ordering::SeqCst) as usize;
    if last && available == 0 {
        return Ok(0);
    }
    if !last && available < BATCH_MIN_LEN {
        return Ok(0);
    }

    let take = available.min(BATCH_LEN);
    let mut body = TaskBody::new(iter_num);
    for _ in 0..take {
        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(chunk) => {
                read_done.fetch_sub(1, Ordering::SeqCst);
                body.chunks.push(chunk);
            }
            Err(_) => break,
        }
    }
    let bytes = body.byte_len();
    if !body.chunks.is_empty() {
        queue.push(body)?;
    }
    Ok(bytes)
}

fn io_error_clone(e: &std::io::Error) -> std::io::Error {
    std::io::Error::new(e.kind(), e.to_string())
}
