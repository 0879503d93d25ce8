//! MigrationEngine (C_ME): the bulk+dirty sweep state machine. Grounded on
//! `original_source/block-migration.c`'s `mig_save_device_bulk`,
//! `blk_mig_save_bulked_block_sync`, `mig_save_device_dirty`/`_sync`,
//! `get_remaining_dirty`/`is_stage2_completed`, `blk_mig_cleanup`, and the
//! `block_save_live` stage protocol. Unlike the original's process-wide
//! `BlkMigState` singleton, `MigrationEngine` is an explicit value owned by
//! its caller (SPEC_FULL.md §9).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use utils::time::{get_time, ClockType};

use crate::chunk::{Chunk, DeviceHandle, TaskBody, BATCH_LEN, MAX_TASK_PENDING};
use crate::device::{new_chunk_buf, BlockDevice, MAX_IS_ALLOCATED_SEARCH, SECTORS_PER_DIRTY_CHUNK, SECTOR_SIZE};
use crate::dirty_bitmap::DirtyBitmap;
use crate::error::{MigrationError, Result};
use crate::pipeline::{wait_for_queue_headroom, TaskQueue};
use crate::stream::Stream;
use crate::wire::{Record, MAX_DATA_ITER};

/// Latched migration configuration (SPEC_FULL.md §10's configuration
/// ambient-stack section). `shared_base` implies `blk_enable`, matching the
/// original's `block_set_params` `|=`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MigrationParams {
    pub blk_enable: bool,
    pub shared_base: bool,
}

impl MigrationParams {
    pub fn new() -> Self {
        MigrationParams::default()
    }

    pub fn with_blk_enable(mut self, enable: bool) -> Self {
        self.blk_enable = enable;
        self
    }

    pub fn with_shared_base(mut self, shared_base: bool) -> Self {
        self.shared_base = shared_base;
        if shared_base {
            self.blk_enable = true;
        }
        self
    }
}

/// Per-device state tracked by the engine. `aio_inflight` is `Arc`-wrapped
/// so a clone can be captured by an async read's completion closure, which
/// may run on a different thread than the one that submitted the read.
struct DevState<B: BlockDevice> {
    backing: Arc<B>,
    total_sectors: u64,
    cur_sector: u64,
    cur_dirty: u64,
    completed_sectors: u64,
    bulk_completed: bool,
    aio_inflight: Arc<DirtyBitmap>,
}

/// Counters and the ready-chunk channel shared between the engine thread
/// and asynchronous read completion contexts (SPEC_FULL.md §5).
struct EngineShared {
    submitted: AtomicI64,
    read_done: AtomicU64,
    transferred: AtomicU64,
    bandwidth: utils::Mutex<(u64, u64)>, // (reads_count, total_read_nanos)
    ready_tx: Sender<Chunk>,
    active: AtomicBool,
}

impl EngineShared {
    fn record_bandwidth(&self, elapsed_nanos: u64) {
        let mut guard = self.bandwidth.lock().unwrap();
        guard.0 += 1;
        guard.1 += elapsed_nanos;
    }
}

pub enum DirtySweepOutcome {
    /// One chunk was submitted (async mode); caller may call again.
    Submitted,
    /// This device has no more sectors to scan in the current pass.
    DeviceDone,
}

/// The bulk/dirty sweep state machine over a set of registered devices.
pub struct MigrationEngine<B: BlockDevice> {
    devices: Vec<DevState<B>>,
    shared: Arc<EngineShared>,
    ready_rx: Receiver<Chunk>,
    params: MigrationParams,
    iter_num: u8,
    bulk_cursor: usize,
}

impl<B: BlockDevice> MigrationEngine<B> {
    pub fn new(params: MigrationParams) -> Self {
        let (ready_tx, ready_rx) = bounded(MAX_TASK_PENDING * BATCH_LEN);
        MigrationEngine {
            devices: Vec::new(),
            shared: Arc::new(EngineShared {
                submitted: AtomicI64::new(0),
                read_done: AtomicU64::new(0),
                transferred: AtomicU64::new(0),
                bandwidth: utils::Mutex::new((0, 0)),
                ready_tx,
                active: AtomicBool::new(true),
            }),
            ready_rx,
            params,
            iter_num: 0,
            bulk_cursor: 0,
        }
    }

    pub fn set_params(&mut self, params: MigrationParams) {
        self.params = params;
    }

    pub fn ready_receiver(&self) -> Receiver<Chunk> {
        self.ready_rx.clone()
    }

    pub fn submitted(&self) -> i64 {
        self.shared.submitted.load(Ordering::SeqCst)
    }

    pub fn read_done(&self) -> u64 {
        self.shared.read_done.load(Ordering::SeqCst)
    }

    pub fn transferred(&self) -> u64 {
        self.shared.transferred.load(Ordering::SeqCst)
    }

    /// Stage 1: registers every device, writes its negotiation record, then
    /// a single EOS terminating the negotiation phase.
    pub fn init(&mut self, devices: Vec<Arc<B>>, stream: &mut dyn Stream) -> Result<()> {
        for backing in devices {
            backing.acquire();
            if self.params.blk_enable {
                backing.set_dirty_tracking(true);
            }
            let total_sectors = backing.length_sectors();
            let name = backing.name().to_string();
            tracing::info!(device = %name, total_sectors, "starting full migration for device");
            Record::Negotiate { device: name, total_sectors }.encode(stream)?;
            self.devices.push(DevState {
                backing,
                total_sectors,
                cur_sector: 0,
                cur_dirty: 0,
                completed_sectors: 0,
                bulk_completed: total_sectors == 0,
                aio_inflight: Arc::new(DirtyBitmap::new(total_sectors.max(1))),
            });
        }
        tracing::info!("block migration start");
        Record::Eos.encode(stream)?;
        Ok(())
    }

    pub fn bulk_completed_global(&self) -> bool {
        self.devices.iter().all(|d| d.bulk_completed)
    }

    fn advance_past_unallocated(&mut self, idx: usize) {
        loop {
            let dev = &self.devices[idx];
            if dev.cur_sector >= dev.total_sectors {
                return;
            }
            let (allocated, run) = dev.backing.is_allocated(dev.cur_sector, MAX_IS_ALLOCATED_SEARCH);
            if allocated {
                return;
            }
            self.devices[idx].cur_sector += run.max(1);
        }
    }

    /// Submits one async chunk read for `idx` at its current bulk cursor.
    /// Returns `true` if a read was submitted, `false` if the device's bulk
    /// sweep is already complete.
    pub fn bulk_step_async(&mut self, idx: usize) -> Result<bool> {
        if self.devices[idx].bulk_completed {
            return Ok(false);
        }
        if self.params.shared_base {
            self.advance_past_unallocated(idx);
        }
        let dev = &mut self.devices[idx];
        if dev.cur_sector >= dev.total_sectors {
            dev.completed_sectors = dev.total_sectors;
            dev.bulk_completed = true;
            return Ok(false);
        }
        let sector = dev.cur_sector - (dev.cur_sector % SECTORS_PER_DIRTY_CHUNK);
        let remaining = dev.total_sectors - sector;
        let nr_sectors = remaining.min(SECTORS_PER_DIRTY_CHUNK) as u32;
        dev.cur_sector = sector + nr_sectors as u64;
        self.submit_async_read(idx, sector, nr_sectors);
        Ok(true)
    }

    fn submit_async_read(&mut self, idx: usize, sector: u64, nr_sectors: u32) {
        let dev = &self.devices[idx];
        dev.aio_inflight.set_range(sector, nr_sectors, true);
        dev.backing.dirty_reset(sector, nr_sectors);

        let shared = self.shared.clone();
        let aio_inflight = dev.aio_inflight.clone();
        let start = get_time(ClockType::Monotonic);
        let buf = new_chunk_buf();

        self.shared.submitted.fetch_add(1, Ordering::SeqCst);
        dev.backing.read_async(
            sector,
            nr_sectors,
            buf,
            Box::new(move |buffer, status| {
                if !shared.active.load(Ordering::SeqCst) {
                    // cleanup() already ran; drop this completion on the floor.
                    return;
                }
                let elapsed = get_time(ClockType::Monotonic).saturating_sub(start);
                aio_inflight.set_range(sector, nr_sectors, false);
                shared.submitted.fetch_sub(1, Ordering::SeqCst);
                if status.is_ok() {
                    shared.record_bandwidth(elapsed);
                }
                shared.read_done.fetch_add(1, Ordering::SeqCst);
                let chunk = Chunk {
                    device: idx,
                    sector,
                    nr_sectors,
                    buffer,
                    read_nanos: elapsed,
                    read_status: status,
                };
                let _ = shared.ready_tx.send(chunk);
            }),
        );
    }

    /// Synchronous, pipelined bulk sweep: reads directly (no AIO) and
    /// batches into one `TaskBody` per call. Rejects `shared_base`, which
    /// only the async path supports (SPEC_FULL.md §4.3).
    pub fn bulk_sync(&mut self, task_queue: &dyn TaskQueue) -> Result<u64> {
        if self.params.shared_base {
            return Err(MigrationError::ConfigReject);
        }
        if self.devices.is_empty() {
            return Ok(0);
        }
        let mut body = TaskBody::new(self.iter_num);
        let mut scanned_without_progress = 0usize;

        while body.chunks.len() < BATCH_LEN && scanned_without_progress < self.devices.len() {
            let idx = self.bulk_cursor;
            self.bulk_cursor = (self.bulk_cursor + 1) % self.devices.len();

            if self.devices[idx].bulk_completed {
                scanned_without_progress += 1;
                continue;
            }
            scanned_without_progress = 0;

            let dev = &self.devices[idx];
            let sector = dev.cur_sector;
            let remaining = dev.total_sectors - sector;
            let nr_sectors = remaining.min(SECTORS_PER_DIRTY_CHUNK) as u32;

            let mut buf = new_chunk_buf();
            let valid = nr_sectors as usize * SECTOR_SIZE as usize;
            dev.backing
                .read_sync(sector, nr_sectors, &mut buf[..valid])
                .map_err(|e| MigrationError::TransientRead { sector, nr_sectors, source: e })?;
            dev.backing.dirty_reset(sector, nr_sectors);

            let dev = &mut self.devices[idx];
            dev.cur_sector = sector + nr_sectors as u64;
            if dev.cur_sector >= dev.total_sectors {
                dev.completed_sectors = dev.total_sectors;
                dev.bulk_completed = true;
            }

            body.chunks.push(Chunk {
                device: idx,
                sector,
                nr_sectors,
                buffer: buf,
                read_nanos: 0,
                read_status: Ok(()),
            });
        }

        if body.chunks.is_empty() {
            return Ok(0);
        }
        let bytes = body.byte_len() as u64;
        wait_for_queue_headroom(task_queue);
        task_queue.push(body)?;
        Ok(bytes)
    }

    fn drain_until_clear(&self, idx: usize, sector: u64) {
        while self.devices[idx].aio_inflight.test(sector) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn reset_dirty_cursor(&mut self) {
        for dev in &mut self.devices {
            dev.cur_dirty = 0;
        }
    }

    /// Synchronous, pipelined dirty sweep of one device from its current
    /// cursor to the end, batching into `TaskBody`s of up to `BATCH_LEN`.
    pub fn sweep_dirty_sync(&mut self, idx: usize, task_queue: &dyn TaskQueue) -> Result<u64> {
        let mut bytes = 0u64;
        let mut body = TaskBody::new(self.iter_num);

        loop {
            let total_sectors = self.devices[idx].total_sectors;
            let cur = self.devices[idx].cur_dirty;
            if cur >= total_sectors {
                break;
            }
            let sector = cur - (cur % SECTORS_PER_DIRTY_CHUNK);

            if self.devices[idx].aio_inflight.test(sector) {
                self.drain_until_clear(idx, sector);
            }
            if !self.devices[idx].backing.dirty_get(sector) {
                self.devices[idx].cur_dirty = sector + SECTORS_PER_DIRTY_CHUNK;
                continue;
            }

            let dev = &self.devices[idx];
            let remaining = total_sectors - sector;
            let nr_sectors = remaining.min(SECTORS_PER_DIRTY_CHUNK) as u32;
            let mut buf = new_chunk_buf();
            let valid = nr_sectors as usize * SECTOR_SIZE as usize;
            dev.backing
                .read_sync(sector, nr_sectors, &mut buf[..valid])
                .map_err(|e| MigrationError::TransientRead { sector, nr_sectors, source: e })?;
            dev.backing.dirty_reset(sector, nr_sectors);
            self.devices[idx].cur_dirty = sector + nr_sectors as u64;
            bytes += nr_sectors as u64 * SECTOR_SIZE;

            body.chunks.push(Chunk {
                device: idx,
                sector,
                nr_sectors,
                buffer: buf,
                read_nanos: 0,
                read_status: Ok(()),
            });
            if body.is_full() {
                wait_for_queue_headroom(task_queue);
                let full = std::mem::replace(&mut body, TaskBody::new(self.iter_num));
                task_queue.push(full)?;
            }
        }

        if !body.chunks.is_empty() {
            wait_for_queue_headroom(task_queue);
            task_queue.push(body)?;
        }
        Ok(bytes)
    }

    /// Advances one iteration of stage 2/3 as described in SPEC_FULL.md
    /// §4.3: bulk sweep until complete, then repeated dirty sweeps. Stage 3
    /// additionally asserts no async reads are outstanding. Per SPEC_FULL.md
    /// §7, a stream already in error short-circuits before any sweep runs.
    pub fn iterate(&mut self, stage: u8, task_queue: &dyn TaskQueue, stream: &dyn Stream) -> Result<u64> {
        if stream.has_error() {
            return Err(MigrationError::StreamError);
        }
        if stage == 3 {
            assert_eq!(
                self.shared.submitted.load(Ordering::SeqCst),
                0,
                "stage 3 requires no asynchronous reads outstanding"
            );
        }
        if !self.bulk_completed_global() {
            return self.bulk_sync(task_queue);
        }

        // Bulk is done; every chunk from here on is a dirty-sweep chunk and
        // must carry a distinct iter_num from the bulk sweep's, so bump
        // before the first dirty sweep rather than after it.
        self.advance_iteration();
        self.reset_dirty_cursor();
        let mut bytes = 0u64;
        for idx in 0..self.devices.len() {
            bytes += self.sweep_dirty_sync(idx, task_queue)?;
        }
        Ok(bytes)
    }

    /// Bumps the on-wire iteration tag, saturating at `MAX_DATA_ITER` so a
    /// data record's `iter_num` can never collide with `DISK_NEGOTIATE`
    /// (SPEC_FULL.md §9).
    pub fn advance_iteration(&mut self) {
        if self.iter_num >= MAX_DATA_ITER {
            tracing::warn!(
                iter_num = self.iter_num,
                "iteration counter saturated; destination version ordering may degrade for the remainder of this migration"
            );
            return;
        }
        self.iter_num += 1;
    }

    pub fn iter_num(&self) -> u8 {
        self.iter_num
    }

    /// Convergence check (SPEC_FULL.md §4.3): true once bulk is done and
    /// either there's nothing left dirty, or the remaining dirty footprint
    /// can be flushed within `max_downtime_ns` at the observed bandwidth.
    pub fn should_finish(&self, max_downtime_ns: u64) -> bool {
        if !self.bulk_completed_global() {
            return false;
        }
        let remaining_dirty_bytes: u64 = self
            .devices
            .iter()
            .map(|d| d.backing.dirty_count() * crate::device::BLOCK_SIZE as u64)
            .sum();
        if remaining_dirty_bytes == 0 {
            return true;
        }
        let (reads_count, total_read_nanos) = *self.shared.bandwidth.lock().unwrap();
        if total_read_nanos == 0 || reads_count == 0 {
            return false;
        }
        let bandwidth_bytes_per_ns =
            (reads_count * crate::device::BLOCK_SIZE as u64) as f64 / total_read_nanos as f64;
        let eta_ns = remaining_dirty_bytes as f64 / bandwidth_bytes_per_ns;
        eta_ns <= max_downtime_ns as f64
    }

    /// Disables dirty tracking, releases every device, drains the ready
    /// FIFO, and marks the engine inactive so any in-flight completion
    /// callbacks that fire afterward become no-ops.
    pub fn cleanup(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        for dev in &self.devices {
            dev.backing.set_dirty_tracking(false);
            dev.backing.release();
        }
        while self.ready_rx.try_recv().is_ok() {}
        tracing::info!("block migration completed");
    }

    pub fn device_name(&self, handle: DeviceHandle) -> &str {
        self.devices[handle].backing.name()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBlockDevice;
    use crate::pipeline::BoundedTaskQueue;
    use std::io::Write;

    fn make_device(name: &str, sectors: u64) -> (tempfile::NamedTempFile, Arc<FileBlockDevice>) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize]).unwrap();
        f.flush().unwrap();
        let dev = Arc::new(FileBlockDevice::open(name, f.path()).unwrap());
        (f, dev)
    }

    #[test]
    fn bulk_sync_ships_every_sector_exactly_once() {
        let (_f, dev) = make_device("sda", SECTORS_PER_DIRTY_CHUNK * 3);
        let mut engine: MigrationEngine<FileBlockDevice> =
            MigrationEngine::new(MigrationParams::new().with_blk_enable(true));
        let mut stream = crate::stream::MemoryStream::new();
        engine.init(vec![dev], &mut stream).unwrap();

        let queue = BoundedTaskQueue::new(16);
        let mut total_chunks = 0usize;
        while !engine.bulk_completed_global() {
            engine.bulk_sync(&queue).unwrap();
            while let Ok(body) = queue.receiver().try_recv() {
                total_chunks += body.chunks.len();
            }
        }
        assert_eq!(total_chunks, 3);
    }

    #[test]
    fn should_finish_true_when_bulk_done_and_nothing_dirty() {
        let (_f, dev) = make_device("sda", SECTORS_PER_DIRTY_CHUNK);
        let mut engine: MigrationEngine<FileBlockDevice> =
            MigrationEngine::new(MigrationParams::new().with_blk_enable(true));
        let mut stream = crate::stream::MemoryStream::new();
        engine.init(vec![dev], &mut stream).unwrap();
        let queue = BoundedTaskQueue::new(16);
        while !engine.bulk_completed_global() {
            engine.bulk_sync(&queue).unwrap();
        }
        assert!(engine.should_finish(10_000_000));
    }

    #[test]
    fn shared_base_rejected_on_sync_bulk_path() {
        let (_f, dev) = make_device("sda", SECTORS_PER_DIRTY_CHUNK);
        let mut engine: MigrationEngine<FileBlockDevice> =
            MigrationEngine::new(MigrationParams::new().with_shared_base(true));
        let mut stream = crate::stream::MemoryStream::new();
        engine.init(vec![dev], &mut stream).unwrap();
        let queue = BoundedTaskQueue::new(16);
        assert!(matches!(engine.bulk_sync(&queue), Err(MigrationError::ConfigReject)));
    }

    #[test]
    fn dirty_sweep_ships_only_redirtied_chunks() {
        let (_f, dev) = make_device("sda", SECTORS_PER_DIRTY_CHUNK * 2);
        let mut engine: MigrationEngine<FileBlockDevice> =
            MigrationEngine::new(MigrationParams::new().with_blk_enable(true));
        let mut stream = crate::stream::MemoryStream::new();
        engine.init(vec![dev.clone()], &mut stream).unwrap();
        let queue = BoundedTaskQueue::new(16);
        while !engine.bulk_completed_global() {
            engine.bulk_sync(&queue).unwrap();
        }
        while queue.receiver().try_recv().is_ok() {}

        dev.write_sync(0, 1, &[9u8; SECTOR_SIZE as usize]).unwrap();
        engine.reset_dirty_cursor();
        engine.sweep_dirty_sync(0, &queue).unwrap();

        let mut shipped = 0;
        while let Ok(body) = queue.receiver().try_recv() {
            shipped += body.chunks.len();
        }
        assert_eq!(shipped, 1);
    }
}
