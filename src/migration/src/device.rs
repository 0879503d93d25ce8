//! The BlockDevice adapter (C_BD): the contract this crate needs from the
//! hypervisor's block layer, plus a file-backed reference implementation
//! used by the tests and by anyone wiring the crate up without a real VMM.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use nix::sys::uio::{pread, pwrite};
use utils::time::{get_time, ClockType};

/// Reads `buf.len()` bytes from `file` at `offset`, looping over short reads
/// the way a real pread(2)-backed block layer must.
fn pread_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = pread(file, &mut buf[filled..], (offset + filled as u64) as i64)
            .map_err(io::Error::from)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        filled += n;
    }
    Ok(())
}

/// Writes all of `buf` to `file` at `offset`, looping over short writes.
fn pwrite_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        let n = pwrite(file, &buf[written..], (offset + written as u64) as i64)
            .map_err(io::Error::from)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
        }
        written += n;
    }
    Ok(())
}

/// Bytes per sector. Matches the hypervisor block layer's native sector size.
pub const SECTOR_SIZE: u64 = 512;
/// `log2(SECTOR_SIZE)`, used to pack sector numbers into the wire header.
pub const SECTOR_SHIFT: u32 = 9;

/// Sectors per migration chunk. One dirty chunk is the unit of AIO
/// submission, dirty-bit reset, and wire record.
pub const SECTORS_PER_DIRTY_CHUNK: u64 = 2048;
/// Bytes per migration chunk (1 MiB at the constants above).
pub const BLOCK_SIZE: usize = (SECTORS_PER_DIRTY_CHUNK * SECTOR_SIZE) as usize;

/// Upper bound on how many sectors a single `is_allocated` probe may skip
/// over in one call, so a sparse shared-base image can't stall the bulk
/// sweep on one giant unallocated run.
pub const MAX_IS_ALLOCATED_SEARCH: u64 = 65536;

/// A chunk-sized buffer, always allocated at full `BLOCK_SIZE` even when the
/// valid payload (driven by `nr_sectors`) is shorter.
pub type ChunkBuf = Box<[u8; BLOCK_SIZE]>;

pub fn new_chunk_buf() -> ChunkBuf {
    Box::new([0u8; BLOCK_SIZE])
}

/// The contract the migration core needs from a writable virtual disk.
///
/// Implementations must guarantee that `dirty_reset` followed by a later
/// write to the same sector causes a subsequent `dirty_get` to observe dirty
/// again (SPEC_FULL.md §4.1).
pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;

    fn length_sectors(&self) -> u64;

    fn read_sync(&self, sector: u64, nr_sectors: u32, out: &mut [u8]) -> io::Result<()>;

    /// Submits an asynchronous read. `on_complete` fires exactly once, from
    /// an I/O-completion context that may not be the calling thread, with
    /// the buffer handed back and the read's outcome.
    fn read_async(
        &self,
        sector: u64,
        nr_sectors: u32,
        buf: ChunkBuf,
        on_complete: Box<dyn FnOnce(ChunkBuf, io::Result<()>) + Send>,
    );

    fn write_sync(&self, sector: u64, nr_sectors: u32, buf: &[u8]) -> io::Result<()>;

    fn dirty_get(&self, sector: u64) -> bool;

    fn dirty_reset(&self, sector: u64, nr_sectors: u32);

    fn dirty_count(&self) -> u64;

    fn set_dirty_tracking(&self, enabled: bool);

    /// Returns `(allocated, run_sectors)`: whether `sector` is allocated,
    /// and how many consecutive sectors share that same allocation state
    /// (bounded by `MAX_IS_ALLOCATED_SEARCH`).
    fn is_allocated(&self, sector: u64, max_search: u64) -> (bool, u64);

    fn acquire(&self);

    fn release(&self);
}

fn chunk_index(sector: u64) -> u64 {
    sector / SECTORS_PER_DIRTY_CHUNK
}

/// A small fixed worker pool standing in for the hypervisor's AIO
/// completion contexts. Reads submitted to it run on one of `WORKERS`
/// threads and invoke the completion callback from that thread.
const WORKERS: usize = 4;

struct AsyncReadJob {
    file: File,
    sector: u64,
    nr_sectors: u32,
    buf: ChunkBuf,
    on_complete: Box<dyn FnOnce(ChunkBuf, io::Result<()>) + Send>,
}

struct ReadPool {
    tx: Sender<AsyncReadJob>,
}

impl ReadPool {
    fn new() -> Self {
        let (tx, rx): (Sender<AsyncReadJob>, Receiver<AsyncReadJob>) = bounded(256);
        for _ in 0..WORKERS {
            let rx = rx.clone();
            std::thread::spawn(move || {
                for job in rx {
                    let AsyncReadJob {
                        file,
                        sector,
                        nr_sectors,
                        mut buf,
                        on_complete,
                    } = job;
                    let valid = nr_sectors as usize * SECTOR_SIZE as usize;
                    let result = pread_exact_at(&file, &mut buf[..valid], sector * SECTOR_SIZE);
                    on_complete(buf, result);
                }
            });
        }
        ReadPool { tx }
    }

    fn submit(&self, job: AsyncReadJob) {
        // A full queue blocks the submitting thread; the pool is sized to
        // stay ahead of any single migration engine's submission rate.
        let _ = self.tx.send(job);
    }
}

/// Chunk-granularity dirty bitmap standing in for the hypervisor's
/// dirty-tracking facility: `write_sync` marks the written range dirty,
/// `dirty_reset` clears it.
struct GuestDirtyTracker {
    words: Vec<AtomicU64>,
    enabled: AtomicBool,
}

const WORD_BITS: u64 = 64;

impl GuestDirtyTracker {
    fn new(total_sectors: u64) -> Self {
        let chunks = total_sectors.div_ceil(SECTORS_PER_DIRTY_CHUNK).max(1);
        let words = chunks.div_ceil(WORD_BITS) as usize;
        GuestDirtyTracker {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            enabled: AtomicBool::new(false),
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn mark_range(&self, sector: u64, nr_sectors: u32) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let first = chunk_index(sector);
        let last = chunk_index(sector + nr_sectors.max(1) as u64 - 1);
        for chunk in first..=last {
            let word = (chunk / WORD_BITS) as usize;
            let bit = chunk % WORD_BITS;
            self.words[word].fetch_or(1 << bit, Ordering::SeqCst);
        }
    }

    fn clear_range(&self, sector: u64, nr_sectors: u32) {
        let first = chunk_index(sector);
        let last = chunk_index(sector + nr_sectors.max(1) as u64 - 1);
        for chunk in first..=last {
            let word = (chunk / WORD_BITS) as usize;
            let bit = chunk % WORD_BITS;
            self.words[word].fetch_and(!(1 << bit), Ordering::SeqCst);
        }
    }

    fn get(&self, sector: u64) -> bool {
        let chunk = chunk_index(sector);
        let word = (chunk / WORD_BITS) as usize;
        let bit = chunk % WORD_BITS;
        self.words[word].load(Ordering::SeqCst) & (1 << bit) != 0
    }

    fn count(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::SeqCst).count_ones() as u64)
            .sum()
    }
}

/// Reference `BlockDevice` over a plain host file. Synchronous I/O uses
/// positioned reads/writes so callers don't need to share a cursor;
/// asynchronous reads are dispatched onto [`ReadPool`].
pub struct FileBlockDevice {
    name: String,
    file: File,
    length_sectors: u64,
    dirty: GuestDirtyTracker,
    pool: ReadPool,
    refcount: Mutex<u32>,
}

impl FileBlockDevice {
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let length_sectors = len / SECTOR_SIZE;
        Ok(FileBlockDevice {
            name: name.into(),
            file,
            length_sectors,
            dirty: GuestDirtyTracker::new(length_sectors),
            pool: ReadPool::new(),
            refcount: Mutex::new(0),
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn length_sectors(&self) -> u64 {
        self.length_sectors
    }

    fn read_sync(&self, sector: u64, nr_sectors: u32, out: &mut [u8]) -> io::Result<()> {
        let valid = nr_sectors as usize * SECTOR_SIZE as usize;
        pread_exact_at(&self.file, &mut out[..valid], sector * SECTOR_SIZE)
    }

    fn read_async(
        &self,
        sector: u64,
        nr_sectors: u32,
        buf: ChunkBuf,
        on_complete: Box<dyn FnOnce(ChunkBuf, io::Result<()>) + Send>,
    ) {
        let file = match self.file.try_clone() {
            Ok(f) => f,
            Err(e) => {
                on_complete(buf, Err(e));
                return;
            }
        };
        let _start = get_time(ClockType::Monotonic);
        self.pool.submit(AsyncReadJob {
            file,
            sector,
            nr_sectors,
            buf,
            on_complete,
        });
    }

    fn write_sync(&self, sector: u64, nr_sectors: u32, buf: &[u8]) -> io::Result<()> {
        let valid = nr_sectors as usize * SECTOR_SIZE as usize;
        pwrite_all_at(&self.file, &buf[..valid], sector * SECTOR_SIZE)?;
        self.dirty.mark_range(sector, nr_sectors);
        Ok(())
    }

    fn dirty_get(&self, sector: u64) -> bool {
        self.dirty.get(sector)
    }

    fn dirty_reset(&self, sector: u64, nr_sectors: u32) {
        self.dirty.clear_range(sector, nr_sectors);
    }

    fn dirty_count(&self) -> u64 {
        self.dirty.count()
    }

    fn set_dirty_tracking(&self, enabled: bool) {
        self.dirty.set_enabled(enabled);
    }

    fn is_allocated(&self, sector: u64, max_search: u64) -> (bool, u64) {
        // The reference file backend treats every sector as allocated; a
        // sparse-image backend would probe holes here. Clamp the run to the
        // caller's search bound and the device's remaining length.
        let remaining = self.length_sectors.saturating_sub(sector);
        (true, remaining.min(max_search).max(1))
    }

    fn acquire(&self) {
        *self.refcount.lock().unwrap() += 1;
    }

    fn release(&self) {
        let mut count = self.refcount.lock().unwrap();
        *count = count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_device(sectors: u64) -> (tempfile::NamedTempFile, FileBlockDevice) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize]).unwrap();
        f.flush().unwrap();
        let dev = FileBlockDevice::open("sda", f.path()).unwrap();
        (f, dev)
    }

    #[test]
    fn dirty_round_trips_through_write_and_reset() {
        let (_f, dev) = make_device(SECTORS_PER_DIRTY_CHUNK * 2);
        dev.set_dirty_tracking(true);
        assert!(!dev.dirty_get(0));
        dev.write_sync(0, 1, &[1u8; SECTOR_SIZE as usize]).unwrap();
        assert!(dev.dirty_get(0));
        dev.dirty_reset(0, SECTORS_PER_DIRTY_CHUNK as u32);
        assert!(!dev.dirty_get(0));
    }

    #[test]
    fn async_read_delivers_bytes_on_completion_thread() {
        let (_f, dev) = make_device(SECTORS_PER_DIRTY_CHUNK);
        dev.write_sync(0, 1, &[7u8; SECTOR_SIZE as usize]).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        dev.read_async(
            0,
            1,
            new_chunk_buf(),
            Box::new(move |buf, result| {
                tx.send((buf, result.is_ok())).unwrap();
            }),
        );
        let (buf, ok) = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(ok);
        assert_eq!(buf[0], 7);
    }
}
