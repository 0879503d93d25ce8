//! DirtyBitmap of in-flight AIO (C_DB): tracks which chunks have an
//! asynchronous read outstanding, distinct from the driver's own dirty bits.
//! One bit per chunk, granularity `SECTORS_PER_DIRTY_CHUNK`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::SECTORS_PER_DIRTY_CHUNK;

const WORD_BITS: u64 = 64;

pub struct DirtyBitmap {
    words: Vec<AtomicU64>,
}

impl DirtyBitmap {
    pub fn new(total_sectors: u64) -> Self {
        let chunks = total_sectors.div_ceil(SECTORS_PER_DIRTY_CHUNK).max(1);
        let words = chunks.div_ceil(WORD_BITS) as usize;
        DirtyBitmap {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn chunk_index(sector: u64) -> u64 {
        sector / SECTORS_PER_DIRTY_CHUNK
    }

    /// Sets or clears the in-flight bit for every chunk touched by
    /// `[sector, sector + nr_sectors)`.
    pub fn set_range(&self, sector: u64, nr_sectors: u32, value: bool) {
        let first = Self::chunk_index(sector);
        let last = Self::chunk_index(sector + nr_sectors.max(1) as u64 - 1);
        for chunk in first..=last {
            let word = (chunk / WORD_BITS) as usize;
            let bit = chunk % WORD_BITS;
            if word >= self.words.len() {
                continue;
            }
            if value {
                self.words[word].fetch_or(1 << bit, Ordering::SeqCst);
            } else {
                self.words[word].fetch_and(!(1 << bit), Ordering::SeqCst);
            }
        }
    }

    /// True if the chunk containing `sector` has an async read outstanding.
    pub fn test(&self, sector: u64) -> bool {
        let chunk = Self::chunk_index(sector);
        let word = (chunk / WORD_BITS) as usize;
        let bit = chunk % WORD_BITS;
        match self.words.get(word) {
            Some(w) => w.load(Ordering::SeqCst) & (1 << bit) != 0,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_single_chunk() {
        let bm = DirtyBitmap::new(SECTORS_PER_DIRTY_CHUNK * 4);
        assert!(!bm.test(0));
        bm.set_range(0, SECTORS_PER_DIRTY_CHUNK as u32, true);
        assert!(bm.test(0));
        assert!(!bm.test(SECTORS_PER_DIRTY_CHUNK));
        bm.set_range(0, SECTORS_PER_DIRTY_CHUNK as u32, false);
        assert!(!bm.test(0));
    }

    #[test]
    fn straddling_range_marks_every_touched_chunk() {
        let bm = DirtyBitmap::new(SECTORS_PER_DIRTY_CHUNK * 130);
        // A range crossing a 64-chunk word boundary must flip both words.
        bm.set_range(63 * SECTORS_PER_DIRTY_CHUNK, (2 * SECTORS_PER_DIRTY_CHUNK) as u32, true);
        assert!(bm.test(63 * SECTORS_PER_DIRTY_CHUNK));
        assert!(bm.test(64 * SECTORS_PER_DIRTY_CHUNK));
    }
}
