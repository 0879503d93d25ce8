//! The Stream interface (SPEC_FULL.md §1/§6): the fallible, rate-limited
//! transport the engine and pipeline send on. The outer migration
//! controller owns the real transport; this crate only needs the contract,
//! plus an in-memory implementation for tests.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// Abstraction over the migration transport. Implementations decide their
/// own rate-limiting policy; the engine only asks whether it may continue.
pub trait Stream: Send {
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()>;
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Returns `true` if the caller may keep sending without exceeding the
    /// transport's rate budget.
    fn rate_limit_ok(&self) -> bool {
        true
    }

    fn set_error(&mut self);
    fn has_error(&self) -> bool;
}

/// A plain in-memory `Stream` backed by a growable byte buffer, used by
/// unit and integration tests in place of a real migration transport.
pub struct MemoryStream {
    buf: Vec<u8>,
    pos: usize,
    error: AtomicBool,
}

impl MemoryStream {
    pub fn new() -> Self {
        MemoryStream {
            buf: Vec::new(),
            pos: 0,
            error: AtomicBool::new(false),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for MemoryStream {
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buf.write_all(buf)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let n = (&self.buf[self.pos..]).read(buf)?;
        if n != buf.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        self.pos += n;
        Ok(())
    }

    fn set_error(&mut self) {
        self.error.store(true, Ordering::SeqCst);
    }

    fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }
}
