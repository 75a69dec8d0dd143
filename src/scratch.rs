//! A fixed-capacity read buffer shared by the pack parser and the archive
//! scanner.
//!
//! Both consumers walk a byte stream object by object, peeking at small
//! headers and handing longer stretches to a zlib inflater. The scratch
//! keeps a `(start, end)` window over a 64 KiB buffer; whenever fewer than
//! [`MIN_BUFFERED`] bytes remain before an object header is read, the
//! window is compacted to the front and refilled, so header and varint
//! decoding never has to straddle a refill.

use anyhow::{Context, Result};
use std::io;
use std::io::prelude::*;

/// Capacity of the scratch buffer.
pub const SCRATCH_LEN: usize = 64 * 1024;

/// Minimum number of buffered bytes guaranteed (except at EOF) whenever an
/// object header is about to be decoded.
pub const MIN_BUFFERED: usize = 256;

pub struct Scratch<R> {
    src: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    /// Total bytes pulled from `src` so far.
    rbytes: u64,
}

impl<R: Read> Scratch<R> {
    pub fn new(src: R) -> Self {
        Scratch {
            src,
            buf: vec![0; SCRATCH_LEN],
            start: 0,
            end: 0,
            rbytes: 0,
        }
    }

    /// The bytes currently buffered and not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Mark `n` buffered bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.end - self.start);
        self.start += n;
    }

    /// Absolute position of the next unconsumed byte within the stream.
    pub fn offset(&self) -> u64 {
        self.rbytes - (self.end - self.start) as u64
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Read once from the source into the free tail of the buffer,
    /// compacting first. Returns the number of bytes read; 0 means EOF
    /// (or a full buffer, which callers refilling mid-object never hit).
    pub fn fill(&mut self) -> Result<usize> {
        self.compact();
        loop {
            match self.src.read(&mut self.buf[self.end..]) {
                Ok(n) => {
                    self.end += n;
                    self.rbytes += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("reading into scratch buffer"),
            }
        }
    }

    /// Make at least `n` bytes available, refilling as needed. Returns
    /// false if the stream ends first; the short remainder stays buffered.
    pub fn ensure(&mut self, n: usize) -> Result<bool> {
        debug_assert!(n <= SCRATCH_LEN);
        while self.end - self.start < n {
            if self.fill()? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Restore the header invariant: at least [`MIN_BUFFERED`] bytes
    /// buffered, or the stream is at EOF.
    pub fn top_up(&mut self) -> Result<()> {
        self.ensure(MIN_BUFFERED).map(|_| ())
    }
}
