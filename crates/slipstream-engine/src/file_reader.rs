//! Bulk file reading for the hasher
//!
//! A plain buffered read loop with a reusable chunk buffer. The callback
//! receives each chunk in order and may stop the read early by returning
//! false; the hasher uses that for shutdown and stop-hashing requests.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use slipstream_core::HASH_CHUNK_SIZE;

/// Chunked reader with a caller-tunable buffer size
pub struct FileReader {
    chunk_size: usize,
}

impl FileReader {
    pub fn new() -> Self {
        Self {
            chunk_size: HASH_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0);
        Self { chunk_size }
    }

    /// Stream a file through `callback` in chunks. Returns the number of
    /// bytes delivered; an early stop is not an error.
    pub fn read(
        &self,
        path: &Path,
        mut callback: impl FnMut(&[u8]) -> bool,
    ) -> io::Result<u64> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            total += n as u64;
            if !callback(&buf[..n]) {
                return Ok(total);
            }
        }
    }
}

impl Default for FileReader {
    fn default() -> Self {
        Self::new()
    }
}
