//! Zlib inflation shared by the pack reader and indexer.
//!
//! Inflater state is pooled: a lease hands out a reset `flate2::Decompress`
//! and returns it to the pool on drop, so a request never reallocates zlib
//! state per object.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use flate2::{Decompress, FlushDecompress, Status};

use crate::PackError;

/// Pool of reusable inflaters.
#[derive(Default)]
pub struct InflatePool {
    free: Mutex<Vec<Decompress>>,
}

impl InflatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease an inflater. The state is reset and ready for a zlib stream.
    pub fn lease(&self) -> InflateLease<'_> {
        let z = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Decompress::new(true));
        InflateLease {
            pool: self,
            z: Some(z),
        }
    }
}

/// A scoped inflater lease. Returned to the pool on drop.
pub struct InflateLease<'a> {
    pool: &'a InflatePool,
    z: Option<Decompress>,
}

impl Deref for InflateLease<'_> {
    type Target = Decompress;
    fn deref(&self) -> &Decompress {
        self.z.as_ref().expect("leased inflater")
    }
}

impl DerefMut for InflateLease<'_> {
    fn deref_mut(&mut self) -> &mut Decompress {
        self.z.as_mut().expect("leased inflater")
    }
}

impl Drop for InflateLease<'_> {
    fn drop(&mut self) {
        if let Some(mut z) = self.z.take() {
            z.reset(true);
            self.pool.free.lock().unwrap().push(z);
        }
    }
}

/// Inflate one zlib stream from an in-memory slice.
///
/// Returns the inflated bytes and the number of compressed bytes consumed,
/// so callers can locate the end of the entry. Fails if the stream ends
/// before or after `expected_size` bytes ("wrong decompressed length"), or
/// if the input is exhausted mid-stream.
pub fn inflate_slice(
    z: &mut Decompress,
    input: &[u8],
    expected_size: usize,
    entry_offset: u64,
) -> Result<(Vec<u8>, usize), PackError> {
    z.reset(true);
    let mut out: Vec<u8> = Vec::with_capacity(expected_size.min(1 << 20));
    let mut consumed = 0usize;

    loop {
        if out.len() == out.capacity() {
            out.reserve(8192);
        }
        let before_in = z.total_in();
        let status = z
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
            .map_err(|e| PackError::InvalidDelta {
                offset: entry_offset,
                reason: format!("zlib error: {e}"),
            })?;
        consumed += (z.total_in() - before_in) as usize;

        if out.len() > expected_size {
            return Err(PackError::InvalidDelta {
                offset: entry_offset,
                reason: format!(
                    "wrong decompressed length: declared {expected_size}, got more"
                ),
            });
        }

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if consumed == input.len() && out.len() < expected_size && out.len() < out.capacity()
                {
                    return Err(PackError::TruncatedInput(format!(
                        "zlib stream at offset {entry_offset}"
                    )));
                }
            }
        }
    }

    if out.len() != expected_size {
        return Err(PackError::InvalidDelta {
            offset: entry_offset,
            reason: format!(
                "wrong decompressed length: declared {expected_size}, got {}",
                out.len()
            ),
        });
    }

    Ok((out, consumed))
}

/// Deflate a buffer with zlib at the default level.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, PackError> {
    use std::io::Write;

    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
