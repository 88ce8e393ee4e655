//! Apply delta instructions to reconstruct objects.

use super::read_varint;
use crate::PackError;

fn invalid(offset: usize, reason: impl Into<String>) -> PackError {
    PackError::InvalidDelta {
        offset: offset as u64,
        reason: reason.into(),
    }
}

/// Apply a delta instruction stream to a base object, producing the target.
///
/// Bounds checks every copy instruction, and enforces both the declared
/// source size against the base and the declared target size against the
/// produced output.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, PackError> {
    let mut pos = 0;

    let (source_size, consumed) =
        read_varint(&delta[pos..]).ok_or_else(|| invalid(0, "truncated source size"))?;
    pos += consumed;

    let (target_size, consumed) =
        read_varint(&delta[pos..]).ok_or_else(|| invalid(pos, "truncated target size"))?;
    pos += consumed;

    if source_size != base.len() as u64 {
        return Err(invalid(
            0,
            format!(
                "source size mismatch: delta says {source_size}, base is {}",
                base.len()
            ),
        ));
    }

    let mut output = Vec::with_capacity(target_size as usize);

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            // Copy instruction: offset/size bytes present per flag bit.
            let mut offset: usize = 0;
            for (i, bit) in [0x01u8, 0x02, 0x04, 0x08].into_iter().enumerate() {
                if cmd & bit != 0 {
                    let b = *delta
                        .get(pos)
                        .ok_or_else(|| invalid(pos, "truncated copy offset"))?;
                    offset |= (b as usize) << (8 * i);
                    pos += 1;
                }
            }

            let mut size: usize = 0;
            for (i, bit) in [0x10u8, 0x20, 0x40].into_iter().enumerate() {
                if cmd & bit != 0 {
                    let b = *delta
                        .get(pos)
                        .ok_or_else(|| invalid(pos, "truncated copy size"))?;
                    size |= (b as usize) << (8 * i);
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }

            if offset + size > base.len() {
                return Err(invalid(
                    pos,
                    format!(
                        "copy out of bounds: offset={offset}, size={size}, base_len={}",
                        base.len()
                    ),
                ));
            }

            output.extend_from_slice(&base[offset..offset + size]);
        } else if cmd != 0 {
            // Insert instruction
            let n = cmd as usize;
            if pos + n > delta.len() {
                return Err(invalid(pos, "truncated insert data"));
            }
            output.extend_from_slice(&delta[pos..pos + n]);
            pos += n;
        } else {
            return Err(invalid(pos - 1, "reserved delta opcode 0"));
        }

        if output.len() as u64 > target_size {
            return Err(invalid(
                pos,
                format!(
                    "target overrun: declared {target_size}, already produced {}",
                    output.len()
                ),
            ));
        }
    }

    if output.len() as u64 != target_size {
        return Err(invalid(
            0,
            format!(
                "target size mismatch: delta says {target_size}, got {}",
                output.len()
            ),
        ));
    }

    Ok(output)
}
