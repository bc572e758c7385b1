//! Flat serialization of the strong intern set.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! u64 count
//! count x { u32 hash, u32 byte_len, byte_len bytes of UTF-8 }
//! ```

use tracing::warn;

use crate::error::{RuntimeError, RuntimeResult};
use crate::object::{ObjectRef, compute_string_hash};

pub(crate) struct SnapshotEntry {
    pub(crate) hash: u32,
    pub(crate) content: String,
}

/// Byte length as stored in an entry header, if it fits.
fn length_prefix(len: usize) -> Option<u32> {
    u32::try_from(len).ok()
}

/// Serializes `entries`. Strings too long for a `u32` length are left out.
pub(crate) fn encode(entries: &[ObjectRef]) -> Vec<u8> {
    let strings: Vec<(&str, u32)> = entries
        .iter()
        .filter_map(ObjectRef::as_str)
        .filter_map(|content| match length_prefix(content.len()) {
            Some(len) => Some((content, len)),
            None => {
                warn!(len = content.len(), "intern entry too long for a snapshot, skipped");
                None
            }
        })
        .collect();
    let payload: usize = strings.iter().map(|(content, _)| 8 + content.len()).sum();
    let mut out = Vec::with_capacity(8 + payload);
    out.extend_from_slice(&(strings.len() as u64).to_le_bytes());
    for (content, len) in strings {
        out.extend_from_slice(&compute_string_hash(content).to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(content.as_bytes());
    }
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn malformed(&self, reason: &'static str) -> RuntimeError {
        RuntimeError::MalformedSnapshot {
            offset: self.offset,
            reason,
        }
    }

    fn take(&mut self, len: usize) -> RuntimeResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| self.malformed("truncated"))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> RuntimeResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> RuntimeResult<u64> {
        let raw = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(raw);
        Ok(u64::from_le_bytes(word))
    }
}

/// Parses a snapshot, returning its entries and the number of bytes read.
pub(crate) fn decode(bytes: &[u8]) -> RuntimeResult<(Vec<SnapshotEntry>, usize)> {
    let mut reader = Reader { bytes, offset: 0 };
    let count = reader.u64()?;
    // Every entry needs at least its two length words.
    if count > (bytes.len() as u64) / 8 {
        return Err(reader.malformed("entry count exceeds snapshot size"));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let hash = reader.u32()?;
        let len = reader.u32()? as usize;
        let start = reader.offset;
        let raw = reader.take(len)?;
        let content = std::str::from_utf8(raw).map_err(|_| RuntimeError::MalformedSnapshot {
            offset: start,
            reason: "invalid UTF-8",
        })?;
        if compute_string_hash(content) != hash {
            return Err(RuntimeError::MalformedSnapshot {
                offset: start,
                reason: "hash mismatch",
            });
        }
        entries.push(SnapshotEntry {
            hash,
            content: content.to_owned(),
        });
    }
    Ok((entries, reader.offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectFlags;

    #[test]
    fn layout_is_count_prefixed() {
        let entries = vec![ObjectRef::new_string("ab", ObjectFlags::empty())];
        let bytes = encode(&entries);
        assert_eq!(&bytes[..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &compute_string_hash("ab").to_le_bytes());
        assert_eq!(&bytes[12..16], &2u32.to_le_bytes());
        assert_eq!(&bytes[16..], b"ab");

        let (decoded, read) = decode(&bytes).unwrap();
        assert_eq!(read, bytes.len());
        assert_eq!(decoded[0].content, "ab");
        assert_eq!(decoded[0].hash, compute_string_hash("ab"));
    }

    #[test]
    fn lengths_past_u32_have_no_prefix() {
        assert_eq!(length_prefix(0), Some(0));
        assert_eq!(length_prefix(u32::MAX as usize), Some(u32::MAX));
        if let Some(too_long) = (u32::MAX as usize).checked_add(1) {
            assert_eq!(length_prefix(too_long), None);
        }
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let mut bytes = encode(&[]);
        bytes.extend_from_slice(b"tail");
        let (decoded, read) = decode(&bytes).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(read, 8);
    }

    #[test]
    fn rejects_corruption() {
        let mut bytes = encode(&[ObjectRef::new_string("abc", ObjectFlags::empty())]);
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(RuntimeError::MalformedSnapshot { reason: "truncated", .. })
        ));

        let last = bytes.len() - 1;
        bytes[last] = b'x';
        assert_eq!(
            decode(&bytes).err(),
            Some(RuntimeError::MalformedSnapshot {
                offset: 16,
                reason: "hash mismatch"
            })
        );

        bytes[last] = 0xff;
        assert!(matches!(
            decode(&bytes),
            Err(RuntimeError::MalformedSnapshot { reason: "invalid UTF-8", .. })
        ));

        let huge = u64::MAX.to_le_bytes();
        assert!(matches!(
            decode(&huge),
            Err(RuntimeError::MalformedSnapshot { offset: 8, .. })
        ));
    }
}
