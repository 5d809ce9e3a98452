//! Utility functions for binary data processing.
//!
//! Unaligned little-endian reads (via byteorder), NUL scanning (via memchr),
//! and a ULEB128 reader with fast paths for the small values that dominate
//! Mach-O linkedit streams.

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u32 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 4 > data.len()`.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&data[offset..])
}

/// Reads a little-endian u64 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 8 > data.len()`.
#[inline(always)]
pub fn read_u64_le_at(data: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&data[offset..])
}

// =============================================================================
// Byte Search
// =============================================================================

/// Finds the position of the first NUL byte, or the slice length if none.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

// =============================================================================
// ULEB128
// =============================================================================

/// Reads an unsigned LEB128 value.
///
/// Returns `(value, bytes_consumed)`, or `None` on truncation or overflow.
/// One- and two-byte values take the fast path; Mach-O streams rarely need
/// more.
#[inline(always)]
pub fn read_uleb128(data: &[u8]) -> Option<(u64, usize)> {
    let b0 = *data.first()?;
    if b0 < 0x80 {
        return Some((b0 as u64, 1));
    }

    let b1 = *data.get(1)?;
    if b1 < 0x80 {
        let value = ((b0 & 0x7F) as u64) | ((b1 as u64) << 7);
        return Some((value, 2));
    }

    let mut result: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte < 0x80 {
            return Some((result, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u32_le_at(&data, 0), 0x04030201);
        assert_eq!(read_u32_le_at(&data, 4), 0x08070605);
        assert_eq!(read_u64_le_at(&data, 0), 0x0807060504030201);
    }

    #[test]
    fn test_memchr_null() {
        assert_eq!(memchr_null(b"hello\0world"), 5);
        assert_eq!(memchr_null(b"\0"), 0);
        assert_eq!(memchr_null(b"hello"), 5);
    }

    #[test]
    fn test_uleb128() {
        assert_eq!(read_uleb128(&[0x00]), Some((0, 1)));
        assert_eq!(read_uleb128(&[0x7F]), Some((127, 1)));
        assert_eq!(read_uleb128(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_uleb128(&[0x90, 0x08]), Some((0x410, 2)));
        assert_eq!(read_uleb128(&[0xE5, 0x8E, 0x26]), Some((624485, 3)));
        assert_eq!(read_uleb128(&[0x80]), None);
    }
}
