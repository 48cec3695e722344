// Self-Delimiting Numeric Value encoding
//
// SDNVs are the variable-length integer format used by BP version 6
// blocks and by every LTP segment header field. Values are written
// big-endian, 7 bits per byte, with the high bit of every byte except
// the last set to one.

use crate::error::{DtnError, Result};
use bytes::{Buf, BufMut};

/// Maximum encoded length of a u64 (ceil(64 / 7) bytes).
pub const MAX_SDNV_LEN: usize = 10;

/// Number of bytes `value` occupies once SDNV-encoded.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    std::cmp::max(1, bits.div_ceil(7))
}

/// Append the SDNV encoding of `value` to `buf`.
pub fn encode(value: u64, buf: &mut impl BufMut) {
    let len = encoded_len(value);
    for i in (0..len).rev() {
        let mut byte = ((value >> (i * 7)) & 0x7f) as u8;
        if i != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
    }
}

/// Decode one SDNV from the front of `buf`, advancing it.
///
/// Fails on truncation and on encodings longer than ten bytes, which
/// cannot fit a u64 and indicate a corrupt or hostile segment.
pub fn decode(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_SDNV_LEN {
        if !buf.has_remaining() {
            return Err(DtnError::Protocol("truncated SDNV".to_string()));
        }
        let byte = buf.get_u8();
        // The tenth byte may only contribute the single low bit.
        if i == MAX_SDNV_LEN - 1 && (byte & 0x7e) != 0 {
            return Err(DtnError::Protocol("SDNV overflows u64".to_string()));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DtnError::Protocol("SDNV longer than 10 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(value: u64) -> usize {
        let mut buf = BytesMut::new();
        encode(value, &mut buf);
        let len = buf.len();
        assert_eq!(len, encoded_len(value));
        let mut slice = &buf[..];
        assert_eq!(decode(&mut slice).unwrap(), value);
        assert!(slice.is_empty());
        len
    }

    #[test]
    fn test_small_values() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(1), 1);
        assert_eq!(roundtrip(127), 1);
        assert_eq!(roundtrip(128), 2);
        assert_eq!(roundtrip(16383), 2);
        assert_eq!(roundtrip(16384), 3);
    }

    #[test]
    fn test_large_values() {
        assert_eq!(roundtrip(u64::from(u32::MAX)), 5);
        assert_eq!(roundtrip(u64::MAX), 10);
    }

    #[test]
    fn test_truncated() {
        let mut buf = &[0x80u8, 0x80][..];
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn test_overlong() {
        // Eleven continuation bytes can never terminate within bounds.
        let mut buf = &[0xffu8; 11][..];
        assert!(decode(&mut buf).is_err());
    }
}
