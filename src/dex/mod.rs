//! Symbolic DEX codec.
//!
//! Containers are read into [`class::ClassDef`] records in which every pool index has been
//! replaced by the symbol it refers to, so classes can move freely between containers.
//! [`writer`] lays a set of such records back out as a valid DEX file.

#[macro_use]
pub mod error;

pub mod class;
pub mod container;
pub mod encoded_values;
pub(crate) mod leb;
pub mod opcodes;
pub mod reader;
pub mod writer;

use crate::dex::error::DexError;
use crate::dex::leb::{decode_sleb128, decode_uleb128, encode_sleb128, encode_uleb128};

pub const NO_INDEX: u32 = 0xFFFF_FFFF;

/// Largest number of entries a 16-bit indexed pool can address.
pub const DEX_INDEX_LIMIT: usize = 0x1_0000;

pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8, DexError> {
    let Some(&result) = bytes.get(*ix) else {
        fail!("unexpected end of stream reading u1 at {:#x}", *ix);
    };
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16, DexError> {
    let Some(raw) = bytes.get(*ix..*ix + 2) else {
        fail!("unexpected end of stream reading u2 at {:#x}", *ix);
    };
    *ix += 2;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError> {
    let Some(raw) = bytes.get(*ix..*ix + 4) else {
        fail!("unexpected end of stream reading u4 at {:#x}", *ix);
    };
    *ix += 4;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError> {
    let tail = bytes.get(*ix..).unwrap_or_default();
    let (val, size) = decode_uleb128(tail).map_err(|e| e.with_context(format!("offset {:#x}", *ix)))?;
    *ix += size;
    Ok(val)
}

pub(crate) fn read_sleb128(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError> {
    let tail = bytes.get(*ix..).unwrap_or_default();
    let (val, size) = decode_sleb128(tail).map_err(|e| e.with_context(format!("offset {:#x}", *ix)))?;
    *ix += size;
    Ok(val)
}

pub(crate) fn read_x<'a>(bytes: &'a [u8], ix: &mut usize, length: usize) -> Result<&'a [u8], DexError> {
    let Some(slice) = bytes.get(*ix..*ix + length) else {
        fail!("buffer too short for {} byte read at {:#x}", length, *ix);
    };
    *ix += length;
    Ok(slice)
}

pub(crate) fn write_u1(buffer: &mut Vec<u8>, val: u8) -> usize {
    buffer.push(val);
    1
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize {
    buffer.extend_from_slice(&val.to_le_bytes());
    2
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize {
    buffer.extend_from_slice(&val.to_le_bytes());
    4
}

pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize {
    let encoded = encode_uleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub(crate) fn write_sleb128(buffer: &mut Vec<u8>, val: i32) -> usize {
    let encoded = encode_sleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub(crate) fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize {
    buffer.extend_from_slice(val);
    val.len()
}

/// Pad `buffer` with zeroes up to the next multiple of `alignment`.
pub(crate) fn pad_to(buffer: &mut Vec<u8>, alignment: usize) {
    while buffer.len() % alignment != 0 {
        buffer.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_reads_advance_and_bound_check() {
        let bytes = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xE5, 0x8E, 0x26];
        let mut ix = 0;
        assert_eq!(read_u1(&bytes, &mut ix), Ok(0x01));
        assert_eq!(read_u2(&bytes, &mut ix), Ok(0x1234));
        assert_eq!(read_u4(&bytes, &mut ix), Ok(0x12345678));
        assert_eq!(read_uleb128(&bytes, &mut ix), Ok(624485));
        assert_eq!(ix, bytes.len());
        assert!(read_u2(&bytes, &mut ix).is_err());
        assert!(read_uleb128(&bytes, &mut ix).is_err());
    }

    #[test]
    fn pad_to_aligns() {
        let mut buf = vec![1, 2, 3, 4, 5];
        pad_to(&mut buf, 4);
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 0, 0, 0]);
        pad_to(&mut buf, 4);
        assert_eq!(buf.len(), 8);
    }
}
