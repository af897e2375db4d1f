use crate::dex::error::DexError;

pub(crate) fn encode_uleb128(value: u32) -> Vec<u8> {
    let mut result = Vec::with_capacity(5);
    let mut remaining = value;

    loop {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining != 0 {
            byte |= 0x80;
        }
        result.push(byte);
        if remaining == 0 {
            break;
        }
    }

    result
}

pub(crate) fn encode_sleb128(value: i32) -> Vec<u8> {
    let mut result = Vec::with_capacity(5);
    let mut remaining = value;

    loop {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;

        let done = (remaining == 0 && (byte & 0x40) == 0) || (remaining == -1 && (byte & 0x40) != 0);
        if !done {
            byte |= 0x80;
        }
        result.push(byte);
        if done {
            break;
        }
    }

    result
}

/// Decode an unsigned LEB128 value, returning it with the number of bytes consumed.
///
/// DEX values are 32-bit, so a valid encoding never exceeds five bytes.
pub(crate) fn decode_uleb128(encoded: &[u8]) -> Result<(u32, usize), DexError> {
    let mut value: u32 = 0;

    for (count, &byte) in encoded.iter().enumerate().take(5) {
        value |= ((byte & 0x7F) as u32).wrapping_shl(7 * count as u32);
        if byte & 0x80 == 0 {
            return Ok((value, count + 1));
        }
    }

    if encoded.len() < 5 {
        Err(DexError::new("truncated uleb128"))
    } else {
        Err(DexError::new("uleb128 longer than five bytes"))
    }
}

pub(crate) fn decode_sleb128(encoded: &[u8]) -> Result<(i32, usize), DexError> {
    let mut value: i32 = 0;
    let mut shift: u32 = 0;

    for (count, &byte) in encoded.iter().enumerate().take(5) {
        value |= ((byte & 0x7F) as i32).wrapping_shl(shift);
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 32 && (byte & 0x40) != 0 {
                value |= (-1i32).wrapping_shl(shift);
            }
            return Ok((value, count + 1));
        }
    }

    if encoded.len() < 5 {
        Err(DexError::new("truncated sleb128"))
    } else {
        Err(DexError::new("sleb128 longer than five bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uleb128() {
        let cases = vec![
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16256, vec![0x80, 0x7F]),
            (624485, vec![0xE5, 0x8E, 0x26]),
            (u32::MAX, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        ];

        for (value, expected) in cases {
            assert_eq!(encode_uleb128(value), expected);
        }
    }

    #[test]
    fn test_decode_uleb128() {
        let cases = vec![
            (vec![0x00], 0, 1),
            (vec![0x7F], 127, 1),
            (vec![0x80, 0x7F], 16256, 2),
            (vec![0xE5, 0x8E, 0x26, 0xAA], 624485, 3),
        ];

        for (encoded, expected, len) in cases {
            assert_eq!(decode_uleb128(&encoded), Ok((expected, len)));
        }
    }

    #[test]
    fn test_decode_sleb128() {
        let cases = vec![
            (vec![0x00], 0),
            (vec![0x7F], -1),
            (vec![0xFF, 0x00], 127),
            (vec![0x80, 0x7F], -128),
            (vec![0xC0, 0xBB, 0x78], -123456),
        ];

        for (encoded, expected) in cases {
            assert_eq!(decode_sleb128(&encoded).map(|(v, _)| v), Ok(expected));
            assert_eq!(encode_sleb128(expected), encoded);
        }
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(decode_uleb128(&[0x80, 0x80]).is_err());
        assert!(decode_sleb128(&[]).is_err());
        assert!(decode_uleb128(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }
}
