//! Varint encoding and decoding functions.
//!
//! Base-128 varints, least significant chunk first; the final byte has the
//! high bit zeroed. Signed integers go through zig-zag so small negative
//! values stay short. Varints here are expected to fit into one or two
//! bytes most of the time (tag and key lengths), so the implementation is
//! not optimised for larger integers.

use crate::buffer::{BufReader, BufWriter, DecodeError};

#[inline]
pub fn encode_varint(mut value: u64, out: &mut impl BufWriter) {
    loop {
        if value < 0x80 {
            out.put_u8(value as u8);
            break;
        } else {
            out.put_u8(((value & 0x7f) | 0x80) as u8);
            value >>= 7;
        }
    }
}

#[inline]
pub fn decode_varint<'a>(reader: &mut impl BufReader<'a>) -> Result<u64, DecodeError> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let byte = reader.get_u8()?;
        if shift >= 64 {
            return Err(DecodeError::VarintOverflow);
        }
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

#[inline]
pub fn encode_varint_signed(value: i64, out: &mut impl BufWriter) {
    encode_varint(((value << 1) ^ (value >> 63)) as u64, out)
}

#[inline]
pub fn decode_varint_signed<'a>(reader: &mut impl BufReader<'a>) -> Result<i64, DecodeError> {
    let raw = decode_varint(reader)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn varint_roundtrip(val in any::<u64>()) {
            let mut buf = Vec::new();
            encode_varint(val, &mut buf);
            prop_assert_eq!(val, decode_varint(&mut buf.as_slice()).unwrap());
        }

        #[test]
        fn varint_signed_roundtrip(val in any::<i64>()) {
            let mut buf = Vec::new();
            encode_varint_signed(val, &mut buf);
            prop_assert_eq!(val, decode_varint_signed(&mut buf.as_slice()).unwrap());
        }
    }
}
