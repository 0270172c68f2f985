//! Frames are separated by [`DELIMITER`]. Payload bytes that collide with the
//! delimiter, a carriage return or the escape byte itself are written as two bytes:
//!
//! ```txt
//! 0x1B -> 0x1B 0x01
//! 0x0A -> 0x1B 0x02
//! 0x0D -> 0x1B 0x03
//! ```
//!
//! So an unescaped `0x0A` in a file is always a frame boundary.

use bytes::{BufMut, BytesMut};

use super::error::CodecError;

pub const DELIMITER: u8 = 0x0A;
pub const ESCAPE: u8 = 0x1B;
const CARRIAGE_RETURN: u8 = 0x0D;

const ESCAPED_ESCAPE: u8 = 0x01;
const ESCAPED_DELIMITER: u8 = 0x02;
const ESCAPED_CARRIAGE_RETURN: u8 = 0x03;

pub fn escape_into(src: &[u8], dst: &mut BytesMut) {
    dst.reserve(src.len());
    for &b in src {
        match b {
            ESCAPE => dst.put_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            DELIMITER => dst.put_slice(&[ESCAPE, ESCAPED_DELIMITER]),
            CARRIAGE_RETURN => dst.put_slice(&[ESCAPE, ESCAPED_CARRIAGE_RETURN]),
            b => dst.put_u8(b),
        }
    }
}

pub fn unescape(src: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(src.len());
    let mut iter = src.iter().enumerate();
    while let Some((i, &b)) = iter.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some((_, &ESCAPED_ESCAPE)) => out.push(ESCAPE),
            Some((_, &ESCAPED_DELIMITER)) => out.push(DELIMITER),
            Some((_, &ESCAPED_CARRIAGE_RETURN)) => out.push(CARRIAGE_RETURN),
            _ => return Err(CodecError::MalformedEscape(i)),
        }
    }
    Ok(out)
}
