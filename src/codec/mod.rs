//! Binary framing for partition files
//!
//! # File structure
//!
//! ```txt
//! {header frame} 0x0A
//! {sample frame} 0x0A
//! ...
//! ```
//!
//! Every frame is escaped (see [`escape`]) so frames can be found by scanning.
//!
//! ## Header payload
//!  - [u16] format version
//!  - [u8] payload type tag
//!  - [i16] year
//!  - [u32] element count
//!  - [str] PV name
//!  - [u16] header count, then (key [str], value [str])*
//!
//! ## Sample payload
//!  - [u8] payload type tag, must match the header
//!  - [u32] seconds into the header's year
//!  - [u32] nanos
//!  - [i32] status, [i32] severity
//!  - [_] value, scalars as-is, vectors as [u32] count + elements
//!  - [u16] field count, then (name [str], value [str])*
//!
//! All integers are little endian, `[str]` is a [u32] length + UTF-8.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use jiff::Timestamp;

use crate::{
    sample::{FieldValue, PartitionHeader, PayloadType, Sample, SampleValue},
    time::{epoch_parts, year_of, year_start_second},
};

pub mod error;
pub mod escape;

pub use error::CodecError;
pub use escape::DELIMITER;

pub const FORMAT_VERSION: u16 = 1;

/// What a sample frame is validated and positioned against, fixed by the partition header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    pub payload_type: PayloadType,
    /// Length every waveform frame must have, scalars ignore it
    pub element_count: u32,
    pub year: i16,
    year_start: i64,
}

impl DecodeContext {
    pub fn new(payload_type: PayloadType, element_count: u32, year: i16) -> Result<Self, CodecError> {
        Ok(Self {
            payload_type,
            element_count,
            year,
            year_start: year_start_second(year)?,
        })
    }

    pub fn for_header(header: &PartitionHeader) -> Result<Self, CodecError> {
        Self::new(header.payload_type, header.element_count, header.year)
    }

    pub fn year_start(&self) -> i64 {
        self.year_start
    }

    fn check_element_count(&self, value: &SampleValue) -> Result<(), CodecError> {
        let found = value.element_count();
        match self.payload_type.is_waveform() && found != self.element_count as usize {
            true => Err(CodecError::ElementCountMismatch {
                declared: self.element_count,
                found,
            }),
            false => Ok(()),
        }
    }
}

/// Encodes one sample into an escaped frame, without the trailing delimiter
pub fn encode_sample(sample: &Sample, ctx: &DecodeContext) -> Result<Vec<u8>, CodecError> {
    let found = sample.value.payload_type();
    if found != ctx.payload_type {
        return Err(CodecError::TypeTagMismatch {
            declared: ctx.payload_type,
            found,
        });
    }
    ctx.check_element_count(&sample.value)?;

    let (seconds, nanos) = epoch_parts(sample.timestamp);
    let seconds_into_year = u32::try_from(seconds - ctx.year_start)
        .map_err(|_| CodecError::TimestampOutOfYear {
            ts: sample.timestamp,
            year: ctx.year,
        })?;
    if year_of(sample.timestamp) != ctx.year {
        return Err(CodecError::TimestampOutOfYear {
            ts: sample.timestamp,
            year: ctx.year,
        });
    }

    let mut raw = BytesMut::with_capacity(32);
    raw.put_u8(found.tag());
    raw.put_u32_le(seconds_into_year);
    raw.put_u32_le(nanos);
    raw.put_i32_le(sample.status);
    raw.put_i32_le(sample.severity);
    put_value(&mut raw, &sample.value)?;
    put_len_u16(&mut raw, sample.fields.len())?;
    for field in &sample.fields {
        put_str(&mut raw, &field.name)?;
        put_str(&mut raw, &field.value)?;
    }

    let mut frame = BytesMut::with_capacity(raw.len() + 8);
    escape::escape_into(&raw, &mut frame);
    Ok(frame.to_vec())
}

/// Decodes one escaped frame (without its delimiter) into a sample
pub fn decode_sample(frame: &[u8], ctx: &DecodeContext) -> Result<Sample, CodecError> {
    let raw = escape::unescape(frame)?;
    let mut buf = &raw[..];

    need(&buf, 1)?;
    let tag = buf.get_u8();
    let found = PayloadType::from_tag(tag).ok_or(CodecError::UnknownTypeTag(tag))?;
    if found != ctx.payload_type {
        return Err(CodecError::TypeTagMismatch {
            declared: ctx.payload_type,
            found,
        });
    }

    need(&buf, 16)?;
    let seconds_into_year = buf.get_u32_le();
    let nanos = buf.get_u32_le();
    let status = buf.get_i32_le();
    let severity = buf.get_i32_le();
    let timestamp = Timestamp::new(ctx.year_start + seconds_into_year as i64, nanos as i32)?;

    let value = get_value(&mut buf, found)?;
    ctx.check_element_count(&value)?;

    need(&buf, 2)?;
    let num_fields = buf.get_u16_le() as usize;
    let mut fields = Vec::with_capacity(num_fields);
    for _ in 0..num_fields {
        let name = get_str(&mut buf)?;
        let value = get_str(&mut buf)?;
        fields.push(FieldValue { name, value });
    }

    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }

    Ok(Sample {
        timestamp,
        status,
        severity,
        value,
        fields,
    })
}

pub fn encode_header(header: &PartitionHeader) -> Result<Vec<u8>, CodecError> {
    let mut raw = BytesMut::with_capacity(64);
    raw.put_u16_le(header.version);
    raw.put_u8(header.payload_type.tag());
    raw.put_i16_le(header.year);
    raw.put_u32_le(header.element_count);
    put_str(&mut raw, &header.pv_name)?;
    put_len_u16(&mut raw, header.headers.len())?;
    for (k, v) in &header.headers {
        put_str(&mut raw, k)?;
        put_str(&mut raw, v)?;
    }

    let mut frame = BytesMut::with_capacity(raw.len() + 8);
    escape::escape_into(&raw, &mut frame);
    Ok(frame.to_vec())
}

pub fn decode_header(frame: &[u8]) -> Result<PartitionHeader, CodecError> {
    let raw = escape::unescape(frame)?;
    let mut buf = &raw[..];

    need(&buf, 9)?;
    let version = buf.get_u16_le();
    let tag = buf.get_u8();
    let payload_type = PayloadType::from_tag(tag).ok_or(CodecError::UnknownTypeTag(tag))?;
    let year = buf.get_i16_le();
    let element_count = buf.get_u32_le();
    let pv_name = get_str(&mut buf)?;

    need(&buf, 2)?;
    let num_headers = buf.get_u16_le() as usize;
    let mut headers = BTreeMap::new();
    for _ in 0..num_headers {
        let k = get_str(&mut buf)?;
        let v = get_str(&mut buf)?;
        headers.insert(k, v);
    }

    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }

    Ok(PartitionHeader {
        version,
        pv_name,
        year,
        payload_type,
        element_count,
        headers,
    })
}

/// Whole partition image: header frame then one frame per sample, each delimited.
/// Retrieval never writes partitions, this exists for fixtures and tooling.
pub fn encode_partition<'a>(
    header: &PartitionHeader,
    samples: impl IntoIterator<Item = &'a Sample>,
) -> Result<Vec<u8>, CodecError> {
    let ctx = DecodeContext::for_header(header)?;
    let mut out = encode_header(header)?;
    out.push(DELIMITER);
    for sample in samples {
        out.extend_from_slice(&encode_sample(sample, &ctx)?);
        out.push(DELIMITER);
    }
    Ok(out)
}

fn need(buf: &impl Buf, n: usize) -> Result<(), CodecError> {
    match buf.remaining() {
        r if r >= n => Ok(()),
        r => Err(CodecError::Truncated { needed: n - r }),
    }
}

fn put_len_u16(dst: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    dst.put_u16_le(u16::try_from(len).map_err(|_| CodecError::TooLarge(len))?);
    Ok(())
}

fn put_len_u32(dst: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    dst.put_u32_le(u32::try_from(len).map_err(|_| CodecError::TooLarge(len))?);
    Ok(())
}

fn put_str(dst: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    put_len_u32(dst, s.len())?;
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(String::from_utf8(bytes)?)
}

fn get_count(buf: &mut &[u8], elem_size: usize) -> Result<usize, CodecError> {
    need(buf, 4)?;
    let count = buf.get_u32_le() as usize;
    // reject before allocating
    need(buf, count.saturating_mul(elem_size))?;
    Ok(count)
}

fn put_value(dst: &mut BytesMut, value: &SampleValue) -> Result<(), CodecError> {
    match value {
        SampleValue::String(s) => put_str(dst, s)?,
        SampleValue::Short(v) | SampleValue::Enum(v) => dst.put_i16_le(*v),
        SampleValue::Float(v) => dst.put_f32_le(*v),
        SampleValue::Byte(v) => dst.put_u8(*v),
        SampleValue::Int(v) => dst.put_i32_le(*v),
        SampleValue::Double(v) => dst.put_f64_le(*v),
        SampleValue::StringVec(v) => {
            put_len_u32(dst, v.len())?;
            for s in v {
                put_str(dst, s)?;
            }
        }
        SampleValue::ShortVec(v) | SampleValue::EnumVec(v) => {
            put_len_u32(dst, v.len())?;
            v.iter().for_each(|x| dst.put_i16_le(*x));
        }
        SampleValue::FloatVec(v) => {
            put_len_u32(dst, v.len())?;
            v.iter().for_each(|x| dst.put_f32_le(*x));
        }
        SampleValue::ByteVec(v) => {
            put_len_u32(dst, v.len())?;
            dst.put_slice(v);
        }
        SampleValue::IntVec(v) => {
            put_len_u32(dst, v.len())?;
            v.iter().for_each(|x| dst.put_i32_le(*x));
        }
        SampleValue::DoubleVec(v) => {
            put_len_u32(dst, v.len())?;
            v.iter().for_each(|x| dst.put_f64_le(*x));
        }
    }
    Ok(())
}

fn get_value(buf: &mut &[u8], ty: PayloadType) -> Result<SampleValue, CodecError> {
    use PayloadType as P;
    Ok(match ty {
        P::ScalarString => SampleValue::String(get_str(buf)?),
        P::ScalarShort => {
            need(buf, 2)?;
            SampleValue::Short(buf.get_i16_le())
        }
        P::ScalarEnum => {
            need(buf, 2)?;
            SampleValue::Enum(buf.get_i16_le())
        }
        P::ScalarFloat => {
            need(buf, 4)?;
            SampleValue::Float(buf.get_f32_le())
        }
        P::ScalarByte => {
            need(buf, 1)?;
            SampleValue::Byte(buf.get_u8())
        }
        P::ScalarInt => {
            need(buf, 4)?;
            SampleValue::Int(buf.get_i32_le())
        }
        P::ScalarDouble => {
            need(buf, 8)?;
            SampleValue::Double(buf.get_f64_le())
        }
        P::WaveformString => {
            let count = get_count(buf, 4)?;
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(get_str(buf)?);
            }
            SampleValue::StringVec(v)
        }
        P::WaveformShort => {
            let count = get_count(buf, 2)?;
            SampleValue::ShortVec((0..count).map(|_| buf.get_i16_le()).collect())
        }
        P::WaveformEnum => {
            let count = get_count(buf, 2)?;
            SampleValue::EnumVec((0..count).map(|_| buf.get_i16_le()).collect())
        }
        P::WaveformFloat => {
            let count = get_count(buf, 4)?;
            SampleValue::FloatVec((0..count).map(|_| buf.get_f32_le()).collect())
        }
        P::WaveformByte => {
            let count = get_count(buf, 1)?;
            let v = buf[..count].to_vec();
            buf.advance(count);
            SampleValue::ByteVec(v)
        }
        P::WaveformInt => {
            let count = get_count(buf, 4)?;
            SampleValue::IntVec((0..count).map(|_| buf.get_i32_le()).collect())
        }
        P::WaveformDouble => {
            let count = get_count(buf, 8)?;
            SampleValue::DoubleVec((0..count).map(|_| buf.get_f64_le()).collect())
        }
    })
}
