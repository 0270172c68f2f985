use jiff::Timestamp;
use thiserror::Error;

use crate::sample::PayloadType;

/// Every variant means the frame is unusable; the stream reports them as corrupt frames.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed escape sequence at byte {0}")]
    MalformedEscape(usize),
    #[error("frame truncated, needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("unknown payload type tag {0}")]
    UnknownTypeTag(u8),
    #[error("payload tag {found:?} does not match declared type {declared:?}")]
    TypeTagMismatch {
        declared: PayloadType,
        found: PayloadType,
    },
    #[error("waveform of {found} elements, header declares {declared}")]
    ElementCountMismatch { declared: u32, found: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("invalid UTF-8 in frame: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("timestamp {ts} is outside year {year}")]
    TimestampOutOfYear { ts: Timestamp, year: i16 },
    #[error("time error: {0}")]
    Time(#[from] jiff::Error),
    #[error("{0} items do not fit in a frame")]
    TooLarge(usize),
}
