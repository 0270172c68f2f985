use std::{
    fs::File,
    io::{BufRead, BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use tracing::debug;

use super::error::StreamError;
use crate::{
    codec::{self, DELIMITER, DecodeContext},
    sample::{PartitionHeader, PayloadType, Sample, StreamDescriptor},
    time::{epoch_parts, year_of},
};

/// Lazy, single pass reader over one partition file.
///
/// The file handle is held until the stream finishes, errors or is dropped.
pub struct PartitionedEventStream {
    reader: Option<BufReader<File>>,
    path: PathBuf,
    descriptor: StreamDescriptor,
    ctx: DecodeContext,
    /// offset of the next frame to read
    position: u64,
    /// boundary sample, emitted before anything read from `position`
    pending: Option<Sample>,
    stop: Stop,
    frame: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
enum Stop {
    After(Timestamp),
    AtOffset(u64),
}

/// Last frame strictly before the window start
struct Boundary {
    offset: u64,
    end: u64,
    sample: Sample,
}

/// Frame read off disk, delimiter stripped
struct RawFrame {
    offset: u64,
    len_with_delim: u64,
}

impl PartitionedEventStream {
    /// Emits the last sample before `start` (if any), then every sample with
    /// `start <= ts <= end`. A window inside one second is widened to the whole second.
    pub fn open_window(
        path: &Path,
        declared: PayloadType,
        pv_name: &str,
        start: Timestamp,
        end: Timestamp,
        skip_search: bool,
    ) -> Result<Self, StreamError> {
        let (start, end) = widen_same_second(start, end);

        let mut stream = Self::open(path, declared, pv_name, year_of(start), Stop::After(end))?;
        if stream.reader.is_none() {
            return Ok(stream);
        }

        let boundary = match skip_search {
            true => stream.scan_for_boundary(start)?,
            false => stream.search_for_boundary(start)?,
        };

        if let Some(b) = boundary {
            debug!(
                "{}: boundary frame at {} ({})",
                stream.path.display(),
                b.offset,
                b.sample.timestamp
            );
            stream.position = b.end;
            stream.pending = Some(b.sample);
        }
        stream.seek_reader(stream.position)?;
        Ok(stream)
    }

    /// Emits every frame whose first byte lies in `[start_offset, end_offset)`, ignoring
    /// timestamps. Offsets that are not frame boundaries re-sync on the next delimiter.
    pub fn open_byte_range(
        path: &Path,
        declared: PayloadType,
        pv_name: &str,
        start_offset: u64,
        end_offset: u64,
    ) -> Result<Self, StreamError> {
        let mut stream = Self::open(
            path,
            declared,
            pv_name,
            year_of(Timestamp::UNIX_EPOCH),
            Stop::AtOffset(end_offset),
        )?;
        if stream.reader.is_none() || start_offset <= stream.position {
            return Ok(stream);
        }

        match stream.next_frame_start(start_offset)? {
            Some(offset) => {
                stream.position = offset;
                stream.seek_reader(offset)?;
            }
            None => stream.finish(),
        }
        Ok(stream)
    }

    /// Header of the partition at `path`, `None` for an empty file
    pub fn read_header(path: &Path) -> Result<Option<PartitionHeader>, StreamError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut frame = Vec::new();
        match read_delimited(&mut reader, &mut frame)? {
            Some(_) => codec::decode_header(&frame)
                .map(Some)
                .map_err(|source| StreamError::Codec { offset: 0, source }),
            None if frame.is_empty() => Ok(None),
            None => Err(StreamError::Codec {
                offset: 0,
                source: codec::CodecError::Truncated { needed: 1 },
            }),
        }
    }

    /// Reads and validates the header, leaving the stream at the first data frame.
    /// An empty file gives an already finished stream.
    fn open(
        path: &Path,
        declared: PayloadType,
        pv_name: &str,
        fallback_year: i16,
        stop: Stop,
    ) -> Result<Self, StreamError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut frame = Vec::with_capacity(256);

        let header_len = match read_delimited(&mut reader, &mut frame)? {
            Some(len) => Some(len),
            None if frame.is_empty() => None,
            None => {
                return Err(StreamError::Codec {
                    offset: 0,
                    source: codec::CodecError::Truncated { needed: 1 },
                });
            }
        };

        let (descriptor, reader, position) = match header_len {
            Some(len) => {
                let header = codec::decode_header(&frame)
                    .map_err(|source| StreamError::Codec { offset: 0, source })?;
                if header.payload_type != declared {
                    return Err(StreamError::TypeMismatch {
                        declared,
                        found: header.payload_type,
                    });
                }
                let descriptor = StreamDescriptor::from_header(&header, path.display().to_string());
                (descriptor, Some(reader), len)
            }
            None => {
                let descriptor = StreamDescriptor {
                    pv_name: pv_name.to_string(),
                    payload_type: declared,
                    element_count: 1,
                    year: fallback_year,
                    source: path.display().to_string(),
                    headers: Default::default(),
                };
                (descriptor, None, 0)
            }
        };

        let ctx = DecodeContext::new(descriptor.payload_type, descriptor.element_count, descriptor.year)
            .map_err(|source| StreamError::Codec { offset: 0, source })?;

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            descriptor,
            ctx,
            position,
            pending: None,
            stop,
            frame,
        })
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The sample in force before the window start is still to be emitted
    pub fn has_boundary(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_none() && self.pending.is_none()
    }

    fn finish(&mut self) {
        self.reader = None;
    }

    fn seek_reader(&mut self, offset: u64) -> Result<(), StreamError> {
        if let Some(reader) = self.reader.as_mut() {
            reader.seek(SeekFrom::Start(offset))?;
        }
        Ok(())
    }

    /// Reads the frame starting at `offset`. `None` at end of file or on a torn
    /// trailing frame; the iterator reports the torn frame when it reaches it.
    /// An undecodable frame comes back without a sample.
    fn frame_at(&mut self, offset: u64) -> Result<Option<(RawFrame, Option<Sample>)>, StreamError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        reader.seek(SeekFrom::Start(offset))?;
        let Some(len) = read_delimited(reader, &mut self.frame)? else {
            return Ok(None);
        };
        let sample = match codec::decode_sample(&self.frame, &self.ctx) {
            Ok(sample) => Some(sample),
            Err(e) => {
                debug!("{}: undecodable frame at {offset}: {e}", self.path.display());
                None
            }
        };
        Ok(Some((
            RawFrame {
                offset,
                len_with_delim: len,
            },
            sample,
        )))
    }

    /// First decodable frame starting in `[offset, limit)`
    fn decodable_from(
        &mut self,
        mut offset: u64,
        limit: u64,
    ) -> Result<Option<(RawFrame, Sample)>, StreamError> {
        while offset < limit {
            match self.frame_at(offset)? {
                None => return Ok(None),
                Some((frame, Some(sample))) => return Ok(Some((frame, sample))),
                Some((frame, None)) => offset = frame.offset + frame.len_with_delim,
            }
        }
        Ok(None)
    }

    /// Offset of the first frame starting at or after `offset`
    fn next_frame_start(&mut self, offset: u64) -> Result<Option<u64>, StreamError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        // a frame starts at `offset` iff the byte before it is a delimiter
        let from = offset.saturating_sub(1);
        reader.seek(SeekFrom::Start(from))?;
        let mut skipped = Vec::new();
        match reader.read_until(DELIMITER, &mut skipped)? {
            0 => Ok(None),
            n if skipped.last() == Some(&DELIMITER) => Ok(Some(from + n as u64)),
            _ => Ok(None),
        }
    }

    /// Undecodable frames are invisible to both seek routines, so they agree on the
    /// boundary whatever the damage. The iterator reports the first one it reaches.
    fn scan_for_boundary(&mut self, target: Timestamp) -> Result<Option<Boundary>, StreamError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut best = None;
        let mut offset = self.position;
        reader.seek(SeekFrom::Start(offset))?;
        while let Some(len) = read_delimited(reader, &mut self.frame)? {
            let frame_offset = offset;
            offset += len;
            let Ok(sample) = codec::decode_sample(&self.frame, &self.ctx) else {
                continue;
            };
            if sample.timestamp >= target {
                break;
            }
            best = Some(Boundary {
                offset: frame_offset,
                end: offset,
                sample,
            });
        }
        Ok(best)
    }

    /// Binary search over byte offsets. Invariants: every decodable frame starting
    /// before `lo` is before `target`, every decodable frame starting at or after `hi`
    /// is not. A midpoint landing on an undecodable frame uses the next decodable one.
    fn search_for_boundary(&mut self, target: Timestamp) -> Result<Option<Boundary>, StreamError> {
        let Some(reader) = self.reader.as_ref() else {
            return Ok(None);
        };
        let mut lo = self.position;
        let mut hi = reader.get_ref().metadata()?.len();
        let mut best = None;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let Some(start) = self.next_frame_start(mid)?.filter(|s| *s < hi) else {
                hi = mid;
                continue;
            };
            match self.decodable_from(start, hi)? {
                Some((frame, sample)) if sample.timestamp < target => {
                    lo = frame.offset + frame.len_with_delim;
                    best = Some(Boundary {
                        offset: frame.offset,
                        end: lo,
                        sample,
                    });
                }
                _ => hi = mid,
            }
        }
        Ok(best)
    }

    fn read_next(&mut self) -> Result<Option<Sample>, StreamError> {
        if let Stop::AtOffset(end) = self.stop {
            if self.position >= end {
                return Ok(None);
            }
        }
        let offset = self.position;
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let Some(len) = read_delimited(reader, &mut self.frame)? else {
            return match self.frame.is_empty() {
                true => Ok(None),
                false => Err(StreamError::Codec {
                    offset,
                    source: codec::CodecError::Truncated { needed: 1 },
                }),
            };
        };
        self.position += len;

        let sample = codec::decode_sample(&self.frame, &self.ctx)
            .map_err(|source| StreamError::Codec { offset, source })?;
        match self.stop {
            Stop::After(end) if sample.timestamp > end => Ok(None),
            _ => Ok(Some(sample)),
        }
    }
}

impl Iterator for PartitionedEventStream {
    type Item = Result<Sample, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(sample) = self.pending.take() {
            return Some(Ok(sample));
        }
        match self.read_next() {
            Ok(Some(sample)) => Some(Ok(sample)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }
}

/// Reads one frame into `buf` with the delimiter stripped.
/// Returns the bytes consumed including the delimiter, `None` at end of file or when the
/// last frame has no delimiter (`buf` then holds the partial frame).
fn read_delimited(
    reader: &mut BufReader<File>,
    buf: &mut Vec<u8>,
) -> Result<Option<u64>, StreamError> {
    buf.clear();
    let n = reader.read_until(DELIMITER, buf)?;
    if n == 0 || buf.last() != Some(&DELIMITER) {
        return Ok(None);
    }
    buf.pop();
    Ok(Some(n as u64))
}

/// `[S.x, S.y]` becomes `[S.000000000, S.999999999]`
fn widen_same_second(start: Timestamp, end: Timestamp) -> (Timestamp, Timestamp) {
    let (s, _) = epoch_parts(start);
    let (e, _) = epoch_parts(end);
    if s != e {
        return (start, end);
    }
    (
        Timestamp::new(s, 0).unwrap_or(start),
        Timestamp::new(s, 999_999_999).unwrap_or(end),
    )
}
