use std::io::{self, Write};

use thiserror::Error;

use crate::sample::{Sample, StreamDescriptor};

#[derive(Error, Debug)]
pub enum SinkError {
    /// Consumer went away, not a failure of the request
    #[error("sink disconnected")]
    Disconnected,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialize descriptor: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Where retrieved samples go. `begin_pv` is called once per PV before its samples.
pub trait Sink: Send {
    fn begin_pv(&mut self, descriptor: &StreamDescriptor) -> Result<(), SinkError>;
    fn write(&mut self, sample: &Sample) -> Result<(), SinkError>;
    fn end(&mut self) -> Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn begin_pv(&mut self, descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        (**self).begin_pv(descriptor)
    }

    fn write(&mut self, sample: &Sample) -> Result<(), SinkError> {
        (**self).write(sample)
    }

    fn end(&mut self) -> Result<(), SinkError> {
        (**self).end()
    }
}

/// Collects everything, grouped per PV
#[derive(Debug, Default)]
pub struct VecSink {
    pub pvs: Vec<(StreamDescriptor, Vec<Sample>)>,
    pub ended: bool,
    disconnect_after: Option<usize>,
    written: usize,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `n` samples then reports [`SinkError::Disconnected`]
    pub fn disconnecting_after(n: usize) -> Self {
        Self {
            disconnect_after: Some(n),
            ..Default::default()
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.pvs.iter().flat_map(|(_, samples)| samples)
    }
}

impl Sink for VecSink {
    fn begin_pv(&mut self, descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        self.pvs.push((descriptor.clone(), Vec::new()));
        Ok(())
    }

    fn write(&mut self, sample: &Sample) -> Result<(), SinkError> {
        if self.disconnect_after.is_some_and(|n| self.written >= n) {
            return Err(SinkError::Disconnected);
        }
        self.written += 1;
        match self.pvs.last_mut() {
            Some((_, samples)) => samples.push(sample.clone()),
            None => return Err(SinkError::Io(io::Error::other("write before begin_pv"))),
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), SinkError> {
        self.ended = true;
        Ok(())
    }
}

/// Line oriented output:
///
/// ```txt
/// # {descriptor as JSON}
/// {timestamp}\t{value}\t{status}\t{severity}[\t{field}={value}]*
/// ```
pub struct TextSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn map_io(e: io::Error) -> SinkError {
    match e.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => SinkError::Disconnected,
        _ => SinkError::Io(e),
    }
}

impl<W: Write + Send> Sink for TextSink<W> {
    fn begin_pv(&mut self, descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        let json = serde_json::to_string(descriptor)?;
        writeln!(self.out, "# {json}").map_err(map_io)
    }

    fn write(&mut self, sample: &Sample) -> Result<(), SinkError> {
        let mut line = format!(
            "{}\t{}\t{}\t{}",
            sample.timestamp, sample.value, sample.status, sample.severity
        );
        for field in &sample.fields {
            line.push_str(&format!("\t{}={}", field.name, field.value));
        }
        writeln!(self.out, "{line}").map_err(map_io)
    }

    fn end(&mut self) -> Result<(), SinkError> {
        self.out.flush().map_err(map_io)
    }
}
