use jiff::Timestamp;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    partition::StreamError,
    sample::{Sample, StreamDescriptor},
    sink::{Sink, SinkError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// written to the sink
    pub total: u64,
    /// dropped as not newer than the last written sample
    pub skipped: u64,
    pub compared: u64,
}

/// Stitches per tier streams into one strictly increasing sequence per PV.
///
/// Tiers overlap at their edges so the same sample can arrive twice. Anything not newer
/// than the last written timestamp is dropped.
#[derive(Debug, Default)]
pub struct MergeDedupConsumer {
    current_pv: Option<String>,
    last_emitted: Option<Timestamp>,
    stats: MergeStats,
}

impl MergeDedupConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new PV on the sink. Repeated calls for the same PV are no-ops, so every
    /// stream can announce itself.
    pub fn processing_pv(
        &mut self,
        sink: &mut dyn Sink,
        descriptor: &StreamDescriptor,
    ) -> Result<(), SinkError> {
        if self.current_pv.as_deref() == Some(descriptor.pv_name.as_str()) {
            return Ok(());
        }
        debug!("begin {}", descriptor.pv_name);
        self.current_pv = Some(descriptor.pv_name.clone());
        self.last_emitted = None;
        sink.begin_pv(descriptor)
    }

    pub fn is_processing(&self) -> bool {
        self.current_pv.is_some()
    }

    pub fn consume(&mut self, sample: &Sample, sink: &mut dyn Sink) -> Result<(), SinkError> {
        self.stats.compared += 1;
        if self.last_emitted.is_some_and(|last| sample.timestamp <= last) {
            self.stats.skipped += 1;
            return Ok(());
        }
        sink.write(sample)?;
        self.stats.total += 1;
        self.last_emitted = Some(sample.timestamp);
        Ok(())
    }

    /// Drains a stream into the sink. A stream error ends that stream only, whatever it
    /// already produced stays written. Sink errors abort.
    pub fn consume_stream<I>(&mut self, stream: I, sink: &mut dyn Sink) -> Result<(), SinkError>
    where
        I: IntoIterator<Item = Result<Sample, StreamError>>,
    {
        for item in stream {
            match item {
                Ok(sample) => self.consume(&sample, sink)?,
                Err(e) => {
                    warn!("stream ended early: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn last_emitted(&self) -> Option<Timestamp> {
        self.last_emitted
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }
}
