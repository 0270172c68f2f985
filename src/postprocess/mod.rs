//! Post processors reduce or reshape the merged sample sequence of a request.
//!
//! Identifiers are `name` or `name_parameter` (ie. `optimized_160`, `firstSample_3600`),
//! names are case-insensitive and unknown names fall back to [`Raw`].

use jiff::Timestamp;

use crate::{
    partition::StreamError,
    registry::TypeInfo,
    sample::{PayloadType, Sample, StreamDescriptor},
};

pub mod error;
pub mod extra_fields;
pub mod first_sample;
pub mod last_fill;
pub mod optimized;
pub mod raw;
pub mod stats;

pub use error::PostProcessorError;
pub use extra_fields::ExtraFields;
pub use first_sample::FirstSample;
pub use last_fill::LastFill;
pub use optimized::Optimized;
pub use raw::Raw;

/// Optional behaviours, read once when a request takes the processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Sees the whole deduplicated sequence through [`PostProcessor::consume`] and
    /// emits through [`PostProcessor::consolidated_stream`]
    pub consolidated: bool,
    /// Has a [`PostProcessor::final_sample`] to send after all streams
    pub final_data: bool,
    /// Serves a PV field rather than the main value
    pub extra_field: bool,
}

pub trait PostProcessor: Send {
    /// Canonical identifier, parameter included
    fn identity(&self) -> String;

    /// `identifier` is the full user argument, ie. `optimized_160`
    fn initialize(&mut self, identifier: &str, pv_name: &str) -> Result<(), PostProcessorError>;

    /// The whole request range, set before any sample is seen
    fn set_window(&mut self, start: Timestamp, end: Timestamp) {
        let _ = (start, end);
    }

    /// Bytes this processor will hold for the request
    fn estimate_memory_consumption(
        &self,
        pv_name: &str,
        type_info: &TypeInfo,
        start: Timestamp,
        end: Timestamp,
    ) -> u64 {
        let _ = pv_name;
        estimate_raw_bytes(type_info, start, end)
    }

    /// Per sample filter-map applied to every stream
    fn transform(&mut self, sample: Sample) -> Option<Sample> {
        Some(sample)
    }

    /// Descriptor of what this processor emits for `source`
    fn describe(&self, source: &StreamDescriptor) -> StreamDescriptor {
        source.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn consume(&mut self, sample: &Sample) {
        let _ = sample;
    }

    fn consolidated_stream(&mut self) -> Vec<Sample> {
        Vec::new()
    }

    fn final_sample(&mut self) -> Option<Sample> {
        None
    }
}

/// Splits `name_parameter`, the name lowercased
pub fn split_identifier(identifier: &str) -> (String, Option<&str>) {
    match identifier.split_once('_') {
        Some((name, param)) => (name.to_ascii_lowercase(), Some(param)),
        None => (identifier.to_ascii_lowercase(), None),
    }
}

/// Builds and initializes the processor named by `identifier`
pub fn find_post_processor(
    identifier: &str,
    pv_name: &str,
) -> Result<Box<dyn PostProcessor>, PostProcessorError> {
    let (name, _) = split_identifier(identifier);
    let mut pp: Box<dyn PostProcessor> = match name.as_str() {
        optimized::NAME => Box::new(Optimized::default()),
        first_sample::NAME => Box::new(FirstSample::default()),
        last_fill::NAME => Box::new(LastFill::default()),
        _ => Box::new(Raw),
    };
    pp.initialize(identifier, pv_name)?;
    Ok(pp)
}

/// Applies `pp`'s per sample transform to a stream
pub fn wrap<'a, I>(
    pp: &'a mut dyn PostProcessor,
    stream: I,
) -> impl Iterator<Item = Result<Sample, StreamError>> + 'a
where
    I: IntoIterator<Item = Result<Sample, StreamError>>,
    I::IntoIter: 'a,
{
    stream.into_iter().filter_map(move |item| match item {
        Ok(sample) => pp.transform(sample).map(Ok),
        Err(e) => Some(Err(e)),
    })
}

fn element_size(ty: PayloadType) -> u64 {
    use PayloadType as P;
    match ty {
        P::ScalarByte | P::WaveformByte => 1,
        P::ScalarShort | P::ScalarEnum | P::WaveformShort | P::WaveformEnum => 2,
        P::ScalarFloat | P::ScalarInt | P::WaveformFloat | P::WaveformInt => 4,
        P::ScalarDouble | P::WaveformDouble => 8,
        // guess, strings are rarely long
        P::ScalarString | P::WaveformString => 40,
    }
}

/// Expected sample count in `[start, end]` given the PV's sampling period
pub fn estimate_sample_count(type_info: &TypeInfo, start: Timestamp, end: Timestamp) -> u64 {
    let seconds = (end.as_second() - start.as_second()).max(0) as f64;
    let period = type_info.sampling_period_secs.max(0.001);
    (seconds / period).ceil() as u64 + 1
}

/// Size of every raw sample in `[start, end]` held in memory at once
pub fn estimate_raw_bytes(type_info: &TypeInfo, start: Timestamp, end: Timestamp) -> u64 {
    let per_sample = std::mem::size_of::<Sample>() as u64
        + element_size(type_info.payload_type) * type_info.element_count.max(1) as u64;
    estimate_sample_count(type_info, start, end).saturating_mul(per_sample)
}
