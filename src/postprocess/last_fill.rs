use jiff::Timestamp;

use super::{Capabilities, PostProcessor, PostProcessorError};
use crate::sample::Sample;

pub const NAME: &str = "lastfill";

/// Pass-through that repeats the newest value at the request end, so a plot reaches
/// the edge of the window
#[derive(Debug, Default)]
pub struct LastFill {
    end: Option<Timestamp>,
    newest: Option<Sample>,
}

impl PostProcessor for LastFill {
    fn identity(&self) -> String {
        "lastFill".to_string()
    }

    fn initialize(&mut self, _identifier: &str, _pv_name: &str) -> Result<(), PostProcessorError> {
        Ok(())
    }

    fn set_window(&mut self, _start: Timestamp, end: Timestamp) {
        self.end = Some(end);
    }

    fn transform(&mut self, sample: Sample) -> Option<Sample> {
        if self
            .newest
            .as_ref()
            .is_none_or(|newest| sample.timestamp > newest.timestamp)
        {
            self.newest = Some(sample.clone());
        }
        Some(sample)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            final_data: true,
            ..Default::default()
        }
    }

    fn final_sample(&mut self) -> Option<Sample> {
        let end = self.end?;
        let mut sample = self.newest.take()?;
        if sample.timestamp >= end {
            return None;
        }
        sample.timestamp = end;
        Some(sample)
    }
}
