use super::{PostProcessor, PostProcessorError, split_identifier};
use crate::{sample::Sample, time::epoch_parts};

pub const NAME: &str = "firstsample";
pub const DEFAULT_INTERVAL_SECS: i64 = 900;

/// Keeps the first sample of every interval, intervals aligned to the epoch
#[derive(Debug)]
pub struct FirstSample {
    interval_secs: i64,
    last_bin: Option<i64>,
}

impl Default for FirstSample {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            last_bin: None,
        }
    }
}

impl PostProcessor for FirstSample {
    fn identity(&self) -> String {
        format!("firstSample_{}", self.interval_secs)
    }

    fn initialize(&mut self, identifier: &str, _pv_name: &str) -> Result<(), PostProcessorError> {
        let (name, param) = split_identifier(identifier);
        if let Some(param) = param {
            self.interval_secs = param
                .parse::<i64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| PostProcessorError::InvalidParameter {
                    name,
                    param: param.to_string(),
                })?;
        }
        Ok(())
    }

    fn transform(&mut self, sample: Sample) -> Option<Sample> {
        let (secs, _) = epoch_parts(sample.timestamp);
        let bin = secs.div_euclid(self.interval_secs);
        // older bins come from overlapping tiers and are dropped downstream anyway
        if self.last_bin.is_some_and(|last| bin <= last) {
            return None;
        }
        self.last_bin = Some(bin);
        Some(sample)
    }
}
