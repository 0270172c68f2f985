use std::collections::BTreeMap;

use jiff::Timestamp;

use super::{
    Capabilities, PostProcessor, PostProcessorError, estimate_raw_bytes, estimate_sample_count,
    split_identifier, stats::BinStats,
};
use crate::{
    registry::TypeInfo,
    sample::{PayloadType, Sample, SampleValue, StreamDescriptor},
    time::epoch_parts,
};

pub const NAME: &str = "optimized";

/// Reduces a request to about `N` points.
///
/// The window is cut into bins of `ceil(duration / N)` seconds, aligned to multiples of
/// the bin width since the epoch. Each non-empty bin becomes one sample stamped with the
/// first timestamp seen in it, valued `[mean, std dev, min, max, count]`. When the raw
/// sequence has at most `N` samples it is returned unchanged instead.
#[derive(Debug, Default)]
pub struct Optimized {
    num_points: u64,
    bin_width_secs: i64,
    /// bin index of the request start on the epoch aligned grid
    first_bin: i64,
    bins: BTreeMap<i64, (Timestamp, BinStats)>,
    /// raw samples, dropped once there are more than `num_points`
    raw: Option<Vec<Sample>>,
    raw_count: u64,
}

impl Optimized {
    fn bin_of(&self, ts: Timestamp) -> i64 {
        let (secs, _) = epoch_parts(ts);
        secs.div_euclid(self.bin_width_secs.max(1)) - self.first_bin
    }

    fn passes_through(&self) -> bool {
        self.raw_count <= self.num_points
    }

    /// Folds another instance's bins into this one, for aggregates built separately
    pub fn merge(&mut self, other: Optimized) {
        for (bin, (ts, stats)) in other.bins {
            match self.bins.get_mut(&bin) {
                Some((first_ts, existing)) if ts < *first_ts => {
                    let mut earlier = stats;
                    earlier.merge(existing);
                    *existing = earlier;
                    *first_ts = ts;
                }
                Some((_, existing)) => existing.merge(&stats),
                None => {
                    self.bins.insert(bin, (ts, stats));
                }
            }
        }
        self.raw_count += other.raw_count;
        self.raw = match (self.raw.take(), other.raw) {
            (Some(mut a), Some(b)) if self.raw_count <= self.num_points => {
                a.extend(b);
                a.sort_by_key(|s| s.timestamp);
                Some(a)
            }
            _ => None,
        };
    }
}

impl PostProcessor for Optimized {
    fn identity(&self) -> String {
        format!("{NAME}_{}", self.num_points)
    }

    fn initialize(&mut self, identifier: &str, _pv_name: &str) -> Result<(), PostProcessorError> {
        let (name, param) = split_identifier(identifier);
        let param = param.ok_or_else(|| PostProcessorError::MissingParameter(identifier.to_string()))?;
        self.num_points = param
            .parse::<u64>()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| PostProcessorError::InvalidParameter {
                name,
                param: param.to_string(),
            })?;
        self.bin_width_secs = 1;
        self.raw = Some(Vec::new());
        Ok(())
    }

    fn set_window(&mut self, start: Timestamp, end: Timestamp) {
        let duration = (end.as_second() - start.as_second()).max(0) as u64;
        let width = duration.div_ceil(self.num_points.max(1)).max(1);
        self.bin_width_secs = i64::try_from(width).unwrap_or(i64::MAX);
        self.first_bin = epoch_parts(start).0.div_euclid(self.bin_width_secs);
    }

    fn estimate_memory_consumption(
        &self,
        _pv_name: &str,
        type_info: &TypeInfo,
        start: Timestamp,
        end: Timestamp,
    ) -> u64 {
        // raw buffer until it exceeds N, then one aggregate per bin
        let raw = estimate_raw_bytes(type_info, start, end);
        let samples = estimate_sample_count(type_info, start, end).max(1);
        let buffered = raw / samples * samples.min(self.num_points);
        let bins = (self.num_points + 1) * std::mem::size_of::<(i64, Timestamp, BinStats)>() as u64;
        buffered + bins
    }

    fn describe(&self, source: &StreamDescriptor) -> StreamDescriptor {
        if self.passes_through() {
            return source.clone();
        }
        StreamDescriptor {
            payload_type: PayloadType::WaveformDouble,
            element_count: 5,
            ..source.clone()
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            consolidated: true,
            ..Default::default()
        }
    }

    fn consume(&mut self, sample: &Sample) {
        self.raw_count += 1;
        if self.passes_through() {
            if let Some(raw) = self.raw.as_mut() {
                raw.push(sample.clone());
            }
        } else {
            self.raw = None;
        }

        let Some(value) = sample.value.as_f64() else {
            return;
        };
        let bin = self.bin_of(sample.timestamp);
        self.bins
            .entry(bin)
            .and_modify(|(_, stats)| stats.observe(value))
            .or_insert((sample.timestamp, BinStats::new(value)));
    }

    fn consolidated_stream(&mut self) -> Vec<Sample> {
        if self.passes_through() {
            return self.raw.take().unwrap_or_default();
        }
        std::mem::take(&mut self.bins)
            .into_values()
            .map(|(ts, stats)| Sample::new(ts, SampleValue::DoubleVec(stats.summary())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        partition::{Granularity, Tier},
        time::parse_instant,
    };

    fn type_info() -> TypeInfo {
        TypeInfo {
            pv_name: "Test".into(),
            payload_type: PayloadType::ScalarDouble,
            element_count: 1,
            sampling_period_secs: 60.0,
            tiers: vec![Tier {
                name: "sts".into(),
                root: "/tmp".into(),
                granularity: Granularity::Hour,
                extent: None,
            }],
            metadata: Default::default(),
        }
    }

    /// a day of one minute samples from 10:00, value = minute index
    fn day() -> Vec<Sample> {
        let start = parse_instant("2024-06-01T10:00:00Z").unwrap();
        (0..1440)
            .map(|i| {
                let ts = Timestamp::from_second(start.as_second() + i * 60).unwrap();
                Sample::new(ts, SampleValue::Int(i as i32))
            })
            .collect()
    }

    fn run(identifier: &str, start: &str, end: &str) -> (Optimized, Vec<Sample>) {
        let mut pp = Optimized::default();
        pp.initialize(identifier, "Test").unwrap();
        pp.set_window(parse_instant(start).unwrap(), parse_instant(end).unwrap());
        day().iter().for_each(|s| pp.consume(s));
        let out = pp.consolidated_stream();
        (pp, out)
    }

    #[test]
    fn test_fewer_points_than_requested() {
        let (pp, out) = run("optimized_10000", "2024-06-01T10:00:00Z", "2024-06-02T09:59:59.999Z");
        assert_eq!(out, day());
        let source = StreamDescriptor {
            pv_name: "Test".into(),
            payload_type: PayloadType::ScalarInt,
            element_count: 1,
            year: 2024,
            source: "test".into(),
            headers: Default::default(),
        };
        assert_eq!(pp.describe(&source), source);
    }

    #[test]
    fn test_more_points_than_requested() {
        let (pp, out) = run("optimized_160", "2024-06-01T10:00:00Z", "2024-06-02T10:00:00Z");
        assert_eq!(pp.bin_width_secs, 540);
        assert_eq!(out.len(), 161);

        let sd = 7.5f64.sqrt();
        for (k, s) in out.iter().enumerate().skip(1).take(159) {
            let SampleValue::DoubleVec(v) = &s.value else {
                panic!("bin {k} is not a vector");
            };
            let low = ((k - 1) * 9 + 3) as f64;
            assert_eq!(v.len(), 5);
            assert_eq!(v[0], low + 4.0, "mean of bin {k}");
            assert!((v[1] - sd).abs() < 1e-9, "std dev of bin {k}");
            assert_eq!((v[2], v[3], v[4]), (low, low + 8.0, 9.0));
        }
        for pair in out.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }

        // partial edge bins
        let SampleValue::DoubleVec(first) = &out[0].value else {
            panic!()
        };
        assert_eq!((first[2], first[3], first[4]), (0.0, 2.0, 3.0));
        let SampleValue::DoubleVec(last) = &out[160].value else {
            panic!()
        };
        assert_eq!((last[2], last[3], last[4]), (1434.0, 1439.0, 6.0));

        assert_eq!(pp.describe(&day_descriptor()).payload_type, PayloadType::WaveformDouble);
    }

    fn day_descriptor() -> StreamDescriptor {
        StreamDescriptor {
            pv_name: "Test".into(),
            payload_type: PayloadType::ScalarInt,
            element_count: 1,
            year: 2024,
            source: "test".into(),
            headers: Default::default(),
        }
    }

    #[test]
    fn test_merge_split_halves() {
        let start = parse_instant("2024-06-01T10:00:00Z").unwrap();
        let end = parse_instant("2024-06-02T10:00:00Z").unwrap();
        let setup = || {
            let mut pp = Optimized::default();
            pp.initialize("optimized_160", "Test").unwrap();
            pp.set_window(start, end);
            pp
        };
        let samples = day();
        let (mut a, mut b) = (setup(), setup());
        // split mid bin
        samples[..700].iter().for_each(|s| a.consume(s));
        samples[700..].iter().for_each(|s| b.consume(s));
        a.merge(b);

        let (_, whole) = run("optimized_160", "2024-06-01T10:00:00Z", "2024-06-02T10:00:00Z");
        let merged = a.consolidated_stream();
        assert_eq!(merged.len(), whole.len());
        for (m, w) in merged.iter().zip(&whole) {
            assert_eq!(m.timestamp, w.timestamp);
            let (SampleValue::DoubleVec(m), SampleValue::DoubleVec(w)) = (&m.value, &w.value) else {
                panic!()
            };
            assert!(m.iter().zip(w).all(|(x, y)| (x - y).abs() < 1e-9));
        }
    }

    #[test]
    fn test_estimate_leaves_bins_alone() {
        let start = parse_instant("2024-06-01T10:00:00Z").unwrap();
        let end = parse_instant("2024-06-02T10:00:00Z").unwrap();
        let mut pp = Optimized::default();
        pp.initialize("optimized_160", "Test").unwrap();

        let estimate = pp.estimate_memory_consumption("Test", &type_info(), start, end);
        assert!(estimate > 0);
        assert_eq!(pp.bin_width_secs, 1);

        pp.set_window(start, end);
        assert_eq!(pp.bin_width_secs, 540);
        assert_eq!(pp.estimate_memory_consumption("Test", &type_info(), start, end), estimate);
    }

    #[test]
    fn test_requires_parameter() {
        let mut pp = Optimized::default();
        assert_eq!(
            pp.initialize("optimized", "Test"),
            Err(PostProcessorError::MissingParameter("optimized".into()))
        );
        assert!(pp.initialize("optimized_x", "Test").is_err());
        assert!(pp.initialize("optimized_5", "Test").is_ok());
    }
}
