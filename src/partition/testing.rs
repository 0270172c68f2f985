//! Partition fixtures shared by tests

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use jiff::{SignedDuration, Timestamp};

use super::{PartitionId, Tier};
use crate::{
    codec::{self, FORMAT_VERSION},
    sample::{PartitionHeader, PayloadType, Sample, SampleValue},
    time::year_of,
};

/// `count` int samples `step_ms` apart, value = index
pub(crate) fn int_samples(start: Timestamp, step_ms: i64, count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| {
            let ts = start
                .checked_add(SignedDuration::from_millis(step_ms * i as i64))
                .unwrap();
            Sample::new(ts, SampleValue::Int(i as i32))
        })
        .collect()
}

pub(crate) fn header(pv: &str, ty: PayloadType, year: i16) -> PartitionHeader {
    PartitionHeader {
        version: FORMAT_VERSION,
        pv_name: pv.to_string(),
        year,
        payload_type: ty,
        element_count: 1,
        headers: BTreeMap::new(),
    }
}

pub(crate) fn write_file(path: &Path, pv: &str, ty: PayloadType, samples: &[Sample]) -> PathBuf {
    let year = samples.first().map(|s| year_of(s.timestamp)).unwrap_or(2024);
    let bytes = codec::encode_partition(&header(pv, ty, year), samples).unwrap();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

/// Splits `samples` into the tier's buckets and writes one file per bucket
pub(crate) fn write_partitions(tier: &Tier, pv: &str, ty: PayloadType, samples: &[Sample]) {
    let mut buckets: Vec<(PartitionId, Vec<Sample>)> = Vec::new();
    for s in samples {
        let id = PartitionId::for_instant(pv, s.timestamp, tier.granularity).unwrap();
        match buckets.last_mut() {
            Some((last, group)) if *last == id => group.push(s.clone()),
            _ => buckets.push((id, vec![s.clone()])),
        }
    }
    for (id, group) in buckets {
        write_file(&tier.root.join(id.relative_path()), pv, ty, &group);
    }
}
