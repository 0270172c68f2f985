//! Partition identity is computed, never searched.
//!
//! ```txt
//! {tier root}/
//!   {key}/{suffix}.pb
//! ```
//!
//! Where `{key}` is the PV name's UTF-8 bytes in URL-safe unpadded base64 (filename safe
//! and reversible) and `{suffix}` is the bucket start in UTC, `_` joined down to the
//! granularity's finest unit: `YYYY`, `YYYY_MM`, `YYYY_MM_DD`, `YYYY_MM_DD_HH` or
//! `YYYY_MM_DD_HH_mm`.

use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jiff::{SignedDuration, Timestamp, ToSpan, civil::DateTime, tz::TimeZone};
use serde::{Deserialize, Serialize};

use super::error::PartitionError;
use crate::time::TimeSpan;

pub const EXTENSION: &str = "pb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    fn minutes_per_bucket(self) -> Option<i8> {
        match self {
            Self::FiveMinutes => Some(5),
            Self::FifteenMinutes => Some(15),
            Self::ThirtyMinutes => Some(30),
            _ => None,
        }
    }

    /// Number of `_` separated parts in the path suffix
    fn suffix_parts(self) -> usize {
        match self {
            Self::Year => 1,
            Self::Month => 2,
            Self::Day => 3,
            Self::Hour => 4,
            Self::FiveMinutes | Self::FifteenMinutes | Self::ThirtyMinutes => 5,
        }
    }

    fn truncate(self, dt: DateTime) -> Result<DateTime, jiff::Error> {
        let (y, mo, d, h, mi) = (dt.year(), dt.month(), dt.day(), dt.hour(), dt.minute());
        match self {
            Self::Year => DateTime::new(y, 1, 1, 0, 0, 0, 0),
            Self::Month => DateTime::new(y, mo, 1, 0, 0, 0, 0),
            Self::Day => DateTime::new(y, mo, d, 0, 0, 0, 0),
            Self::Hour => DateTime::new(y, mo, d, h, 0, 0, 0),
            g => {
                let step = g.minutes_per_bucket().unwrap_or(1);
                DateTime::new(y, mo, d, h, mi - mi % step, 0, 0)
            }
        }
    }

    fn advance(self, dt: DateTime) -> Result<DateTime, jiff::Error> {
        match self {
            Self::Year => dt.checked_add(1.year()),
            Self::Month => dt.checked_add(1.month()),
            Self::Day => dt.checked_add(1.day()),
            Self::Hour => dt.checked_add(1.hour()),
            g => dt.checked_add(g.minutes_per_bucket().unwrap_or(1).minutes()),
        }
    }

    fn suffix(self, dt: DateTime) -> String {
        let (y, mo, d, h, mi) = (dt.year(), dt.month(), dt.day(), dt.hour(), dt.minute());
        match self {
            Self::Year => format!("{y:04}"),
            Self::Month => format!("{y:04}_{mo:02}"),
            Self::Day => format!("{y:04}_{mo:02}_{d:02}"),
            Self::Hour => format!("{y:04}_{mo:02}_{d:02}_{h:02}"),
            _ => format!("{y:04}_{mo:02}_{d:02}_{h:02}_{mi:02}"),
        }
    }

    fn parse_suffix(self, suffix: &str) -> Option<DateTime> {
        let parts = suffix
            .split('_')
            .map(|p| p.parse::<i16>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.len() != self.suffix_parts() {
            return None;
        }
        let part = |i: usize, default: i16| parts.get(i).copied().unwrap_or(default);
        let dt = DateTime::new(
            part(0, 1970),
            i8::try_from(part(1, 1)).ok()?,
            i8::try_from(part(2, 1)).ok()?,
            i8::try_from(part(3, 0)).ok()?,
            i8::try_from(part(4, 0)).ok()?,
            0,
            0,
        )
        .ok()?;
        // must already be a bucket start
        (self.truncate(dt).ok()? == dt).then_some(dt)
    }
}

pub fn key_for_pv_name(pv_name: &str) -> String {
    URL_SAFE_NO_PAD.encode(pv_name.as_bytes())
}

pub fn pv_name_from_key(key: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(key).ok()?;
    String::from_utf8(bytes).ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionId {
    pub pv_name: String,
    pub granularity: Granularity,
    bucket: DateTime,
}

impl PartitionId {
    /// Bucket holding `instant` (UTC)
    pub fn for_instant(
        pv_name: &str,
        instant: Timestamp,
        granularity: Granularity,
    ) -> Result<Self, PartitionError> {
        let dt = instant.to_zoned(TimeZone::UTC).datetime();
        Ok(Self {
            pv_name: pv_name.to_string(),
            granularity,
            bucket: granularity.truncate(dt)?,
        })
    }

    /// Every bucket overlapping `span`, in time order
    pub fn covering(
        pv_name: &str,
        span: &TimeSpan,
        granularity: Granularity,
    ) -> Result<Vec<Self>, PartitionError> {
        let mut ids = Vec::new();
        let mut id = Self::for_instant(pv_name, span.start, granularity)?;
        while id.bucket_start()? <= span.end {
            let next = id.next()?;
            ids.push(id);
            id = next;
        }
        Ok(ids)
    }

    pub fn next(&self) -> Result<Self, PartitionError> {
        Ok(Self {
            pv_name: self.pv_name.clone(),
            granularity: self.granularity,
            bucket: self.granularity.advance(self.bucket)?,
        })
    }

    /// Bucket just before this one
    pub fn previous(&self) -> Result<Self, PartitionError> {
        let before = self.bucket_start()?.checked_sub(SignedDuration::from_nanos(1))?;
        Self::for_instant(&self.pv_name, before, self.granularity)
    }

    pub fn bucket_start(&self) -> Result<Timestamp, PartitionError> {
        Ok(self.bucket.to_zoned(TimeZone::UTC)?.timestamp())
    }

    pub fn year(&self) -> i16 {
        self.bucket.year()
    }

    pub fn key(&self) -> String {
        key_for_pv_name(&self.pv_name)
    }

    pub fn relative_path(&self) -> PathBuf {
        let file = format!("{}.{EXTENSION}", self.granularity.suffix(self.bucket));
        PathBuf::from(self.key()).join(file)
    }

    /// Reverse of [`Self::relative_path`]. The granularity comes from the tier since the
    /// minute buckets share a suffix shape.
    pub fn from_relative_path(path: &Path, granularity: Granularity) -> Result<Self, PartitionError> {
        let invalid = || PartitionError::InvalidPath(path.to_path_buf());

        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            return Err(invalid());
        }
        let suffix = path.file_stem().and_then(|s| s.to_str()).ok_or_else(invalid)?;
        let key = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|k| k.to_str())
            .ok_or_else(invalid)?;

        Ok(Self {
            pv_name: pv_name_from_key(key).ok_or_else(invalid)?,
            granularity,
            bucket: granularity.parse_suffix(suffix).ok_or_else(invalid)?,
        })
    }
}

/// One storage tier (ie. short term on local disk, long term on a NAS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    pub root: PathBuf,
    pub granularity: Granularity,
    /// Time range this tier holds data for, unbounded when missing
    #[serde(default)]
    pub extent: Option<TimeSpan>,
}

impl Tier {
    /// Absent file is `None`, not an error
    pub fn resolve(&self, id: &PartitionId) -> Option<PathBuf> {
        let path = self.root.join(id.relative_path());
        path.is_file().then_some(path)
    }

    pub fn covering(&self, pv_name: &str, span: &TimeSpan) -> Result<Vec<PartitionId>, PartitionError> {
        PartitionId::covering(pv_name, span, self.granularity)
    }
}
