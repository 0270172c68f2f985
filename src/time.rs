use jiff::{Timestamp, civil::Date, tz::TimeZone};
use serde::{Deserialize, Serialize};

/// Epoch second of Jan 1st 00:00:00 UTC of `year`
pub fn year_start_second(year: i16) -> Result<i64, jiff::Error> {
    Ok(Date::new(year, 1, 1)?
        .to_zoned(TimeZone::UTC)?
        .timestamp()
        .as_second())
}

/// Whole seconds (floored) and the non-negative nanosecond remainder
pub fn epoch_parts(ts: Timestamp) -> (i64, u32) {
    let (secs, nanos) = (ts.as_second(), ts.subsec_nanosecond());
    if nanos < 0 {
        (secs - 1, (nanos + 1_000_000_000) as u32)
    } else {
        (secs, nanos as u32)
    }
}

pub fn year_of(ts: Timestamp) -> i16 {
    ts.to_zoned(TimeZone::UTC).year()
}

/// Accepts ISO8601 / RFC3339 instants, either `Z` or with an explicit offset.
pub fn parse_instant(s: &str) -> Result<Timestamp, jiff::Error> {
    s.trim().parse()
}

/// Closed interval of instants, `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeSpan {
    pub fn new(start: Timestamp, end: Timestamp) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Intersection with `extent`, `None` when they don't overlap
    pub fn clip(&self, extent: &TimeSpan) -> Option<TimeSpan> {
        TimeSpan::new(self.start.max(extent.start), self.end.min(extent.end))
    }

    pub fn duration_seconds(&self) -> i64 {
        self.end.as_second() - self.start.as_second()
    }
}

impl std::fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        parse_instant(s).unwrap()
    }

    #[test]
    fn test_year_start() {
        assert_eq!(year_start_second(1970).unwrap(), 0);
        assert_eq!(
            year_start_second(2024).unwrap(),
            ts("2024-01-01T00:00:00Z").as_second()
        );
        assert_eq!(year_of(ts("2023-12-31T23:59:59.999Z")), 2023);
    }

    #[test]
    fn test_epoch_parts_before_1970() {
        assert_eq!(epoch_parts(ts("1969-12-31T23:59:58.5Z")), (-2, 500_000_000));
        assert_eq!(epoch_parts(ts("1970-01-01T00:00:01.25Z")), (1, 250_000_000));
    }

    #[test]
    fn test_parse_with_offset() {
        assert_eq!(
            ts("2011-02-02T08:00:00.000-08:00"),
            ts("2011-02-02T16:00:00.000Z")
        );
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn test_clip() {
        let span = TimeSpan::new(ts("2024-01-01T00:00:00Z"), ts("2024-03-01T00:00:00Z")).unwrap();
        let extent = TimeSpan::new(ts("2024-02-01T00:00:00Z"), ts("2025-01-01T00:00:00Z")).unwrap();
        let clipped = span.clip(&extent).unwrap();
        assert_eq!(clipped.start, extent.start);
        assert_eq!(clipped.end, span.end);

        let later = TimeSpan::new(ts("2024-04-01T00:00:00Z"), ts("2024-05-01T00:00:00Z")).unwrap();
        assert!(span.clip(&later).is_none());
        assert!(TimeSpan::new(later.end, later.start).is_none());
    }
}
