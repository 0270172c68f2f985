use jiff::{SignedDuration, Timestamp};

use super::RetrievalError;
use crate::time::{TimeSpan, parse_instant};

/// Raw request arguments, as typed by a user
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    pub pv: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// `t0,t1,t2,t3,...` read as ascending `[t0, t1]`, `[t2, t3]` pairs
    pub timeranges: Option<String>,
    pub pp: Option<String>,
    pub use_reduced: bool,
    pub fetch_latest_metadata: bool,
    pub skip_search: bool,
}

/// A validated request
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalRequest {
    pub pv_name: String,
    /// Ascending, non-overlapping
    pub spans: Vec<TimeSpan>,
    pub post_processor: Option<String>,
    pub use_reduced: bool,
    pub fetch_latest_metadata: bool,
    pub skip_search: bool,
}

impl RetrievalRequest {
    pub fn new(pv_name: impl Into<String>, start: Timestamp, end: Timestamp) -> Result<Self, RetrievalError> {
        let span = TimeSpan::new(start, end).ok_or(RetrievalError::EndBeforeStart { start, end })?;
        Ok(Self {
            pv_name: pv_name.into(),
            spans: vec![span],
            post_processor: None,
            use_reduced: false,
            fetch_latest_metadata: false,
            skip_search: false,
        })
    }

    pub fn with_post_processor(mut self, identifier: impl Into<String>) -> Self {
        self.post_processor = Some(identifier.into());
        self
    }

    pub fn start(&self) -> Option<Timestamp> {
        self.spans.first().map(|s| s.start)
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.spans.last().map(|s| s.end)
    }

    /// Without times the window is the day ending an hour from `now`
    pub fn parse(params: &RequestParams, now: Timestamp) -> Result<Self, RetrievalError> {
        let end = match &params.to {
            Some(to) => parse_time(to)?,
            None => shift(now, SignedDuration::from_hours(1))?,
        };
        let start = match &params.from {
            Some(from) => parse_time(from)?,
            None => shift(end, SignedDuration::from_hours(-24))?,
        };
        if end < start {
            return Err(RetrievalError::EndBeforeStart { start, end });
        }

        let spans = match &params.timeranges {
            Some(ranges) => parse_timeranges(ranges)?,
            None => vec![TimeSpan { start, end }],
        };

        let (pv_name, function_pp) = parse_function_call(&params.pv)?;
        let pv_name = pv_name.strip_suffix(".VAL").unwrap_or(&pv_name).to_string();

        Ok(Self {
            pv_name,
            spans,
            post_processor: function_pp.or_else(|| params.pp.clone()),
            use_reduced: params.use_reduced,
            fetch_latest_metadata: params.fetch_latest_metadata,
            skip_search: params.skip_search,
        })
    }
}

fn parse_time(input: &str) -> Result<Timestamp, RetrievalError> {
    parse_instant(input).map_err(|source| RetrievalError::InvalidTime {
        input: input.to_string(),
        source,
    })
}

fn shift(ts: Timestamp, by: SignedDuration) -> Result<Timestamp, RetrievalError> {
    ts.checked_add(by).map_err(|source| RetrievalError::InvalidTime {
        input: format!("{ts} shifted by {by:?}"),
        source,
    })
}

fn parse_timeranges(ranges: &str) -> Result<Vec<TimeSpan>, RetrievalError> {
    let times = ranges
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(parse_time)
        .collect::<Result<Vec<_>, _>>()?;
    if times.is_empty() || times.len() % 2 != 0 {
        return Err(RetrievalError::OddTimeRangeCount(times.len()));
    }

    let mut spans: Vec<TimeSpan> = Vec::with_capacity(times.len() / 2);
    for pair in times.chunks_exact(2) {
        let (start, end) = (pair[0], pair[1]);
        let span = TimeSpan::new(start, end).ok_or(RetrievalError::EndBeforeStart { start, end })?;
        if let Some(previous) = spans.last() {
            if start < previous.end {
                return Err(RetrievalError::AscendingOrderViolation {
                    previous_end: previous.end,
                    start,
                });
            }
        }
        spans.push(span);
    }
    Ok(spans)
}

/// `optimized(ROOM:TEMP,160)` names the PV `ROOM:TEMP` with processor `optimized_160`
fn parse_function_call(pv: &str) -> Result<(String, Option<String>), RetrievalError> {
    if !pv.contains('(') {
        return Ok((pv.to_string(), None));
    }
    if !pv.contains(')') {
        return Err(RetrievalError::UnbalancedParenthesis(pv.to_string()));
    }

    let parts: Vec<&str> = pv
        .split(['(', ',', ')'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [name, pv_name, args @ ..] => {
            let pp = std::iter::once(*name)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join("_");
            Ok((pv_name.to_string(), Some(pp)))
        }
        _ => Err(RetrievalError::UnbalancedParenthesis(pv.to_string())),
    }
}
