use jiff::Timestamp;
use thiserror::Error;

use crate::{postprocess::PostProcessorError, sink::SinkError};

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("no type info for PV '{0}'")]
    UnknownPv(String),
    #[error("end {end} is before start {start}")]
    EndBeforeStart { start: Timestamp, end: Timestamp },
    #[error("time range starting {start} begins before the previous one ends at {previous_end}")]
    AscendingOrderViolation {
        previous_end: Timestamp,
        start: Timestamp,
    },
    #[error("timeranges needs start/end pairs, got {0} values")]
    OddTimeRangeCount(usize),
    #[error("invalid time '{input}': {source}")]
    InvalidTime { input: String, source: jiff::Error },
    #[error("unbalanced parenthesis in '{0}'")]
    UnbalancedParenthesis(String),
    #[error("post processor error: {0}")]
    PostProcessor(#[from] PostProcessorError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
