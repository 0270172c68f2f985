use std::path::PathBuf;

use thiserror::Error;

use crate::{codec::CodecError, sample::PayloadType};

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time error: {0}")]
    Time(#[from] jiff::Error),
    #[error("'{0}' is not a partition path")]
    InvalidPath(PathBuf),
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt frame at byte {offset}: {source}")]
    Codec { offset: u64, source: CodecError },
    #[error("partition holds {found:?} but {declared:?} was declared")]
    TypeMismatch {
        declared: PayloadType,
        found: PayloadType,
    },
}

impl StreamError {
    pub fn is_corrupt_frame(&self) -> bool {
        matches!(self, Self::Codec { .. })
    }
}
