//! Retrieval engine for a time-series archive of process variables (PVs).
//!
//! Samples live in per-PV partition files spread over storage tiers. A request is
//! resolved against every tier, the partitions are streamed in time order, merged into one
//! strictly increasing sequence, optionally post processed, and written to a [`sink::Sink`].

pub mod cli;
pub mod codec;
pub mod config;
pub mod merge;
pub mod metadata;
pub mod partition;
pub mod postprocess;
pub mod registry;
pub mod retrieval;
pub mod sample;
pub mod sink;
pub mod time;
