//! Live segmentation pipeline
//!
//! - `media`: codec/container collaborator traits and the MPEG-TS passthrough backend
//! - `storage`: segment file access
//! - `hls`: segment store, rotation scheduler, playlists and HTTP delivery
//! - `ingest`: the single-task frame loop tying source, scheduler and stats together
//! - `rtsp`: control-protocol session negotiation (no media transport)
//! - `stats`: process-wide frame counters

pub mod hls;
pub mod ingest;
pub mod media;
pub mod rtsp;
pub mod stats;
pub mod storage;

pub use ingest::{IngestPipeline, PipelineError, RunOutcome};
pub use stats::{Stats, StatsSnapshot};
