// HLS output side
//
// - store:     finalized segments, bounded window, eviction
// - scheduler: the open segment and its rotation
// - playlist:  master/media playlist rendering
// - server:    axum delivery layer

pub mod playlist;
pub mod scheduler;
pub mod server;
pub mod store;

pub use playlist::PlaylistGenerator;
pub use scheduler::{FrameOutcome, OutputLayout, SchedulerError, SegmentScheduler};
pub use server::{HlsServer, HlsState};
pub use store::{segment_file_name, Segment, SegmentStore};
