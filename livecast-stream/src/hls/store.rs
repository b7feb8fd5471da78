use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::storage::SegmentStorage;

/// File name of segment `id` inside the output root
#[must_use]
pub fn segment_file_name(id: u64) -> String {
    format!("segment_{id}.ts")
}

/// Segment metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Starts at 1, strictly increasing, never reused
    pub id: u64,
    pub path: PathBuf,
    pub started_at: Instant,
    /// Zero while the segment is open
    pub duration: Duration,
}

impl Segment {
    #[must_use]
    pub fn file_name(&self) -> String {
        segment_file_name(self.id)
    }
}

/// Finalized segments in creation order
///
/// The ingest task is the only writer. Readers take a consistent copy under a
/// short read lock, so an append is either fully visible or not at all.
/// Records beyond the `retained` most recent ones are dropped on append and
/// their files deleted through the storage backend.
pub struct SegmentStore {
    segments: RwLock<VecDeque<Segment>>,
    retained: usize,
    storage: Arc<dyn SegmentStorage>,
}

impl SegmentStore {
    pub fn new(retained: usize, storage: Arc<dyn SegmentStorage>) -> Self {
        Self {
            segments: RwLock::new(VecDeque::with_capacity(retained + 1)),
            retained: retained.max(1),
            storage,
        }
    }

    /// Publish a finalized segment, then evict what fell out of retention
    pub async fn append(&self, segment: Segment) {
        let id = segment.id;
        let evicted: Vec<Segment> = {
            let mut segments = self.segments.write();
            debug_assert!(
                segments.back().is_none_or(|last| last.id < id),
                "segment ids must be strictly increasing"
            );
            segments.push_back(segment);
            let excess = segments.len().saturating_sub(self.retained);
            segments.drain(..excess).collect()
        };

        tracing::debug!(segment = id, evicted = evicted.len(), "Published segment");

        // File deletion happens outside the lock
        for old in evicted {
            if let Err(e) = self.storage.delete(&old.file_name()).await {
                tracing::warn!("Failed to delete evicted segment {}: {}", old.id, e);
            }
        }
    }

    /// The `min(n, len)` most recent segments, oldest first
    pub fn window(&self, n: usize) -> Vec<Segment> {
        let segments = self.segments.read();
        let skip = segments.len().saturating_sub(n);
        segments.iter().skip(skip).cloned().collect()
    }

    pub fn find(&self, id: u64) -> Option<Segment> {
        let segments = self.segments.read();
        segments
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|i| segments[i].clone())
    }

    pub fn snapshot(&self) -> Vec<Segment> {
        self.segments.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn SegmentStorage> {
        &self.storage
    }
}
