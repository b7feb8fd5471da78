// Segment storage abstraction
//
// The sink writes segment files straight into the output root; this layer is
// what the rest of the system uses to read and delete them by key. Keys are
// bare file names (`segment_{id}.ts`), never paths.

pub mod file;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Result;

/// Key-value access to finalized segment files
///
/// Knows nothing about segment ids, windows or playlists; the segment store
/// decides what to keep and calls `delete` on eviction.
#[async_trait]
pub trait SegmentStorage: Send + Sync {
    /// Binary data or a `NotFound` error
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// `segment_{id}.ts` with a decimal id
#[must_use]
pub fn is_segment_file_name(name: &str) -> bool {
    name.strip_prefix("segment_")
        .and_then(|rest| rest.strip_suffix(".ts"))
        .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

pub use file::FileStorage;
#[cfg(test)]
pub use memory::MemoryStorage;
