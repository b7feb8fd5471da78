// In-memory storage backend for tests
//
// Lets the scheduler, store and playlist be exercised without touching disk.

use super::SegmentStorage;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, data: Bytes) {
        self.data.lock().insert(key.to_string(), data);
    }

    /// Stored keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl SegmentStorage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Bytes> {
        self.data
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("Key not found: {key}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();

        storage.insert("segment_1.ts", Bytes::from_static(b"one"));
        assert_eq!(storage.read("segment_1.ts").await.unwrap(), "one");
        assert_eq!(storage.keys(), vec!["segment_1.ts".to_string()]);

        storage.delete("segment_1.ts").await.unwrap();
        assert!(storage.keys().is_empty());

        let err = storage.read("segment_1.ts").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();
        clone.insert("segment_2.ts", Bytes::from_static(b"two"));
        assert_eq!(storage.read("segment_2.ts").await.unwrap(), "two");
    }
}
