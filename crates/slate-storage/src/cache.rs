use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slate_agent_protocol::ImageMediaType;
use tokio::sync::RwLock;

/// Checksum placeholder recorded until a background job computes the real one.
pub const CHECKSUM_NOT_CALCULATED: &str = "not calculated";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheState {
    Ready,
}

/// A template image staged on a specific storage backend. At most one entry
/// exists per (backend, image) pair; a re-download overwrites `install_url`
/// in place rather than creating a second record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub backend_uuid: String,
    pub image_uuid: String,
    pub install_url: String,
    pub media_type: ImageMediaType,
    pub size: u64,
    pub md5sum: String,
    pub state: CacheState,
    pub created_at: DateTime<Utc>,
}

/// Source of truth for "is this image already staged on this backend".
/// Real deployments back this with the inventory database; the in-memory
/// implementation below serves tests and single-process setups.
#[async_trait]
pub trait ImageCacheRegistry: Send + Sync {
    async fn find(
        &self,
        backend_uuid: &str,
        image_uuid: &str,
    ) -> anyhow::Result<Option<CacheEntry>>;

    async fn upsert(&self, entry: CacheEntry) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryImageCacheRegistry {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl MemoryImageCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ImageCacheRegistry for MemoryImageCacheRegistry {
    async fn find(
        &self,
        backend_uuid: &str,
        image_uuid: &str,
    ) -> anyhow::Result<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(backend_uuid.to_string(), image_uuid.to_string()))
            .cloned())
    }

    async fn upsert(&self, entry: CacheEntry) -> anyhow::Result<()> {
        let key = (entry.backend_uuid.clone(), entry.image_uuid.clone());
        self.entries.write().await.insert(key, entry);
        Ok(())
    }
}
