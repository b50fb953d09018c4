//! In-memory content store
//!
//! The reference backend for nodes that keep their working set in memory
//! and persist durability through buffer documents and local fallbacks.

use crate::{ContentStore, StoreError, StoreStats, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::debug;

/// An in-memory content store.
///
/// Cloning the handle shares the underlying storage. Puts of identical
/// content are commutative, so no store-wide lock is taken.
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    blocks: Arc<DashMap<Cid, Bytes>>,
    pinned: Arc<DashSet<Cid>>,
}

impl MemoryContentStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(DashMap::new()),
            pinned: Arc::new(DashSet::new()),
        }
    }

    /// Get the number of blocks stored
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// List all CIDs
    pub fn list_cids(&self) -> Vec<Cid> {
        self.blocks.iter().map(|entry| *entry.key()).collect()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put_block(&self, data: &[u8]) -> Result<Cid> {
        let cid = crate::cid_utils::create_cid(data, crate::cid_utils::CidCodec::Raw);
        // Identical content maps to an identical id; a second put is a no-op.
        self.blocks
            .entry(cid)
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn get_block(&self, cid: &Cid) -> Result<Bytes> {
        self.blocks
            .get(cid)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(*cid))
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.contains_key(cid))
    }

    async fn block_size(&self, cid: &Cid) -> Result<u64> {
        self.blocks
            .get(cid)
            .map(|entry| entry.value().len() as u64)
            .ok_or(StoreError::NotFound(*cid))
    }

    async fn put_json<T: serde::Serialize + Send + Sync>(&self, data: &T) -> Result<Cid> {
        let bytes = crate::cid_utils::canonical_json(data)?;
        let cid = crate::cid_utils::create_cid(&bytes, crate::cid_utils::CidCodec::DagJson);
        self.blocks.entry(cid).or_insert_with(|| Bytes::from(bytes));
        debug!(%cid, "stored document");
        Ok(cid)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, cid: &Cid) -> Result<T> {
        let bytes = self.get_block(cid).await?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    async fn pin(&self, cid: &Cid) -> Result<()> {
        if !self.blocks.contains_key(cid) {
            return Err(StoreError::NotFound(*cid));
        }
        self.pinned.insert(*cid);
        Ok(())
    }

    async fn unpin(&self, cid: &Cid) -> Result<()> {
        self.pinned.remove(cid);
        Ok(())
    }

    async fn is_pinned(&self, cid: &Cid) -> Result<bool> {
        Ok(self.pinned.contains(cid))
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            blocks: self.blocks.len(),
            total_bytes: self
                .blocks
                .iter()
                .map(|entry| entry.value().len() as u64)
                .sum(),
            pinned: self.pinned.len(),
        })
    }
}
