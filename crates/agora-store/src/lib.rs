//! # Agora Store
//!
//! Content-addressed blob storage for the Agora decentralized election
//! platform.
//!
//! This crate provides:
//! - **Content ids**: deterministic CIDs derived from a BLAKE3 digest of
//!   the content bytes
//! - **Blob operations**: idempotent put, get, existence and size checks
//! - **Document storage**: canonical-JSON structured documents, so that
//!   identical documents produce identical ids across processes
//! - **Pinning**: mark content that must survive any future eviction
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Sync / Blocks / Audit (agora-core)  │
//! ├─────────────────────────────────────────┤
//! │           ContentStore Trait            │
//! ├─────────────────────────────────────────┤
//! │            MemoryContentStore           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Stores are explicit handle objects passed to every component; there is
//! no ambient global store. No deletion API is exposed at this layer —
//! content lifecycle is owned by the layers above.
//!
//! ## Example
//!
//! ```rust,ignore
//! use agora_store::{ContentStore, MemoryContentStore};
//!
//! let store = MemoryContentStore::new();
//! let id = store.put_block(&data).await?;
//! let retrieved = store.get_block(&id).await?;
//! ```

pub mod cid_utils;
pub mod error;
pub mod memory;

pub use cid_utils::{canonical_json, create_cid, parse_cid, verify_cid, CidCodec};
pub use error::{Result, StoreError};
pub use memory::MemoryContentStore;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;

/// Usage statistics for a content store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of distinct blocks stored
    pub blocks: usize,
    /// Total payload bytes across all blocks
    pub total_bytes: u64,
    /// Number of pinned blocks
    pub pinned: usize,
}

/// Trait for content-addressed storage backends
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store a blob and return its CID.
    ///
    /// Idempotent: putting identical bytes twice returns the same id and
    /// does not duplicate storage.
    async fn put_block(&self, data: &[u8]) -> Result<Cid>;

    /// Retrieve a blob by CID. Unknown ids are `StoreError::NotFound`,
    /// never a default value.
    async fn get_block(&self, cid: &Cid) -> Result<Bytes>;

    /// Check if a blob exists
    async fn has_block(&self, cid: &Cid) -> Result<bool>;

    /// Get blob size without retrieving content
    async fn block_size(&self, cid: &Cid) -> Result<u64>;

    /// Store a structured document as canonical JSON
    async fn put_json<T: serde::Serialize + Send + Sync>(&self, data: &T) -> Result<Cid>;

    /// Retrieve and deserialize a structured document
    async fn get_json<T: serde::de::DeserializeOwned>(&self, cid: &Cid) -> Result<T>;

    /// Pin a CID for persistence
    async fn pin(&self, cid: &Cid) -> Result<()>;

    /// Unpin a CID
    async fn unpin(&self, cid: &Cid) -> Result<()>;

    /// Check if a CID is pinned
    async fn is_pinned(&self, cid: &Cid) -> Result<bool>;

    /// Get usage statistics
    async fn stats(&self) -> Result<StoreStats>;
}
