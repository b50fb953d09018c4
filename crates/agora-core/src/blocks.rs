//! Rotating block manager
//!
//! Five purpose-tagged buffers sit at fixed pipeline positions:
//!
//! ```text
//! buffer1 (empty staging) → urgent (emergency, small) → sync
//!     → active (primary write target) → buffer2 (archive/transfer)
//! ```
//!
//! Writes normally target `active`; when it reaches capacity the roles
//! rotate: the outgoing active buffer is summarized into buffer2, sync
//! becomes the new (empty) active, urgent becomes sync with its entries
//! retained, buffer1 becomes an empty urgent, and a fresh buffer1 is
//! created. Buffers and the blocks metadata are persisted through the
//! content store on every write, so a buffer's id changes whenever its
//! content changes.

use crate::{CoreError, Result, FORMAT_VERSION};
use agora_store::{canonical_json, ContentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cid::Cid;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// The five buffer roles, in pipeline order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferRole {
    Buffer1,
    Urgent,
    Sync,
    Active,
    Buffer2,
}

impl BufferRole {
    /// All roles in pipeline order
    pub const ALL: [BufferRole; 5] = [
        BufferRole::Buffer1,
        BufferRole::Urgent,
        BufferRole::Sync,
        BufferRole::Active,
        BufferRole::Buffer2,
    ];

    /// Roles that hold durable entries (buffer1 is always-empty staging)
    pub const READABLE: [BufferRole; 4] = [
        BufferRole::Urgent,
        BufferRole::Sync,
        BufferRole::Active,
        BufferRole::Buffer2,
    ];

    /// The wire name of this role
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferRole::Buffer1 => "buffer1",
            BufferRole::Urgent => "urgent",
            BufferRole::Sync => "sync",
            BufferRole::Active => "active",
            BufferRole::Buffer2 => "buffer2",
        }
    }
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BufferRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "buffer1" => Ok(BufferRole::Buffer1),
            "urgent" => Ok(BufferRole::Urgent),
            "sync" => Ok(BufferRole::Sync),
            "active" => Ok(BufferRole::Active),
            "buffer2" => Ok(BufferRole::Buffer2),
            other => Err(CoreError::UnknownRole(other.to_string())),
        }
    }
}

/// Write priority, mapped onto a target buffer role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Emergency,
    High,
    Normal,
    Low,
}

impl Priority {
    /// The buffer a write at this priority targets
    pub fn target_role(&self) -> BufferRole {
        match self {
            Priority::Emergency => BufferRole::Urgent,
            Priority::High => BufferRole::Sync,
            Priority::Normal => BufferRole::Active,
            Priority::Low => BufferRole::Buffer2,
        }
    }

    /// The wire name of this priority
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Emergency => "emergency",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Capacity and policy for one buffer role
#[derive(Clone, Debug)]
pub struct BufferPolicy {
    /// Human-readable purpose tag carried in the buffer document
    pub purpose: &'static str,
    /// Maximum number of entries before the buffer is full
    pub max_size: usize,
    /// Nominal retention window in seconds, if any
    pub time_window_secs: Option<u64>,
    /// Priorities this role accepts
    pub priority_allowed: &'static [Priority],
}

fn default_policy(role: BufferRole) -> BufferPolicy {
    match role {
        BufferRole::Buffer1 => BufferPolicy {
            purpose: "empty_staging",
            max_size: 100,
            time_window_secs: None,
            priority_allowed: &[Priority::Low],
        },
        BufferRole::Urgent => BufferPolicy {
            purpose: "emergency_backups",
            max_size: 50,
            time_window_secs: Some(3600),
            priority_allowed: &[Priority::Emergency],
        },
        BufferRole::Sync => BufferPolicy {
            purpose: "synchronization_point",
            max_size: 200,
            time_window_secs: Some(21_600),
            priority_allowed: &[Priority::High],
        },
        BufferRole::Active => BufferPolicy {
            purpose: "active_writing",
            max_size: 150,
            time_window_secs: Some(7200),
            priority_allowed: &[Priority::Normal],
        },
        BufferRole::Buffer2 => BufferPolicy {
            purpose: "archive_transfer",
            max_size: 100,
            time_window_secs: None,
            priority_allowed: &[Priority::Low],
        },
    }
}

/// Per-role buffer policies
#[derive(Clone, Debug)]
pub struct BlockConfig {
    policies: BTreeMap<BufferRole, BufferPolicy>,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            policies: BufferRole::ALL
                .iter()
                .map(|role| (*role, default_policy(*role)))
                .collect(),
        }
    }
}

impl BlockConfig {
    /// The policy for one role
    pub fn policy(&self, role: BufferRole) -> &BufferPolicy {
        // All five roles are populated by construction.
        &self.policies[&role]
    }

    /// Override the capacity of one role
    pub fn with_max_size(mut self, role: BufferRole, max_size: usize) -> Self {
        if let Some(policy) = self.policies.get_mut(&role) {
            policy.max_size = max_size;
        }
        self
    }
}

/// One immutable record inside a buffer.
///
/// An entry lives in exactly one buffer at a time; rotation moves whole
/// buffers, never individual entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// `<role>_<index>_<node_id>`
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub data_type: String,
    pub node_id: String,
    pub priority: Priority,
    pub payload: Value,
    /// BLAKE3 hex digest of the canonical payload
    pub hash: String,
}

impl Entry {
    fn new(
        role: BufferRole,
        index: u64,
        node_id: &str,
        data_type: &str,
        priority: Priority,
        payload: Value,
    ) -> Result<Self> {
        let hash = blake3::hash(&canonical_json(&payload)?).to_hex().to_string();
        Ok(Self {
            id: format!("{}_{}_{}", role.as_str(), index, node_id),
            timestamp: Utc::now(),
            data_type: data_type.to_string(),
            node_id: node_id.to_string(),
            priority,
            payload,
            hash,
        })
    }
}

/// A persisted buffer document
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffer {
    pub name: BufferRole,
    pub purpose: String,
    pub max_size: usize,
    #[serde(rename = "timeWindow")]
    pub time_window_secs: Option<u64>,
    pub priority_allowed: Vec<Priority>,
    pub entries: Vec<Entry>,
    pub entry_hashes: Vec<String>,
    pub next_index: u64,
}

impl Buffer {
    fn new(role: BufferRole, policy: &BufferPolicy) -> Self {
        Self {
            name: role,
            purpose: policy.purpose.to_string(),
            max_size: policy.max_size,
            time_window_secs: policy.time_window_secs,
            priority_allowed: policy.priority_allowed.to_vec(),
            entries: Vec::new(),
            entry_hashes: Vec::new(),
            next_index: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    fn push(&mut self, entry: Entry) {
        self.entry_hashes.push(entry.hash.clone());
        self.entries.push(entry);
        self.next_index += 1;
    }

    /// Relabel this buffer for a new role, optionally emptying it
    fn adopt_role(&mut self, role: BufferRole, policy: &BufferPolicy, clear: bool) {
        self.name = role;
        self.purpose = policy.purpose.to_string();
        self.max_size = policy.max_size;
        self.time_window_secs = policy.time_window_secs;
        self.priority_allowed = policy.priority_allowed.to_vec();
        if clear {
            self.entries.clear();
            self.entry_hashes.clear();
            self.next_index = 0;
        }
    }
}

/// One role-reassignment record
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationRecord {
    pub timestamp: DateTime<Utc>,
    pub old_sequence: Vec<BufferRole>,
    pub new_sequence: Vec<BufferRole>,
}

/// The single metadata document tying the five buffers together.
///
/// Updated on every buffer write, because a buffer's content id changes
/// whenever its content changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocksMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub dataset: String,
    pub node_id: String,
    pub block_sequence: Vec<BufferRole>,
    pub rotation_count: u64,
    #[serde(rename = "bufferIdByName", with = "crate::cid_serde::cid_map")]
    pub buffer_ids: BTreeMap<String, Cid>,
    pub rotation_history: Vec<RotationRecord>,
    pub node_registry: Vec<String>,
}

/// Status snapshot for one buffer
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStatus {
    pub role: BufferRole,
    pub purpose: String,
    pub entries: usize,
    pub max_size: usize,
    pub usage_percent: f64,
    pub full: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Source of buffer entries held by peer nodes.
///
/// Network transport is external to the core; implementations wrap
/// whatever transport the deployment uses. An unreachable peer yields an
/// empty list, not an error.
#[async_trait]
pub trait PeerEntrySource: Send + Sync {
    async fn entries(&self, node_id: &str, role: BufferRole) -> Result<Vec<Entry>>;
}

struct ManagerState {
    metadata: BlocksMetadata,
    metadata_id: Cid,
}

/// Manages the five rotating buffers for one dataset.
///
/// All buffer state is serialized behind one mutex so that a capacity
/// check and the resulting append or rotation are atomic.
pub struct BlockManager<S: ContentStore> {
    store: Arc<S>,
    config: BlockConfig,
    dataset: String,
    node_id: String,
    state: Mutex<ManagerState>,
}

impl<S: ContentStore> BlockManager<S> {
    /// Initialize the five buffers and metadata with default policies
    pub async fn new(store: Arc<S>, dataset: &str, node_id: &str) -> Result<Self> {
        Self::with_config(store, dataset, node_id, BlockConfig::default()).await
    }

    /// Initialize with custom buffer policies
    pub async fn with_config(
        store: Arc<S>,
        dataset: &str,
        node_id: &str,
        config: BlockConfig,
    ) -> Result<Self> {
        let mut buffer_ids = BTreeMap::new();
        for role in BufferRole::ALL {
            let buffer = Buffer::new(role, config.policy(role));
            let id = store.put_json(&buffer).await?;
            buffer_ids.insert(role.as_str().to_string(), id);
        }

        let metadata = BlocksMetadata {
            version: FORMAT_VERSION.to_string(),
            created_at: Utc::now(),
            dataset: dataset.to_string(),
            node_id: node_id.to_string(),
            block_sequence: BufferRole::ALL.to_vec(),
            rotation_count: 0,
            buffer_ids,
            rotation_history: Vec::new(),
            node_registry: vec![node_id.to_string()],
        };
        let metadata_id = store.put_json(&metadata).await?;
        info!(dataset, node_id, %metadata_id, "initialized block set");

        Ok(Self {
            store,
            config,
            dataset: dataset.to_string(),
            node_id: node_id.to_string(),
            state: Mutex::new(ManagerState {
                metadata,
                metadata_id,
            }),
        })
    }

    /// The dataset these buffers belong to
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// This node's id
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current id of the metadata document
    pub async fn metadata_id(&self) -> Cid {
        self.state.lock().await.metadata_id
    }

    /// A copy of the current metadata document
    pub async fn metadata(&self) -> BlocksMetadata {
        self.state.lock().await.metadata.clone()
    }

    /// Write an entry into the buffer playing `role`.
    ///
    /// A full `active` buffer triggers exactly one rotation and the write
    /// retries into the new, empty active buffer. Any other full role
    /// fails with `BufferFull`.
    #[instrument(skip(self, payload), fields(dataset = %self.dataset))]
    pub async fn write_entry(
        &self,
        role: BufferRole,
        payload: Value,
        data_type: &str,
        priority: Priority,
    ) -> Result<String> {
        let mut state = self.state.lock().await;

        match self
            .append_locked(&mut state, role, payload.clone(), data_type, priority)
            .await
        {
            Err(CoreError::BufferFull { .. }) if role == BufferRole::Active => {
                info!("active buffer full, rotating");
                self.rotate_locked(&mut state).await?;
                self.append_locked(&mut state, role, payload, data_type, priority)
                    .await
            }
            other => other,
        }
    }

    /// All entries currently in the buffer playing `role`
    pub async fn list_entries(&self, role: BufferRole) -> Result<Vec<Entry>> {
        let state = self.state.lock().await;
        Ok(self.load_buffer(&state, role).await?.entries)
    }

    /// Look up one entry by id within a buffer
    pub async fn find_entry(&self, role: BufferRole, entry_id: &str) -> Result<Option<Entry>> {
        let state = self.state.lock().await;
        let buffer = self.load_buffer(&state, role).await?;
        Ok(buffer.entries.into_iter().find(|e| e.id == entry_id))
    }

    /// Status for one role, or all roles in pipeline order
    pub async fn status(&self, role: Option<BufferRole>) -> Result<Vec<BufferStatus>> {
        let state = self.state.lock().await;
        let roles: Vec<BufferRole> = match role {
            Some(role) => vec![role],
            None => BufferRole::ALL.to_vec(),
        };

        let mut statuses = Vec::with_capacity(roles.len());
        for role in roles {
            let buffer = self.load_buffer(&state, role).await?;
            statuses.push(BufferStatus {
                role,
                purpose: buffer.purpose.clone(),
                entries: buffer.entries.len(),
                max_size: buffer.max_size,
                usage_percent: if buffer.max_size > 0 {
                    (buffer.entries.len() as f64 / buffer.max_size as f64) * 100.0
                } else {
                    100.0
                },
                full: buffer.is_full(),
                last_updated: buffer.entries.last().map(|e| e.timestamp),
            });
        }
        Ok(statuses)
    }

    /// Idempotently add a node to the registry. Returns true if added.
    pub async fn register_node(&self, node_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.metadata.node_registry.iter().any(|n| n == node_id) {
            return Ok(false);
        }
        state.metadata.node_registry.push(node_id.to_string());
        self.persist_metadata(&mut state).await?;
        debug!(node_id, "registered node");
        Ok(true)
    }

    /// All nodes known to this block set
    pub async fn known_nodes(&self) -> Vec<String> {
        self.state.lock().await.metadata.node_registry.clone()
    }

    async fn load_buffer(&self, state: &ManagerState, role: BufferRole) -> Result<Buffer> {
        let id = state
            .metadata
            .buffer_ids
            .get(role.as_str())
            .ok_or_else(|| CoreError::UnknownRole(role.to_string()))?;
        Ok(self.store.get_json(id).await?)
    }

    /// Append without rotation; a full buffer is `BufferFull`
    async fn append_locked(
        &self,
        state: &mut ManagerState,
        role: BufferRole,
        payload: Value,
        data_type: &str,
        priority: Priority,
    ) -> Result<String> {
        let mut buffer = self.load_buffer(state, role).await?;

        if buffer.is_full() {
            return Err(CoreError::BufferFull {
                role: role.to_string(),
                max_size: buffer.max_size,
            });
        }

        let entry = Entry::new(
            role,
            buffer.next_index,
            &self.node_id,
            data_type,
            priority,
            payload,
        )?;
        let entry_id = entry.id.clone();
        buffer.push(entry);

        let buffer_id = self.store.put_json(&buffer).await?;
        state
            .metadata
            .buffer_ids
            .insert(role.as_str().to_string(), buffer_id);
        self.persist_metadata(state).await?;

        debug!(%role, entry_id, "wrote entry");
        Ok(entry_id)
    }

    /// The rotation state machine. Called only with the state lock held
    /// and only when the active buffer is full.
    async fn rotate_locked(&self, state: &mut ManagerState) -> Result<()> {
        let old_sequence = state.metadata.block_sequence.clone();

        // 1. Archive a compact summary of the outgoing active buffer into
        //    buffer2; raw entries are not copied.
        let old_active = self.load_buffer(state, BufferRole::Active).await?;
        let summary = json!({
            "archiveTimestamp": Utc::now(),
            "originalRole": BufferRole::Active,
            "totalEntries": old_active.entries.len(),
            "entryIds": old_active
                .entries
                .iter()
                .map(|e| e.id.clone())
                .collect::<Vec<_>>(),
        });
        self.append_locked(
            state,
            BufferRole::Buffer2,
            summary,
            "buffer_archive",
            Priority::Low,
        )
        .await?;

        // 2. sync -> active, emptied: the new active starts clean.
        let mut new_active = self.load_buffer(state, BufferRole::Sync).await?;
        new_active.adopt_role(BufferRole::Active, self.config.policy(BufferRole::Active), true);

        // 3. urgent -> sync, entries retained.
        let mut new_sync = self.load_buffer(state, BufferRole::Urgent).await?;
        new_sync.adopt_role(BufferRole::Sync, self.config.policy(BufferRole::Sync), false);

        // 4. buffer1 -> urgent, emptied.
        let mut new_urgent = self.load_buffer(state, BufferRole::Buffer1).await?;
        new_urgent.adopt_role(BufferRole::Urgent, self.config.policy(BufferRole::Urgent), true);

        // 5. Fresh empty staging buffer. buffer2 keeps its slot.
        let new_buffer1 = Buffer::new(BufferRole::Buffer1, self.config.policy(BufferRole::Buffer1));

        for (role, buffer) in [
            (BufferRole::Active, &new_active),
            (BufferRole::Sync, &new_sync),
            (BufferRole::Urgent, &new_urgent),
            (BufferRole::Buffer1, &new_buffer1),
        ] {
            let id = self.store.put_json(buffer).await?;
            state
                .metadata
                .buffer_ids
                .insert(role.as_str().to_string(), id);
        }

        let mut new_sequence = old_sequence.clone();
        new_sequence.rotate_left(1);

        state.metadata.block_sequence = new_sequence.clone();
        state.metadata.rotation_count += 1;
        state.metadata.rotation_history.push(RotationRecord {
            timestamp: Utc::now(),
            old_sequence,
            new_sequence,
        });
        self.persist_metadata(state).await?;

        info!(
            rotation = state.metadata.rotation_count,
            "buffer roles rotated"
        );
        Ok(())
    }

    async fn persist_metadata(&self, state: &mut ManagerState) -> Result<()> {
        state.metadata_id = self.store.put_json(&state.metadata).await?;
        Ok(())
    }
}
