//! Prioritized backup and disaster recovery
//!
//! Backups are wrapped in a [`BackupEnvelope`] and written through the
//! buffers at their priority. A failed buffer write falls back to an
//! emergency write into the urgent buffer, and then to a plain file under
//! the node's fallback directory, so that data survives even when the
//! content store is unavailable. Only when every tier fails does the
//! operation return `BackupFailed`.

use crate::blocks::{BlockManager, BufferRole, BufferStatus, Entry, PeerEntrySource, Priority};
use crate::chain::{AuditEvent, AuditSink};
use crate::{CoreError, Result};
use agora_store::{canonical_json, ContentStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Wrapper persisted around every backed-up payload
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEnvelope {
    pub backup_timestamp: DateTime<Utc>,
    pub data_type: String,
    pub priority: Priority,
    pub node_id: String,
    pub dataset: String,
    pub original_data: Value,
}

/// A backup found in the buffers, with its provenance
#[derive(Clone, Debug)]
pub struct CollectedBackup {
    pub source_role: BufferRole,
    pub entry_id: String,
    pub entry_hash: String,
    pub envelope: BackupEnvelope,
}

/// Outcome of a point-in-time recovery
#[derive(Clone, Debug)]
pub struct RecoveredBackup {
    pub data_type: String,
    pub backup_timestamp: DateTime<Utc>,
    pub source_role: BufferRole,
    pub entry_id: String,
    pub data: Value,
}

/// Outcome of a multi-node synchronization round
#[derive(Clone, Debug)]
pub struct MultiNodeSyncReport {
    pub sync_id: String,
    pub nodes_processed: usize,
    pub entries_processed: usize,
    pub unique_entries: usize,
}

/// Health snapshot of the recovery subsystem
#[derive(Clone, Debug)]
pub struct RecoveryStatus {
    pub dataset: String,
    pub node_id: String,
    pub total_entries: usize,
    pub total_capacity: usize,
    pub usage_percent: f64,
    pub emergency_entries: usize,
    pub known_nodes: Vec<String>,
    pub buffers: Vec<BufferStatus>,
}

/// Prioritized backup and recovery over one node's buffers.
///
/// The audit sink and peer source are optional collaborators: without a
/// sink no audit events are emitted, without peers multi-node operations
/// see only local entries.
pub struct RecoveryManager<S: ContentStore> {
    buffers: Arc<BlockManager<S>>,
    fallback_dir: PathBuf,
    audit: Option<Arc<dyn AuditSink>>,
    peers: Option<Arc<dyn PeerEntrySource>>,
}

impl<S: ContentStore> RecoveryManager<S> {
    pub fn new(buffers: Arc<BlockManager<S>>, fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            buffers,
            fallback_dir: fallback_dir.into(),
            audit: None,
            peers: None,
        }
    }

    /// Attach an audit sink; backup and recovery operations get logged
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Attach a peer entry source for multi-node synchronization
    pub fn with_peer_source(mut self, peers: Arc<dyn PeerEntrySource>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Back up `data` at `priority`, degrading through the fallback tiers.
    ///
    /// Returns the buffer entry id, or a `local_`-prefixed pseudo-id when
    /// the backup only reached the local fallback file.
    #[instrument(skip(self, data), fields(dataset = %self.buffers.dataset()))]
    pub async fn prioritized_backup(
        &self,
        data: Value,
        data_type: &str,
        priority: Priority,
    ) -> Result<String> {
        let envelope = BackupEnvelope {
            backup_timestamp: Utc::now(),
            data_type: data_type.to_string(),
            priority,
            node_id: self.buffers.node_id().to_string(),
            dataset: self.buffers.dataset().to_string(),
            original_data: data,
        };
        let payload = serde_json::to_value(&envelope)?;

        let first = self
            .buffers
            .write_entry(priority.target_role(), payload.clone(), data_type, priority)
            .await;
        let entry_id = match first {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "buffer write failed, retrying into urgent buffer");
                match self
                    .buffers
                    .write_entry(
                        BufferRole::Urgent,
                        payload.clone(),
                        &format!("emergency_{data_type}"),
                        Priority::Emergency,
                    )
                    .await
                {
                    Ok(id) => id,
                    Err(err) => {
                        warn!(%err, "urgent buffer write failed, using local fallback");
                        self.local_fallback(&payload, data_type).await?
                    }
                }
            }
        };

        self.record_audit(
            "backup_created",
            format!("backup of {data_type}"),
            json!({"entryId": entry_id, "priority": priority}),
        )
        .await;
        Ok(entry_id)
    }

    /// Every backup envelope currently held in the durable buffers,
    /// sorted oldest first
    pub async fn collect_backups(&self) -> Result<Vec<CollectedBackup>> {
        let mut backups = Vec::new();
        for role in BufferRole::READABLE {
            for entry in self.buffers.list_entries(role).await? {
                // Buffers also carry chain blocks and archive summaries;
                // only envelope-shaped payloads are backups.
                if let Ok(envelope) =
                    serde_json::from_value::<BackupEnvelope>(entry.payload.clone())
                {
                    backups.push(CollectedBackup {
                        source_role: role,
                        entry_id: entry.id,
                        entry_hash: entry.hash,
                        envelope,
                    });
                }
            }
        }
        backups.sort_by_key(|b| b.envelope.backup_timestamp);
        Ok(backups)
    }

    /// Recover the most recent backup, if any exists
    pub async fn recover_latest(&self) -> Result<Option<RecoveredBackup>> {
        self.recover_where(|_| true).await
    }

    /// Recover the most recent backup taken at or before `target`
    pub async fn recover_before(
        &self,
        target: DateTime<Utc>,
    ) -> Result<Option<RecoveredBackup>> {
        self.recover_where(|b| b.envelope.backup_timestamp <= target)
            .await
    }

    async fn recover_where(
        &self,
        keep: impl Fn(&CollectedBackup) -> bool,
    ) -> Result<Option<RecoveredBackup>> {
        let backups = self.collect_backups().await?;
        let chosen = backups.into_iter().filter(keep).next_back();

        let Some(backup) = chosen else {
            return Ok(None);
        };
        let recovered = RecoveredBackup {
            data_type: backup.envelope.data_type.clone(),
            backup_timestamp: backup.envelope.backup_timestamp,
            source_role: backup.source_role,
            entry_id: backup.entry_id.clone(),
            data: backup.envelope.original_data,
        };

        self.record_audit(
            "backup_recovered",
            format!("recovered {}", recovered.data_type),
            json!({
                "entryId": recovered.entry_id,
                "backupTimestamp": recovered.backup_timestamp,
            }),
        )
        .await;
        info!(entry_id = %recovered.entry_id, "backup recovered");
        Ok(Some(recovered))
    }

    /// Merge sync-buffer entries from this node and the given peers,
    /// deduplicate them, and persist a synchronization report.
    #[instrument(skip(self), fields(dataset = %self.buffers.dataset()))]
    pub async fn multi_node_sync(&self, node_ids: &[String]) -> Result<MultiNodeSyncReport> {
        let mut gathered = self.buffers.list_entries(BufferRole::Sync).await?;

        if let Some(peers) = &self.peers {
            for node_id in node_ids {
                if node_id == self.buffers.node_id() {
                    continue;
                }
                match peers.entries(node_id, BufferRole::Sync).await {
                    Ok(entries) => gathered.extend(entries),
                    Err(err) => {
                        warn!(node_id, %err, "peer unreachable during multi-node sync");
                    }
                }
            }
        }

        let entries_processed = gathered.len();
        let mut seen = HashSet::new();
        let unique: Vec<Entry> = gathered
            .into_iter()
            .filter(|entry| {
                let key = if entry.hash.is_empty() {
                    dedup_fallback_key(entry)
                } else {
                    entry.hash.clone()
                };
                seen.insert(key)
            })
            .collect();

        let unique_entries = unique.len();
        let summary = json!({
            "syncOperation": "multi_node_synchronization",
            "timestamp": Utc::now(),
            "nodesSynchronized": node_ids.len(),
            "totalEntriesReceived": entries_processed,
            "uniqueEntries": unique_entries,
            "participatingNodes": node_ids,
            "entries": unique,
        });
        let sync_id = self
            .prioritized_backup(summary, "multi_node_sync", Priority::High)
            .await?;

        info!(%sync_id, entries_processed, unique_entries, "multi-node sync complete");
        Ok(MultiNodeSyncReport {
            sync_id,
            nodes_processed: node_ids.len(),
            entries_processed,
            unique_entries,
        })
    }

    /// Aggregate buffer usage and registry state
    pub async fn status(&self) -> Result<RecoveryStatus> {
        let buffers = self.buffers.status(None).await?;
        let total_entries: usize = buffers.iter().map(|b| b.entries).sum();
        let total_capacity: usize = buffers.iter().map(|b| b.max_size).sum();
        let emergency_entries = buffers
            .iter()
            .find(|b| b.role == BufferRole::Urgent)
            .map(|b| b.entries)
            .unwrap_or(0);

        Ok(RecoveryStatus {
            dataset: self.buffers.dataset().to_string(),
            node_id: self.buffers.node_id().to_string(),
            total_entries,
            total_capacity,
            usage_percent: if total_capacity > 0 {
                (total_entries as f64 / total_capacity as f64) * 100.0
            } else {
                0.0
            },
            emergency_entries,
            known_nodes: self.buffers.known_nodes().await,
            buffers,
        })
    }

    /// Last-resort tier: write the payload to a plain file under the
    /// fallback directory and return a `local_` pseudo-id.
    async fn local_fallback(&self, payload: &Value, data_type: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.fallback_dir)
            .await
            .map_err(|e| {
                CoreError::BackupFailed(format!("cannot create fallback directory: {e}"))
            })?;

        let filename = format!(
            "backup_{}_{}_{}.json",
            self.buffers.dataset(),
            data_type,
            Utc::now().format("%Y%m%d_%H%M%S%3f"),
        );
        let path = self.fallback_dir.join(&filename);
        let bytes = serde_json::to_vec_pretty(payload)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CoreError::BackupFailed(format!("fallback write failed: {e}")))?;

        warn!(path = %path.display(), "backup written to local fallback file");
        Ok(format!("local_{filename}"))
    }

    async fn record_audit(&self, action_type: &str, description: String, metadata: Value) {
        let Some(sink) = &self.audit else {
            return;
        };
        let event = AuditEvent {
            action_type: action_type.to_string(),
            description,
            subject_ids: Vec::new(),
            actor_id: Some(self.buffers.node_id().to_string()),
            metadata,
            priority: Priority::Normal,
        };
        if let Err(err) = sink.record(event).await {
            warn!(%err, "audit sink rejected event");
        }
    }
}

fn dedup_fallback_key(entry: &Entry) -> String {
    let payload = canonical_json(&entry.payload)
        .map(|bytes| blake3::hash(&bytes).to_hex().to_string())
        .unwrap_or_default();
    format!("{}_{}", entry.timestamp.to_rfc3339(), payload)
}
