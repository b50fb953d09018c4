//! Tamper-evident audit log
//!
//! Every significant system action is appended as a [`LogBlock`] whose
//! `self_hash` covers all of its fields except the hash itself, and whose
//! `previous_hash` is the prior block's `self_hash`. Each block is also
//! written through the block manager as a buffer entry tagged
//! `chain_<action_type>`, so a node that lost its in-memory chain can
//! rebuild it from the buffers — its own and its peers'.

use crate::blocks::{BlockManager, BufferRole, PeerEntrySource, Priority};
use crate::{CoreError, Result};
use agora_store::{canonical_json, ContentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Buffer entries carrying chain blocks use this data-type prefix
pub(crate) const CHAIN_ENTRY_PREFIX: &str = "chain_";

/// One block of the hash-chained audit log
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBlock {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_ids: Vec<String>,
    pub metadata: Value,
    /// `self_hash` of the preceding block; `None` only for the first block
    #[serde(default)]
    pub previous_hash: Option<String>,
    /// BLAKE3 hex digest over all fields above, in canonical form
    #[serde(default)]
    pub self_hash: Option<String>,
    /// Id of the buffer entry this block was persisted as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_entry_id: Option<String>,
}

impl LogBlock {
    /// Hash over the chained fields. `self_hash`, `entry_id` and the
    /// recovery markers are excluded so that recovery relabeling does not
    /// change block identity semantics.
    pub fn compute_self_hash(&self) -> Result<String> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct HashView<'a> {
            sequence_id: u64,
            timestamp: &'a DateTime<Utc>,
            action_type: &'a str,
            description: &'a str,
            actor_id: &'a Option<String>,
            subject_ids: &'a [String],
            metadata: &'a Value,
            previous_hash: &'a Option<String>,
        }

        let view = HashView {
            sequence_id: self.sequence_id,
            timestamp: &self.timestamp,
            action_type: &self.action_type,
            description: &self.description,
            actor_id: &self.actor_id,
            subject_ids: &self.subject_ids,
            metadata: &self.metadata,
            previous_hash: &self.previous_hash,
        };
        let bytes = canonical_json(&view)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Event accepted by an [`AuditSink`]
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub action_type: String,
    pub description: String,
    pub subject_ids: Vec<String>,
    pub actor_id: Option<String>,
    pub metadata: Value,
    pub priority: Priority,
}

/// Optional collaborator for components that emit audit events without
/// owning the log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Result of rebuilding the chain from buffer entries
#[derive(Clone, Debug)]
pub struct ChainRecovery {
    pub blocks_recovered: usize,
    pub chain: Vec<LogBlock>,
}

/// Verify the internal consistency of a chain: every block's `self_hash`
/// recomputes, and every `previous_hash` matches its predecessor.
pub fn verify_blocks(blocks: &[LogBlock]) -> Result<()> {
    for (i, block) in blocks.iter().enumerate() {
        let expected = block.compute_self_hash()?;
        if block.self_hash.as_deref() != Some(expected.as_str()) {
            return Err(CoreError::IntegrityViolation(format!(
                "block {} self hash mismatch",
                block.sequence_id
            )));
        }
        let expected_previous = if i == 0 {
            None
        } else {
            blocks[i - 1].self_hash.clone()
        };
        if block.previous_hash != expected_previous {
            return Err(CoreError::IntegrityViolation(format!(
                "block {} previous hash broken",
                block.sequence_id
            )));
        }
    }
    Ok(())
}

/// The hash-chained audit log for one node.
///
/// Blocks live in memory behind a mutex; durability comes from writing
/// each block through the buffers at its event's priority.
pub struct AuditLog<S: ContentStore> {
    buffers: Arc<BlockManager<S>>,
    chain: Mutex<Vec<LogBlock>>,
    peers: Option<Arc<dyn PeerEntrySource>>,
}

impl<S: ContentStore> AuditLog<S> {
    pub fn new(buffers: Arc<BlockManager<S>>) -> Self {
        Self {
            buffers,
            chain: Mutex::new(Vec::new()),
            peers: None,
        }
    }

    /// Attach a peer entry source, enabling cross-node chain recovery
    pub fn with_peer_source(mut self, peers: Arc<dyn PeerEntrySource>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Append a block to the chain and persist it through the buffers.
    ///
    /// The block's priority decides which buffer receives it: emergency
    /// events land in `urgent`, routine ones in `active`, and so on.
    #[instrument(skip(self, metadata), fields(node = %self.buffers.node_id()))]
    pub async fn append(
        &self,
        action_type: &str,
        description: &str,
        subject_ids: Vec<String>,
        actor_id: Option<String>,
        metadata: Value,
        priority: Priority,
    ) -> Result<LogBlock> {
        let mut chain = self.chain.lock().await;

        let mut block = LogBlock {
            sequence_id: chain.len() as u64,
            timestamp: Utc::now(),
            action_type: action_type.to_string(),
            description: description.to_string(),
            actor_id,
            subject_ids,
            metadata,
            previous_hash: chain.last().and_then(|b| b.self_hash.clone()),
            self_hash: None,
            entry_id: None,
            recovered: false,
            original_entry_id: None,
        };
        block.self_hash = Some(block.compute_self_hash()?);

        let payload = serde_json::to_value(&block)?;
        let entry_id = self
            .buffers
            .write_entry(
                priority.target_role(),
                payload,
                &format!("{CHAIN_ENTRY_PREFIX}{action_type}"),
                priority,
            )
            .await?;
        block.entry_id = Some(entry_id);

        chain.push(block.clone());
        debug!(sequence_id = block.sequence_id, action_type, "appended chain block");
        Ok(block)
    }

    /// Verify the whole chain; any mismatch is `IntegrityViolation`
    pub async fn verify(&self) -> Result<()> {
        let chain = self.chain.lock().await;
        verify_blocks(&chain)
    }

    /// A copy of the current chain
    pub async fn blocks(&self) -> Vec<LogBlock> {
        self.chain.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.chain.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chain.lock().await.is_empty()
    }

    /// Rebuild the chain from chain-tagged buffer entries.
    ///
    /// Gathers entries from this node's durable buffers (buffer1 is
    /// staging and never consulted) and, when a peer source is attached,
    /// from each registered peer. Entries are deduplicated by payload
    /// hash, ordered by timestamp, renumbered and relinked, and the
    /// rebuilt chain replaces the local one.
    #[instrument(skip(self), fields(node = %self.buffers.node_id()))]
    pub async fn recover_chain(&self, known_node_ids: &[String]) -> Result<ChainRecovery> {
        let mut collected = Vec::new();
        for role in BufferRole::READABLE {
            collected.extend(self.buffers.list_entries(role).await?);
        }

        if let Some(peers) = &self.peers {
            for node_id in known_node_ids {
                if node_id == self.buffers.node_id() {
                    continue;
                }
                for role in BufferRole::READABLE {
                    match peers.entries(node_id, role).await {
                        Ok(entries) => collected.extend(entries),
                        Err(err) => {
                            warn!(node_id, %role, %err, "peer unreachable during chain recovery");
                        }
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let mut chain_entries: Vec<_> = collected
            .into_iter()
            .filter(|e| e.data_type.starts_with(CHAIN_ENTRY_PREFIX))
            .filter(|e| seen.insert(e.hash.clone()))
            .collect();
        chain_entries.sort_by_key(|e| e.timestamp);

        let mut rebuilt: Vec<LogBlock> = Vec::with_capacity(chain_entries.len());
        let mut previous_hash: Option<String> = None;
        for entry in chain_entries {
            let mut block: LogBlock = match serde_json::from_value(entry.payload.clone()) {
                Ok(block) => block,
                Err(err) => {
                    warn!(entry_id = %entry.id, %err, "skipping unparseable chain entry");
                    continue;
                }
            };
            block.sequence_id = rebuilt.len() as u64;
            block.previous_hash = previous_hash.clone();
            block.recovered = true;
            block.original_entry_id = Some(entry.id);
            block.self_hash = Some(block.compute_self_hash()?);
            previous_hash = block.self_hash.clone();
            rebuilt.push(block);
        }

        let mut chain = self.chain.lock().await;
        *chain = rebuilt.clone();
        info!(blocks_recovered = rebuilt.len(), "chain rebuilt from buffers");

        Ok(ChainRecovery {
            blocks_recovered: rebuilt.len(),
            chain: rebuilt,
        })
    }
}

#[async_trait]
impl<S: ContentStore> AuditSink for AuditLog<S> {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.append(
            &event.action_type,
            &event.description,
            event.subject_ids,
            event.actor_id,
            event.metadata,
            event.priority,
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_store::MemoryContentStore;
    use serde_json::json;

    async fn log() -> AuditLog<MemoryContentStore> {
        let store = Arc::new(MemoryContentStore::new());
        let buffers = Arc::new(
            BlockManager::new(store, "election-2026", "node-a")
                .await
                .unwrap(),
        );
        AuditLog::new(buffers)
    }

    #[tokio::test]
    async fn test_chain_links_and_verifies() {
        let log = log().await;

        let first = log
            .append(
                "question_created",
                "new question",
                vec!["q1".to_string()],
                Some("admin".to_string()),
                json!({"title": "budget 2027"}),
                Priority::Normal,
            )
            .await
            .unwrap();
        assert_eq!(first.sequence_id, 0);
        assert!(first.previous_hash.is_none());
        assert!(first.self_hash.is_some());

        let second = log
            .append(
                "vote_cast",
                "vote recorded",
                vec!["q1".to_string()],
                None,
                json!({"choice": 2}),
                Priority::Normal,
            )
            .await
            .unwrap();
        assert_eq!(second.sequence_id, 1);
        assert_eq!(second.previous_hash, first.self_hash);

        log.verify().await.unwrap();
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let log = log().await;
        for n in 0..3 {
            log.append(
                "vote_cast",
                "vote recorded",
                vec![],
                None,
                json!({"n": n}),
                Priority::Normal,
            )
            .await
            .unwrap();
        }

        let mut blocks = log.blocks().await;
        blocks[1].metadata = json!({"n": 99});
        let err = verify_blocks(&blocks).unwrap_err();
        assert!(matches!(err, CoreError::IntegrityViolation(_)));

        // Re-hashing the tampered block breaks the link instead
        let mut blocks = log.blocks().await;
        blocks[1].metadata = json!({"n": 99});
        blocks[1].self_hash = Some(blocks[1].compute_self_hash().unwrap());
        let err = verify_blocks(&blocks).unwrap_err();
        assert!(matches!(err, CoreError::IntegrityViolation(_)));
    }

    #[tokio::test]
    async fn test_priority_routes_to_buffer() {
        let log = log().await;

        log.append(
            "node_failure",
            "peer went dark",
            vec![],
            None,
            json!({}),
            Priority::Emergency,
        )
        .await
        .unwrap();
        log.append(
            "vote_cast",
            "vote recorded",
            vec![],
            None,
            json!({}),
            Priority::Normal,
        )
        .await
        .unwrap();

        let buffers = {
            let store = &log.buffers;
            (
                store.list_entries(BufferRole::Urgent).await.unwrap(),
                store.list_entries(BufferRole::Active).await.unwrap(),
            )
        };
        assert_eq!(buffers.0.len(), 1);
        assert_eq!(buffers.0[0].data_type, "chain_node_failure");
        assert_eq!(buffers.1.len(), 1);
        assert_eq!(buffers.1[0].data_type, "chain_vote_cast");
    }

    #[tokio::test]
    async fn test_recovery_rebuilds_full_chain() {
        let store = Arc::new(MemoryContentStore::new());
        let buffers = Arc::new(
            BlockManager::new(store, "election-2026", "node-a")
                .await
                .unwrap(),
        );
        let log = AuditLog::new(Arc::clone(&buffers));

        // Scatter blocks across urgent, sync, active and buffer2
        let priorities = [
            Priority::Normal,
            Priority::Emergency,
            Priority::High,
            Priority::Low,
            Priority::Normal,
        ];
        for (n, priority) in priorities.iter().enumerate() {
            log.append(
                "vote_cast",
                "vote recorded",
                vec![],
                None,
                json!({"n": n}),
                *priority,
            )
            .await
            .unwrap();
        }

        // A non-chain entry must not leak into the rebuilt chain
        buffers
            .write_entry(
                BufferRole::Active,
                json!({"noise": true}),
                "vote_backup",
                Priority::Normal,
            )
            .await
            .unwrap();

        // Fresh log over the same buffers, as after a restart
        let restarted = AuditLog::new(Arc::clone(&buffers));
        assert!(restarted.is_empty().await);

        let recovery = restarted.recover_chain(&[]).await.unwrap();
        assert_eq!(recovery.blocks_recovered, 5);

        restarted.verify().await.unwrap();
        let blocks = restarted.blocks().await;
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.sequence_id, i as u64);
            assert!(block.recovered);
            assert!(block.original_entry_id.is_some());
            if i > 0 {
                assert!(blocks[i - 1].timestamp <= block.timestamp);
            }
        }
        // Original payload order is preserved by timestamp
        let ns: Vec<_> = blocks.iter().map(|b| b.metadata["n"].as_u64()).collect();
        assert_eq!(ns, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    }

    #[tokio::test]
    async fn test_recovery_merges_peer_entries() {
        struct StaticPeers {
            entries: Vec<crate::blocks::Entry>,
        }

        #[async_trait]
        impl PeerEntrySource for StaticPeers {
            async fn entries(
                &self,
                node_id: &str,
                role: BufferRole,
            ) -> Result<Vec<crate::blocks::Entry>> {
                if node_id == "node-b" && role == BufferRole::Active {
                    Ok(self.entries.clone())
                } else {
                    Ok(Vec::new())
                }
            }
        }

        // Build a peer node's chain entry by appending on a second log
        let peer_store = Arc::new(MemoryContentStore::new());
        let peer_buffers = Arc::new(
            BlockManager::new(peer_store, "election-2026", "node-b")
                .await
                .unwrap(),
        );
        let peer_log = AuditLog::new(Arc::clone(&peer_buffers));
        peer_log
            .append(
                "vote_cast",
                "vote recorded",
                vec![],
                None,
                json!({"from": "peer"}),
                Priority::Normal,
            )
            .await
            .unwrap();
        let peer_entries = peer_buffers.list_entries(BufferRole::Active).await.unwrap();

        let store = Arc::new(MemoryContentStore::new());
        let buffers = Arc::new(
            BlockManager::new(store, "election-2026", "node-a")
                .await
                .unwrap(),
        );
        let log = AuditLog::new(buffers).with_peer_source(Arc::new(StaticPeers {
            entries: peer_entries,
        }));
        log.append(
            "vote_cast",
            "vote recorded",
            vec![],
            None,
            json!({"from": "local"}),
            Priority::Normal,
        )
        .await
        .unwrap();

        let recovery = log
            .recover_chain(&["node-a".to_string(), "node-b".to_string()])
            .await
            .unwrap();
        assert_eq!(recovery.blocks_recovered, 2);
        log.verify().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_deduplicates_by_payload_hash() {
        struct MirrorPeers {
            entries: Vec<crate::blocks::Entry>,
        }

        #[async_trait]
        impl PeerEntrySource for MirrorPeers {
            async fn entries(
                &self,
                _node_id: &str,
                role: BufferRole,
            ) -> Result<Vec<crate::blocks::Entry>> {
                if role == BufferRole::Active {
                    Ok(self.entries.clone())
                } else {
                    Ok(Vec::new())
                }
            }
        }

        let store = Arc::new(MemoryContentStore::new());
        let buffers = Arc::new(
            BlockManager::new(store, "election-2026", "node-a")
                .await
                .unwrap(),
        );
        let log = AuditLog::new(Arc::clone(&buffers));
        log.append(
            "vote_cast",
            "vote recorded",
            vec![],
            None,
            json!({"n": 1}),
            Priority::Normal,
        )
        .await
        .unwrap();

        // Peer mirrors exactly the same entries back
        let mirrored = buffers.list_entries(BufferRole::Active).await.unwrap();
        let log = AuditLog::new(buffers)
            .with_peer_source(Arc::new(MirrorPeers { entries: mirrored }));

        let recovery = log.recover_chain(&["node-b".to_string()]).await.unwrap();
        assert_eq!(recovery.blocks_recovered, 1);
    }
}
