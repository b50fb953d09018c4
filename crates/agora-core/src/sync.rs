//! Sync orchestrator
//!
//! Decides the full-vs-delta strategy per dataset: the first sync (or a
//! forced one) publishes a full snapshot; every later sync publishes a
//! delta diffed against the manifest of the LAST FULL SNAPSHOT, never
//! against an intermediate delta. This fixed-base policy is deliberate —
//! it keeps every delta independently applicable to the one base object
//! and bounds recovery to a single hop in normal operation.

use crate::snapshot::{compute_manifest, Items, Manifest, SnapshotEngine, StoredObject};
use crate::{Result, FORMAT_VERSION};
use agora_store::ContentStore;
use chrono::{DateTime, Utc};
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Persisted per-dataset sync state.
///
/// `base_manifest` is updated only on a full sync, never incrementally.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Document format version
    pub version: String,
    /// When this state was first created
    pub created_at: DateTime<Utc>,
    /// Id of the last full snapshot, if any
    #[serde(default, with = "crate::cid_serde::opt_cid_string")]
    pub last_base_id: Option<Cid>,
    /// Manifest of the last full snapshot
    #[serde(default)]
    pub base_manifest: Manifest,
    /// Number of full syncs performed
    pub full_sync_count: u64,
    /// Number of delta syncs performed
    pub delta_sync_count: u64,
    /// Accumulated bytes saved by shipping deltas
    pub total_bytes_saved: u64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            created_at: Utc::now(),
            last_base_id: None,
            base_manifest: Manifest::new(),
            full_sync_count: 0,
            delta_sync_count: 0,
            total_bytes_saved: 0,
        }
    }
}

/// Point-in-time sync statistics for one dataset
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub dataset: String,
    #[serde(with = "crate::cid_serde::opt_cid_string")]
    pub last_base_id: Option<Cid>,
    pub full_sync_count: u64,
    pub delta_sync_count: u64,
    pub total_bytes_saved: u64,
    /// Share of syncs that were deltas, in percent
    pub delta_share_percent: f64,
}

/// Orchestrates full and delta syncs for one named dataset
pub struct SyncOrchestrator<S: ContentStore> {
    dataset: String,
    engine: SnapshotEngine<S>,
    state: Mutex<SyncState>,
    state_path: PathBuf,
}

impl<S: ContentStore> SyncOrchestrator<S> {
    /// Open the orchestrator for `dataset`, loading persisted sync state
    /// from `state_dir` if present.
    pub async fn open(store: Arc<S>, dataset: &str, state_dir: &Path) -> Result<Self> {
        let state_path = state_dir.join(format!("{dataset}_sync_state.json"));
        let state = match tokio::fs::read(&state_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SyncState::default(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            dataset: dataset.to_string(),
            engine: SnapshotEngine::new(store),
            state: Mutex::new(state),
            state_path,
        })
    }

    /// The dataset this orchestrator manages
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Sync the dataset, choosing full or delta per the current state
    pub async fn sync(&self, items: &Items) -> Result<Cid> {
        self.sync_inner(items, false).await
    }

    /// Force a full snapshot regardless of state
    pub async fn sync_full(&self, items: &Items) -> Result<Cid> {
        self.sync_inner(items, true).await
    }

    #[instrument(skip(self, items), fields(dataset = %self.dataset))]
    async fn sync_inner(&self, items: &Items, force_full: bool) -> Result<Cid> {
        let mut state = self.state.lock().await;

        match (force_full, state.last_base_id) {
            (false, Some(base_id)) => {
                let savings = SnapshotEngine::<S>::delta_savings(items, &state.base_manifest)?;
                let id = self
                    .engine
                    .create_delta(items, &base_id, &state.base_manifest)
                    .await?;

                state.delta_sync_count += 1;
                state.total_bytes_saved += savings.saved_bytes as u64;
                self.persist(&state).await?;

                info!(
                    %id,
                    saved_bytes = savings.saved_bytes,
                    saving_percent = format!("{:.1}", savings.saving_percent),
                    "delta sync completed"
                );
                Ok(id)
            }
            _ => {
                let id = self.engine.create_full_snapshot(items).await?;

                // The only transition that changes the base manifest.
                state.last_base_id = Some(id);
                state.base_manifest = compute_manifest(items)?;
                state.full_sync_count += 1;
                self.persist(&state).await?;

                info!(%id, item_count = items.len(), "full sync completed");
                Ok(id)
            }
        }
    }

    /// Materialize the dataset stored at `id`.
    ///
    /// Full snapshots return their items directly; deltas resolve their
    /// base recursively. `sync` never produces chained deltas, but a delta
    /// whose base is itself a delta still resolves correctly.
    pub async fn load(&self, id: &Cid) -> Result<Items> {
        self.resolve(*id).await
    }

    fn resolve(&self, id: Cid) -> Pin<Box<dyn Future<Output = Result<Items>> + Send + '_>> {
        Box::pin(async move {
            match self.engine.load_object(&id).await? {
                StoredObject::Full(snapshot) => Ok(snapshot.items),
                StoredObject::Delta(delta) => {
                    debug!(base = %delta.base_id, "resolving delta base");
                    let base = self.resolve(delta.base_id).await?;
                    SnapshotEngine::<S>::apply_delta(&base, &delta)
                }
            }
        })
    }

    /// Current sync statistics
    pub async fn stats(&self) -> SyncStats {
        let state = self.state.lock().await;
        let total = state.full_sync_count + state.delta_sync_count;
        let delta_share_percent = if total > 0 {
            (state.delta_sync_count as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        SyncStats {
            dataset: self.dataset.clone(),
            last_base_id: state.last_base_id,
            full_sync_count: state.full_sync_count,
            delta_sync_count: state.delta_sync_count,
            total_bytes_saved: state.total_bytes_saved,
            delta_share_percent,
        }
    }

    /// Reset sync state to its defaults (test aid)
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = SyncState::default();
        self.persist(&state).await
    }

    /// Persist the state document atomically: write a new file, then swap.
    async fn persist(&self, state: &SyncState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp_path = self.state_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.state_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DeltaUpdate;
    use agora_store::MemoryContentStore;
    use serde_json::json;

    fn items(pairs: &[(&str, serde_json::Value)]) -> Items {
        pairs
            .iter()
            .map(|(name, payload)| (name.to_string(), payload.clone()))
            .collect()
    }

    async fn orchestrator(
        dir: &Path,
    ) -> (Arc<MemoryContentStore>, SyncOrchestrator<MemoryContentStore>) {
        let store = Arc::new(MemoryContentStore::new());
        let orchestrator = SyncOrchestrator::open(Arc::clone(&store), "election-2026", dir)
            .await
            .unwrap();
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_first_sync_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let (_, orchestrator) = orchestrator(dir.path()).await;

        let data = items(&[("questions.json", json!({"q1": "transit"}))]);
        let id = orchestrator.sync(&data).await.unwrap();

        let stats = orchestrator.stats().await;
        assert_eq!(stats.full_sync_count, 1);
        assert_eq!(stats.delta_sync_count, 0);
        assert_eq!(stats.last_base_id, Some(id));
    }

    #[tokio::test]
    async fn test_second_sync_is_delta_against_original_base() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orchestrator) = orchestrator(dir.path()).await;

        let v1 = items(&[("questions.json", json!({"q1": "v1"}))]);
        let base_id = orchestrator.sync(&v1).await.unwrap();

        let v2 = items(&[("questions.json", json!({"q1": "v2"}))]);
        let delta2_id = orchestrator.sync(&v2).await.unwrap();

        let v3 = items(&[("questions.json", json!({"q1": "v3"}))]);
        let delta3_id = orchestrator.sync(&v3).await.unwrap();

        // Both deltas reference the original full snapshot, not each other.
        let engine = SnapshotEngine::new(store);
        for id in [delta2_id, delta3_id] {
            match engine.load_object(&id).await.unwrap() {
                StoredObject::Delta(delta) => assert_eq!(delta.base_id, base_id),
                StoredObject::Full(_) => panic!("expected a delta"),
            }
        }

        let stats = orchestrator.stats().await;
        assert_eq!(stats.full_sync_count, 1);
        assert_eq!(stats.delta_sync_count, 2);
        assert_eq!(stats.last_base_id, Some(base_id));
    }

    #[tokio::test]
    async fn test_sync_idempotence_under_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orchestrator) = orchestrator(dir.path()).await;

        let data = items(&[("votes.json", json!({"total": 7}))]);
        orchestrator.sync(&data).await.unwrap();
        let delta_id = orchestrator.sync(&data).await.unwrap();

        let engine = SnapshotEngine::new(store);
        match engine.load_object(&delta_id).await.unwrap() {
            StoredObject::Delta(delta) => {
                assert!(delta.changed_items.is_empty());
                assert!(delta.deleted_items.is_empty());
            }
            StoredObject::Full(_) => panic!("expected a delta"),
        }
    }

    #[tokio::test]
    async fn test_load_resolves_delta_onto_base() {
        let dir = tempfile::tempdir().unwrap();
        let (_, orchestrator) = orchestrator(dir.path()).await;

        let v1 = items(&[("a.json", json!({"x": 1}))]);
        orchestrator.sync(&v1).await.unwrap();

        let v2 = items(&[("a.json", json!({"x": 2})), ("b.json", json!({"y": 1}))]);
        let delta_id = orchestrator.sync(&v2).await.unwrap();

        let loaded = orchestrator.load(&delta_id).await.unwrap();
        assert_eq!(loaded, v2);
    }

    #[tokio::test]
    async fn test_load_follows_chained_delta_bases() {
        // sync never produces this topology; load must still resolve it.
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryContentStore::new());
        let engine = SnapshotEngine::new(Arc::clone(&store));

        let v1 = items(&[("a.json", json!({"x": 1}))]);
        let full_id = engine.create_full_snapshot(&v1).await.unwrap();

        let v2 = items(&[("a.json", json!({"x": 2}))]);
        let delta1_id = engine
            .create_delta(&v2, &full_id, &compute_manifest(&v1).unwrap())
            .await
            .unwrap();

        // Hand-build a delta whose base is the first delta
        let v3 = items(&[("a.json", json!({"x": 3}))]);
        let chained = DeltaUpdate {
            kind: "delta".to_string(),
            created_at: Utc::now(),
            base_id: delta1_id,
            changed_items: v3.clone(),
            deleted_items: vec![],
            result_manifest: compute_manifest(&v3).unwrap(),
        };
        let chained_id = store.put_json(&chained).await.unwrap();

        let orchestrator = SyncOrchestrator::open(store, "chained", dir.path())
            .await
            .unwrap();
        let loaded = orchestrator.load(&chained_id).await.unwrap();
        assert_eq!(loaded, v3);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryContentStore::new());

        let data = items(&[("a.json", json!({"x": 1}))]);
        let base_id = {
            let orchestrator =
                SyncOrchestrator::open(Arc::clone(&store), "election-2026", dir.path())
                    .await
                    .unwrap();
            orchestrator.sync(&data).await.unwrap()
        };

        let reopened = SyncOrchestrator::open(store, "election-2026", dir.path())
            .await
            .unwrap();
        let stats = reopened.stats().await;
        assert_eq!(stats.last_base_id, Some(base_id));
        assert_eq!(stats.full_sync_count, 1);

        // The reopened orchestrator continues with deltas
        let v2 = items(&[("a.json", json!({"x": 2}))]);
        reopened.sync(&v2).await.unwrap();
        assert_eq!(reopened.stats().await.delta_sync_count, 1);
    }

    #[tokio::test]
    async fn test_forced_full_resets_base() {
        let dir = tempfile::tempdir().unwrap();
        let (_, orchestrator) = orchestrator(dir.path()).await;

        let v1 = items(&[("a.json", json!({"x": 1}))]);
        let first = orchestrator.sync(&v1).await.unwrap();

        let v2 = items(&[("a.json", json!({"x": 2}))]);
        let second = orchestrator.sync_full(&v2).await.unwrap();

        assert_ne!(first, second);
        let stats = orchestrator.stats().await;
        assert_eq!(stats.full_sync_count, 2);
        assert_eq!(stats.last_base_id, Some(second));
    }
}
