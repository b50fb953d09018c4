//! Snapshot & delta engine
//!
//! A dataset is a map of named JSON items. A full snapshot stores every
//! item plus a manifest of per-item digests; a delta stores only the items
//! that changed (or were deleted) relative to a base manifest. Applying a
//! delta must reproduce the delta's result manifest exactly — a mismatch
//! is an integrity violation and the caller never sees partial data.
//!
//! Diffs are computed at whole-item granularity; Merkle-tree diffing is
//! out of scope.

use crate::{CoreError, Result};
use agora_store::{canonical_json, ContentStore};
use chrono::{DateTime, Utc};
use cid::Cid;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// A dataset's items: name -> JSON payload
pub type Items = BTreeMap<String, Value>;

/// Per-item name -> content-digest map describing a snapshot's contents
pub type Manifest = BTreeMap<String, String>;

/// Compute the manifest for a set of items.
///
/// Each digest is BLAKE3 over the item's canonical JSON, so two writers
/// with identical items always derive identical manifests.
pub fn compute_manifest(items: &Items) -> Result<Manifest> {
    items
        .iter()
        .map(|(name, payload)| {
            let bytes = canonical_json(payload)?;
            Ok((name.clone(), blake3::hash(&bytes).to_hex().to_string()))
        })
        .collect()
}

/// A self-contained snapshot of a whole dataset
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSnapshot {
    /// Always `"full"`
    pub kind: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Every item of the dataset
    pub items: Items,
    /// Per-item digests over `items`
    pub manifest: Manifest,
}

impl FullSnapshot {
    /// Build a snapshot from items, computing its manifest
    pub fn new(items: Items) -> Result<Self> {
        let manifest = compute_manifest(&items)?;
        Ok(Self {
            kind: "full".to_string(),
            created_at: Utc::now(),
            items,
            manifest,
        })
    }
}

/// A minimal update relative to one base object
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaUpdate {
    /// Always `"delta"`
    pub kind: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// The object this delta applies to (a full snapshot in normal operation)
    #[serde(with = "crate::cid_serde::cid_string")]
    pub base_id: Cid,
    /// Items whose digest differs from the base, or that are newly present
    pub changed_items: Items,
    /// Items present in the base but absent now
    pub deleted_items: Vec<String>,
    /// Manifest the dataset must have after applying this delta
    pub result_manifest: Manifest,
}

/// A stored object resolved from the content store
#[derive(Clone, Debug)]
pub enum StoredObject {
    /// A self-contained full snapshot
    Full(FullSnapshot),
    /// A delta referencing a base object
    Delta(DeltaUpdate),
}

/// Space-saving report for a delta relative to a full snapshot
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeltaSavings {
    /// Canonical size of the full dataset in bytes
    pub full_size_bytes: usize,
    /// Canonical size of the delta payload in bytes
    pub delta_size_bytes: usize,
    /// Bytes saved by shipping the delta instead of the full dataset
    pub saved_bytes: usize,
    /// Saved bytes as a percentage of the full size
    pub saving_percent: f64,
    /// Number of changed items in the delta
    pub changed_items: usize,
    /// Number of deleted items in the delta
    pub deleted_items: usize,
}

/// Builds, verifies, and applies snapshots and deltas over a content store
pub struct SnapshotEngine<S: ContentStore> {
    store: Arc<S>,
}

impl<S: ContentStore> SnapshotEngine<S> {
    /// Create a new engine over the given store
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Access the underlying store handle
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Store a full snapshot of `items` and return its id
    #[instrument(skip(self, items))]
    pub async fn create_full_snapshot(&self, items: &Items) -> Result<Cid> {
        let snapshot = FullSnapshot::new(items.clone())?;
        let id = self.store.put_json(&snapshot).await?;
        debug!(%id, item_count = items.len(), "created full snapshot");
        Ok(id)
    }

    /// Store a delta of `current` relative to `base_manifest` and return
    /// its id. Unchanged items are never included.
    #[instrument(skip(self, current, base_manifest))]
    pub async fn create_delta(
        &self,
        current: &Items,
        base_id: &Cid,
        base_manifest: &Manifest,
    ) -> Result<Cid> {
        let result_manifest = compute_manifest(current)?;

        let mut changed_items = Items::new();
        for (name, payload) in current {
            if base_manifest.get(name) != result_manifest.get(name) {
                changed_items.insert(name.clone(), payload.clone());
            }
        }

        let deleted_items: Vec<String> = base_manifest
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();

        let delta = DeltaUpdate {
            kind: "delta".to_string(),
            created_at: Utc::now(),
            base_id: *base_id,
            changed_items,
            deleted_items,
            result_manifest,
        };

        let id = self.store.put_json(&delta).await?;
        debug!(
            %id,
            changed = delta.changed_items.len(),
            deleted = delta.deleted_items.len(),
            "created delta"
        );
        Ok(id)
    }

    /// Apply a delta onto its base items.
    ///
    /// The reconstructed manifest is compared field-by-field against the
    /// delta's result manifest; any mismatch aborts with
    /// `IntegrityViolation` before the caller sees the data.
    pub fn apply_delta(base_items: &Items, delta: &DeltaUpdate) -> Result<Items> {
        let mut result = base_items.clone();

        for (name, payload) in &delta.changed_items {
            result.insert(name.clone(), payload.clone());
        }
        for name in &delta.deleted_items {
            result.remove(name);
        }

        let manifest = compute_manifest(&result)?;
        if manifest != delta.result_manifest {
            let detail = first_manifest_mismatch(&manifest, &delta.result_manifest);
            return Err(CoreError::IntegrityViolation(format!(
                "delta reconstruction mismatch: {detail}"
            )));
        }

        Ok(result)
    }

    /// Load the full snapshot at `id` and check that every expected item is
    /// present and that every stored digest matches a fresh digest.
    #[instrument(skip(self, expected_names))]
    pub async fn verify_snapshot_integrity(
        &self,
        id: &Cid,
        expected_names: &[&str],
    ) -> Result<bool> {
        let snapshot = match self.load_object(id).await? {
            StoredObject::Full(snapshot) => snapshot,
            StoredObject::Delta(_) => {
                warn!(%id, "expected a full snapshot, found a delta");
                return Ok(false);
            }
        };

        for name in expected_names {
            if !snapshot.items.contains_key(*name) {
                warn!(%id, item = name, "missing item in snapshot");
                return Ok(false);
            }
        }

        let fresh = compute_manifest(&snapshot.items)?;
        if fresh != snapshot.manifest {
            warn!(%id, "snapshot manifest does not match item digests");
            return Ok(false);
        }

        Ok(true)
    }

    /// Measure how many bytes a delta saves relative to shipping the full
    /// dataset.
    pub fn delta_savings(current: &Items, base_manifest: &Manifest) -> Result<DeltaSavings> {
        let current_manifest = compute_manifest(current)?;

        let mut changed_items = Items::new();
        for (name, payload) in current {
            if base_manifest.get(name) != current_manifest.get(name) {
                changed_items.insert(name.clone(), payload.clone());
            }
        }
        let deleted_items: Vec<String> = base_manifest
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();

        let full_size_bytes = canonical_json(current)?.len();
        let delta_size_bytes = canonical_json(&json!({
            "changedItems": changed_items,
            "deletedItems": deleted_items,
        }))?
        .len();

        let saved_bytes = full_size_bytes.saturating_sub(delta_size_bytes);
        let saving_percent = if full_size_bytes > 0 {
            (saved_bytes as f64 / full_size_bytes as f64) * 100.0
        } else {
            0.0
        };

        Ok(DeltaSavings {
            full_size_bytes,
            delta_size_bytes,
            saved_bytes,
            saving_percent,
            changed_items: changed_items.len(),
            deleted_items: deleted_items.len(),
        })
    }

    /// Load and classify the stored object at `id`.
    ///
    /// Unknown object kinds are `UnsupportedFormat`.
    pub async fn load_object(&self, id: &Cid) -> Result<StoredObject> {
        let value: Value = self.store.get_json(id).await?;
        match value.get("kind").and_then(Value::as_str) {
            Some("full") => Ok(StoredObject::Full(serde_json::from_value(value)?)),
            Some("delta") => Ok(StoredObject::Delta(serde_json::from_value(value)?)),
            Some(other) => Err(CoreError::UnsupportedFormat(format!(
                "unknown object kind: {other}"
            ))),
            None => Err(CoreError::UnsupportedFormat(
                "stored object has no kind field".to_string(),
            )),
        }
    }
}

fn first_manifest_mismatch(actual: &Manifest, expected: &Manifest) -> String {
    for (name, digest) in expected {
        match actual.get(name) {
            None => return format!("item {name} missing after reconstruction"),
            Some(actual_digest) if actual_digest != digest => {
                return format!("item {name} digest differs")
            }
            Some(_) => {}
        }
    }
    for name in actual.keys() {
        if !expected.contains_key(name) {
            return format!("unexpected item {name} after reconstruction");
        }
    }
    "manifests differ".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_store::MemoryContentStore;
    use proptest::prelude::*;

    fn items(pairs: &[(&str, Value)]) -> Items {
        pairs
            .iter()
            .map(|(name, payload)| (name.to_string(), payload.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_full_snapshot_roundtrip() {
        let store = Arc::new(MemoryContentStore::new());
        let engine = SnapshotEngine::new(store);

        let data = items(&[("a.json", json!({"x": 1})), ("b.json", json!({"y": 2}))]);
        let id = engine.create_full_snapshot(&data).await.unwrap();

        match engine.load_object(&id).await.unwrap() {
            StoredObject::Full(snapshot) => {
                assert_eq!(snapshot.items, data);
                assert_eq!(snapshot.manifest, compute_manifest(&data).unwrap());
            }
            StoredObject::Delta(_) => panic!("expected a full snapshot"),
        }
    }

    #[tokio::test]
    async fn test_delta_contains_only_changes() {
        let store = Arc::new(MemoryContentStore::new());
        let engine = SnapshotEngine::new(store);

        let base = items(&[
            ("a.json", json!({"x": 1})),
            ("b.json", json!({"y": 1})),
            ("c.json", json!({"z": 1})),
        ]);
        let base_id = engine.create_full_snapshot(&base).await.unwrap();
        let base_manifest = compute_manifest(&base).unwrap();

        // a changed, c deleted, d added, b untouched
        let current = items(&[
            ("a.json", json!({"x": 2})),
            ("b.json", json!({"y": 1})),
            ("d.json", json!({"w": 1})),
        ]);

        let delta_id = engine
            .create_delta(&current, &base_id, &base_manifest)
            .await
            .unwrap();
        let delta = match engine.load_object(&delta_id).await.unwrap() {
            StoredObject::Delta(delta) => delta,
            StoredObject::Full(_) => panic!("expected a delta"),
        };

        assert_eq!(delta.base_id, base_id);
        assert_eq!(
            delta.changed_items.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["a.json", "d.json"]
        );
        assert_eq!(delta.deleted_items, vec!["c.json".to_string()]);
        assert!(!delta.changed_items.contains_key("b.json"));
    }

    #[tokio::test]
    async fn test_apply_delta_reconstructs_current() {
        let store = Arc::new(MemoryContentStore::new());
        let engine = SnapshotEngine::new(store);

        let base = items(&[("a.json", json!({"x": 1}))]);
        let base_id = engine.create_full_snapshot(&base).await.unwrap();
        let base_manifest = compute_manifest(&base).unwrap();

        let current = items(&[("a.json", json!({"x": 2})), ("b.json", json!({"y": 1}))]);
        let delta_id = engine
            .create_delta(&current, &base_id, &base_manifest)
            .await
            .unwrap();
        let delta = match engine.load_object(&delta_id).await.unwrap() {
            StoredObject::Delta(delta) => delta,
            StoredObject::Full(_) => panic!("expected a delta"),
        };

        let rebuilt = SnapshotEngine::<MemoryContentStore>::apply_delta(&base, &delta).unwrap();
        assert_eq!(rebuilt, current);
    }

    #[tokio::test]
    async fn test_apply_delta_detects_tampering() {
        let base = items(&[("a.json", json!({"x": 1}))]);
        let current = items(&[("a.json", json!({"x": 2}))]);

        let mut delta = DeltaUpdate {
            kind: "delta".to_string(),
            created_at: Utc::now(),
            base_id: agora_store::create_cid(b"base", agora_store::CidCodec::DagJson),
            changed_items: current.clone(),
            deleted_items: vec![],
            result_manifest: compute_manifest(&current).unwrap(),
        };

        // Tamper with the payload after the manifest was computed
        delta
            .changed_items
            .insert("a.json".to_string(), json!({"x": 999}));

        let result = SnapshotEngine::<MemoryContentStore>::apply_delta(&base, &delta);
        assert!(matches!(result, Err(CoreError::IntegrityViolation(_))));
    }

    #[tokio::test]
    async fn test_verify_snapshot_integrity() {
        let store = Arc::new(MemoryContentStore::new());
        let engine = SnapshotEngine::new(store);

        let data = items(&[("a.json", json!({"x": 1})), ("b.json", json!({"y": 2}))]);
        let id = engine.create_full_snapshot(&data).await.unwrap();

        assert!(engine
            .verify_snapshot_integrity(&id, &["a.json", "b.json"])
            .await
            .unwrap());
        assert!(!engine
            .verify_snapshot_integrity(&id, &["a.json", "missing.json"])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_unsupported() {
        let store = Arc::new(MemoryContentStore::new());
        let id = store
            .put_json(&json!({"kind": "parchment", "items": {}}))
            .await
            .unwrap();

        let engine = SnapshotEngine::new(store);
        assert!(matches!(
            engine.load_object(&id).await,
            Err(CoreError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_delta_savings() {
        let base = items(&[
            ("a.json", json!({"x": "a long stable payload that never changes"})),
            ("b.json", json!({"y": 1})),
        ]);
        let base_manifest = compute_manifest(&base).unwrap();

        let mut current = base.clone();
        current.insert("b.json".to_string(), json!({"y": 2}));

        let savings =
            SnapshotEngine::<MemoryContentStore>::delta_savings(&current, &base_manifest).unwrap();
        assert_eq!(savings.changed_items, 1);
        assert_eq!(savings.deleted_items, 0);
        assert!(savings.saved_bytes > 0);
        assert!(savings.saving_percent > 0.0);
    }

    proptest! {
        // Delta round-trip: applying a delta onto its base reproduces the
        // current items exactly, for arbitrary add/change/remove mixes.
        #[test]
        fn prop_delta_roundtrip(
            base_pairs in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 0..8),
            current_pairs in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 0..8),
        ) {
            let base: Items = base_pairs
                .into_iter()
                .map(|(name, v)| (name, json!({"v": v})))
                .collect();
            let current: Items = current_pairs
                .into_iter()
                .map(|(name, v)| (name, json!({"v": v})))
                .collect();

            let base_manifest = compute_manifest(&base).unwrap();
            let result_manifest = compute_manifest(&current).unwrap();

            let mut changed_items = Items::new();
            for (name, payload) in &current {
                if base_manifest.get(name) != result_manifest.get(name) {
                    changed_items.insert(name.clone(), payload.clone());
                }
            }
            let deleted_items: Vec<String> = base_manifest
                .keys()
                .filter(|name| !current.contains_key(*name))
                .cloned()
                .collect();

            let delta = DeltaUpdate {
                kind: "delta".to_string(),
                created_at: Utc::now(),
                base_id: agora_store::create_cid(b"base", agora_store::CidCodec::DagJson),
                changed_items,
                deleted_items,
                result_manifest,
            };

            let rebuilt =
                SnapshotEngine::<MemoryContentStore>::apply_delta(&base, &delta).unwrap();
            prop_assert_eq!(rebuilt, current);
        }
    }
}
