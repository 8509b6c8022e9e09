//! Snapshot records
//!
//! A snapshot is an immutable node of the lineage. Its header (id, parent,
//! label, timestamp, per-scope statistics) is stored as JSON; its layers (one
//! [`Layer`] per scope it touched) are stored separately in bincode. The
//! header carries a digest of the layers and a state hash over everything,
//! so either file being altered after the fact is detected on load.
//!
//! ## Examples
//!
//! ```rust
//! use strata::snapshot::{Snapshot, SnapshotLayers};
//! use strata::types::Layer;
//!
//! let mut layers = SnapshotLayers::new("vanilla-id");
//! layers.scopes.insert("game".to_string(), Layer { full: true, ..Layer::default() });
//!
//! let snapshot = Snapshot::new("vanilla-id".to_string(), None, "Vanilla", &layers, false).unwrap();
//! assert!(snapshot.is_root());
//! assert!(snapshot.verify_integrity());
//! ```

use crate::error::{Result, StrataError};
use crate::types::{Layer, LayerEntry};
use crate::utils::{self, format_bytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Per-scope summary of a snapshot's layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Whether the layer is a full manifest
    pub full: bool,
    /// Present entries
    pub entries: usize,
    /// Tombstones
    pub tombstones: usize,
    /// Content bytes of present entries
    pub bytes: u64,
}

impl LayerStats {
    fn of(layer: &Layer) -> Self {
        Self {
            full: layer.full,
            entries: layer.present_count(),
            tombstones: layer.tombstone_count(),
            bytes: layer.present_bytes(),
        }
    }
}

/// Information about the host system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,
    /// Operating system
    pub os: String,
    /// Username (if available)
    pub username: Option<String>,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            username: std::env::var("USER").or_else(|_| std::env::var("USERNAME")).ok(),
        }
    }
}

/// Header of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique id (uuid v4)
    pub id: String,
    /// Parent id; `None` only for the root
    pub parent_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Human label
    pub label: String,
    /// Layer summary per scope that has a layer
    pub scopes: BTreeMap<String, LayerStats>,
    /// Whether it was committed from a scan that could not read every path
    pub partial: bool,
    /// Host that created it
    pub host: HostInfo,
    /// SHA-256 of the encoded layers
    pub layers_digest: String,
    /// SHA-256 over the header fields and the layers digest
    pub state_hash: String,
}

impl Snapshot {
    /// Build a header for `layers`
    pub fn new(
        id: String,
        parent_id: Option<String>,
        label: impl Into<String>,
        layers: &SnapshotLayers,
        partial: bool,
    ) -> Result<Self> {
        let mut snapshot = Self {
            id,
            parent_id,
            created_at: Utc::now(),
            label: label.into(),
            scopes: layers.scopes.iter().map(|(name, l)| (name.clone(), LayerStats::of(l))).collect(),
            partial,
            host: HostInfo::default(),
            layers_digest: layers.digest()?,
            state_hash: String::new(),
        };
        snapshot.state_hash = snapshot.compute_state_hash();
        Ok(snapshot)
    }

    /// Generate a fresh snapshot id
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Compute the state hash over all header fields
    pub fn compute_state_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.id);
        hasher.update([0]);
        hasher.update(self.parent_id.as_deref().unwrap_or(""));
        hasher.update([0]);
        hasher.update(self.created_at.to_rfc3339());
        hasher.update([0]);
        hasher.update(&self.label);
        hasher.update([0]);
        if let Ok(scope_bytes) = serde_json::to_vec(&self.scopes) {
            hasher.update(&scope_bytes);
        }
        hasher.update([self.partial as u8]);
        hasher.update(&self.layers_digest);
        hex::encode(hasher.finalize())
    }

    /// Whether the stored state hash still matches the header
    pub fn verify_integrity(&self) -> bool {
        self.state_hash == self.compute_state_hash()
    }

    /// Check that `layers` are the ones this header was created for
    pub fn verify_layers(&self, layers: &SnapshotLayers) -> Result<()> {
        if layers.snapshot_id != self.id {
            return Err(StrataError::InvalidSnapshot {
                id: self.id.clone(),
                reason: format!("layers belong to snapshot {}", layers.snapshot_id),
            });
        }
        let digest = layers.digest()?;
        if digest != self.layers_digest {
            return Err(StrataError::InvalidSnapshot {
                id: self.id.clone(),
                reason: "layer digest mismatch".to_string(),
            });
        }
        Ok(())
    }

    /// Attach to a new parent with replacement layers
    ///
    /// Used when the old parent is pruned under the reparent policy; the
    /// caller folds the old parent's layers into `layers` first.
    pub fn reattach(&mut self, parent_id: Option<String>, layers: &SnapshotLayers) -> Result<()> {
        self.parent_id = parent_id;
        self.scopes = layers.scopes.iter().map(|(name, l)| (name.clone(), LayerStats::of(l))).collect();
        self.layers_digest = layers.digest()?;
        self.state_hash = self.compute_state_hash();
        Ok(())
    }

    /// Whether this is the lineage root
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether this snapshot has a layer for `scope`
    pub fn has_layer(&self, scope: &str) -> bool {
        self.scopes.contains_key(scope)
    }

    /// Content bytes stored in this snapshot's own layers
    pub fn layer_bytes(&self) -> u64 {
        self.scopes.values().map(|s| s.bytes).sum()
    }

    /// Short form of the id
    pub fn short_id(&self) -> &str {
        utils::short_id(&self.id)
    }

    /// One-line description for listings
    pub fn display_format(&self) -> String {
        let changes: usize = self.scopes.values().map(|s| s.entries + s.tombstones).sum();
        format!(
            "{} {} - {} ({} change(s), {}){}",
            self.short_id(),
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.label,
            changes,
            format_bytes(self.layer_bytes()),
            if self.partial { " [partial]" } else { "" }
        )
    }
}

/// Layers of one snapshot, keyed by scope name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLayers {
    /// Owning snapshot
    pub snapshot_id: String,
    /// Scope name to layer
    pub scopes: BTreeMap<String, Layer>,
}

impl SnapshotLayers {
    /// Empty layer set for `snapshot_id`
    pub fn new(snapshot_id: impl Into<String>) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            scopes: BTreeMap::new(),
        }
    }

    /// Encode in the on-disk format
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Decode from the on-disk format
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (layers, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(layers)
    }

    /// SHA-256 of the encoded scope layers
    pub fn digest(&self) -> Result<String> {
        let bytes = bincode::serde::encode_to_vec(&self.scopes, bincode::config::standard())?;
        Ok(utils::hash_data(&bytes))
    }

    /// Every content hash referenced, once per present entry
    pub fn referenced_hashes(&self) -> impl Iterator<Item = &str> {
        self.scopes.values().flat_map(Layer::referenced_hashes)
    }

    /// Number of entries (present and tombstones) across scopes
    pub fn entry_count(&self) -> usize {
        self.scopes.values().map(|l| l.entries.len()).sum()
    }
}

/// Fold `lower` (an ancestor's layer) under `upper` (its child's layer)
///
/// The result, applied on top of `lower`'s parent state, yields the same
/// state as applying `lower` then `upper`.
pub fn fold_layers(lower: &Layer, upper: &Layer) -> Layer {
    let mut entries = lower.entries.clone();
    for (path, entry) in &upper.entries {
        entries.insert(path.clone(), entry.clone());
    }
    Layer {
        full: lower.full || upper.full,
        entries,
    }
}

/// Drop tombstones from a layer that becomes a root layer
pub fn into_root_layer(layer: Layer) -> Layer {
    Layer {
        full: true,
        entries: layer
            .entries
            .into_iter()
            .filter(|(_, e)| matches!(e, LayerEntry::Present(_)))
            .collect(),
    }
}
