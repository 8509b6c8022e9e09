//! On-disk repository layout
//!
//! [`Storage`] owns the storage directory: the content store, snapshot
//! headers and layers, the head pointer and the scope configuration.
//!
//! ```text
//! .strata/
//! ├── metadata.json                 # Format version and engine configuration
//! ├── scopes.json                   # Configured scopes
//! ├── head.json                     # Current head snapshot
//! ├── world.lock                    # Advisory lock held by mutating operations
//! ├── refcounts.bin                 # Block reference counts
//! ├── snapshots/<id>.json           # Snapshot headers
//! ├── manifests/<id>-<digest>.bin   # Snapshot layers (bincode)
//! └── objects/                      # Content blocks, sharded by hash prefix
//!     ├── tmp/                      # Staging area for in-flight ingests
//!     └── <2 hex>/<62 hex>
//! ```
//!
//! A snapshot exists exactly when its header exists. Layers are written before
//! the header that names them, and a layers file carries the digest prefix of
//! its content in its name, so rewriting a snapshot's layers never overwrites
//! the file the current header points at. Layer files no header points at are
//! leftovers of an interrupted commit or reparent and are removed by gc.

use crate::compression::CompressionEngine;
use crate::error::{Result, StrataError};
use crate::scope::Scope;
use crate::snapshot::{Snapshot, SnapshotLayers};
use crate::store::ContentStore;
use crate::types::{HeadState, StorageMetadata, StrataConfig};
use crate::utils::durable_write;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current on-disk format
pub const FORMAT_VERSION: u32 = 1;

const METADATA_FILE: &str = "metadata.json";
const SCOPES_FILE: &str = "scopes.json";
const HEAD_FILE: &str = "head.json";
const LOCK_FILE: &str = "world.lock";
const SNAPSHOTS_DIR: &str = "snapshots";
const MANIFESTS_DIR: &str = "manifests";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScopeFile {
    version: u32,
    scopes: Vec<Scope>,
}

/// The storage directory and everything in it
pub struct Storage {
    root: PathBuf,
    store: ContentStore,
    metadata: RwLock<StorageMetadata>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("root", &self.root)
            .field("format_version", &self.metadata.read().format_version)
            .finish()
    }
}

impl Storage {
    /// Whether `root` holds an initialized repository
    pub fn exists(root: &Path) -> bool {
        root.join(METADATA_FILE).is_file()
    }

    /// Create a repository at `root`
    ///
    /// `root` may be missing or an empty directory; anything else is refused,
    /// so an existing repository (or unrelated data) is never clobbered.
    pub fn init(root: PathBuf, config: StrataConfig) -> Result<Self> {
        if Self::exists(&root) {
            return Err(StrataError::StorageAlreadyExists(root));
        }
        if root.is_dir() && fs::read_dir(&root)?.next().is_some() {
            return Err(StrataError::StorageAlreadyExists(root));
        }

        fs::create_dir_all(root.join(SNAPSHOTS_DIR))?;
        fs::create_dir_all(root.join(MANIFESTS_DIR))?;
        let store = ContentStore::create(&root, CompressionEngine::new(config.compression.clone()))?;

        let now = Utc::now();
        let metadata = StorageMetadata {
            format_version: FORMAT_VERSION,
            strata_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now,
            last_accessed: now,
            config,
        };
        durable_write(&root.join(HEAD_FILE), &serde_json::to_vec_pretty(&HeadState::default())?)?;
        durable_write(&root.join(SCOPES_FILE), &serde_json::to_vec_pretty(&ScopeFile::default())?)?;
        // metadata.json last: its presence marks the repository as initialized
        durable_write(&root.join(METADATA_FILE), &serde_json::to_vec_pretty(&metadata)?)?;

        info!("Initialized storage at {:?}", root);
        Ok(Self {
            root,
            store,
            metadata: RwLock::new(metadata),
        })
    }

    /// Open the repository at `root`
    pub fn open(root: PathBuf) -> Result<Self> {
        let metadata_path = root.join(METADATA_FILE);
        let json = match fs::read(&metadata_path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StrataError::StorageNotInitialized(root));
            }
            Err(e) => return Err(e.into()),
        };
        let mut metadata: StorageMetadata = serde_json::from_slice(&json)?;
        if metadata.format_version > FORMAT_VERSION {
            return Err(StrataError::storage(format!(
                "storage format {} is newer than supported format {}",
                metadata.format_version, FORMAT_VERSION
            )));
        }
        metadata.last_accessed = Utc::now();
        fs::create_dir_all(root.join(SNAPSHOTS_DIR))?;
        fs::create_dir_all(root.join(MANIFESTS_DIR))?;

        let store = ContentStore::open(&root, CompressionEngine::new(metadata.config.compression.clone()))?;
        debug!("Opened storage at {:?}", root);
        Ok(Self {
            root,
            store,
            metadata: RwLock::new(metadata),
        })
    }

    /// Storage directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content store
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Copy of the storage metadata
    pub fn metadata(&self) -> StorageMetadata {
        self.metadata.read().clone()
    }

    /// Copy of the engine configuration
    pub fn config(&self) -> StrataConfig {
        self.metadata.read().config.clone()
    }

    /// Modify and persist the storage metadata
    pub fn update_metadata<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut StorageMetadata),
    {
        let mut metadata = self.metadata.write();
        updater(&mut metadata);
        metadata.last_accessed = Utc::now();
        durable_write(&self.root.join(METADATA_FILE), &serde_json::to_vec_pretty(&*metadata)?)
    }

    /// Path of the world lock file
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    // ---- snapshots ----

    fn header_path(&self, id: &str) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(format!("{}.json", id))
    }

    fn layers_path(&self, id: &str, digest: &str) -> PathBuf {
        let tag = &digest[..16.min(digest.len())];
        self.root.join(MANIFESTS_DIR).join(format!("{}-{}.bin", id, tag))
    }

    /// Write a snapshot's layers; must happen before its header
    pub fn store_layers(&self, layers: &SnapshotLayers) -> Result<()> {
        let digest = layers.digest()?;
        let bytes = layers.encode()?;
        durable_write(&self.layers_path(&layers.snapshot_id, &digest), &bytes)?;
        debug!(
            "Stored layers for {} ({} entries, {} bytes)",
            crate::utils::short_id(&layers.snapshot_id),
            layers.entry_count(),
            bytes.len()
        );
        Ok(())
    }

    /// Write (or replace) a snapshot header, making the snapshot visible
    pub fn store_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        durable_write(&self.header_path(&snapshot.id), &serde_json::to_vec_pretty(snapshot)?)?;
        debug!("Stored snapshot {}", snapshot.short_id());
        Ok(())
    }

    /// Load and integrity-check a snapshot header
    pub fn load_snapshot(&self, id: &str) -> Result<Snapshot> {
        let json = match fs::read(self.header_path(id)) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StrataError::SnapshotNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&json).map_err(|e| StrataError::InvalidSnapshot {
            id: id.to_string(),
            reason: format!("unreadable header: {}", e),
        })?;
        if snapshot.id != id {
            return Err(StrataError::InvalidSnapshot {
                id: id.to_string(),
                reason: format!("header carries id {}", snapshot.id),
            });
        }
        if !snapshot.verify_integrity() {
            return Err(StrataError::InvalidSnapshot {
                id: id.to_string(),
                reason: "state hash mismatch".to_string(),
            });
        }
        Ok(snapshot)
    }

    /// Load and verify the layers a header points at
    pub fn load_layers(&self, snapshot: &Snapshot) -> Result<SnapshotLayers> {
        let path = self.layers_path(&snapshot.id, &snapshot.layers_digest);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StrataError::InvalidSnapshot {
                    id: snapshot.id.clone(),
                    reason: "layers file is missing".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let layers = SnapshotLayers::decode(&bytes).map_err(|e| StrataError::InvalidSnapshot {
            id: snapshot.id.clone(),
            reason: format!("unreadable layers: {}", e),
        })?;
        snapshot.verify_layers(&layers)?;
        Ok(layers)
    }

    /// Whether a header exists for `id`
    pub fn snapshot_exists(&self, id: &str) -> bool {
        self.header_path(id).is_file()
    }

    /// Ids of all stored snapshot headers, sorted
    pub fn list_snapshot_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(SNAPSHOTS_DIR))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a snapshot: header first, then its layers
    pub fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        match fs::remove_file(self.header_path(&snapshot.id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        crate::utils::sync_dir(&self.root.join(SNAPSHOTS_DIR))?;
        self.delete_layers_file(&snapshot.id, &snapshot.layers_digest)?;
        debug!("Deleted snapshot {}", snapshot.short_id());
        Ok(())
    }

    /// Remove one layers file, if present
    pub fn delete_layers_file(&self, id: &str, digest: &str) -> Result<()> {
        match fs::remove_file(self.layers_path(id, digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Layer files that no current header points at
    pub fn orphan_layer_files(&self, live: &[Snapshot]) -> Result<Vec<PathBuf>> {
        let referenced: BTreeSet<PathBuf> = live
            .iter()
            .map(|s| self.layers_path(&s.id, &s.layers_digest))
            .collect();
        let mut orphans = Vec::new();
        for entry in fs::read_dir(self.root.join(MANIFESTS_DIR))? {
            let path = entry?.path();
            if path.is_file() && !referenced.contains(&path) {
                orphans.push(path);
            }
        }
        orphans.sort();
        Ok(orphans)
    }

    // ---- head ----

    /// Load the head pointer
    pub fn load_head(&self) -> Result<HeadState> {
        match fs::read(self.root.join(HEAD_FILE)) {
            Ok(json) => Ok(serde_json::from_slice(&json)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Head file is missing; treating head as unset");
                Ok(HeadState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the head pointer
    pub fn save_head(&self, head: Option<&str>) -> Result<()> {
        let state = HeadState {
            head: head.map(str::to_string),
            version: FORMAT_VERSION,
        };
        durable_write(&self.root.join(HEAD_FILE), &serde_json::to_vec_pretty(&state)?)
    }

    // ---- scopes ----

    /// Load the configured scopes
    pub fn load_scopes(&self) -> Result<Vec<Scope>> {
        match fs::read(self.root.join(SCOPES_FILE)) {
            Ok(json) => {
                let file: ScopeFile = serde_json::from_slice(&json)?;
                Ok(file.scopes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the configured scopes
    pub fn save_scopes(&self, scopes: &[Scope]) -> Result<()> {
        let file = ScopeFile {
            version: FORMAT_VERSION,
            scopes: scopes.to_vec(),
        };
        durable_write(&self.root.join(SCOPES_FILE), &serde_json::to_vec_pretty(&file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Layer;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join(".strata");
        let storage = Storage::init(root.clone(), StrataConfig::new(root)).unwrap();
        (storage, temp_dir)
    }

    fn root_snapshot(storage: &Storage) -> (Snapshot, SnapshotLayers) {
        let id = Snapshot::generate_id();
        let mut layers = SnapshotLayers::new(&id);
        layers.scopes.insert("game".into(), Layer { full: true, ..Layer::default() });
        let snapshot = Snapshot::new(id, None, "Vanilla", &layers, false).unwrap();
        storage.store_layers(&layers).unwrap();
        storage.store_snapshot(&snapshot).unwrap();
        (snapshot, layers)
    }

    #[test]
    fn test_storage_init_and_open() {
        let (storage, _temp) = create_test_storage();
        let root = storage.root().to_path_buf();
        assert!(root.join("metadata.json").exists());
        assert!(root.join("snapshots").is_dir());
        assert!(root.join("manifests").is_dir());
        assert!(root.join("objects").is_dir());
        drop(storage);

        let reopened = Storage::open(root.clone()).unwrap();
        assert_eq!(reopened.metadata().format_version, FORMAT_VERSION);
        assert!(matches!(
            Storage::init(root.clone(), StrataConfig::new(root)),
            Err(StrataError::StorageAlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_uninitialized() {
        let temp_dir = TempDir::new().unwrap();
        let result = Storage::open(temp_dir.path().join("nothing"));
        assert!(matches!(result, Err(StrataError::StorageNotInitialized(_))));
    }

    #[test]
    fn test_init_refuses_non_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("unrelated.txt"), b"x").unwrap();
        let root = temp_dir.path().to_path_buf();
        assert!(Storage::init(root.clone(), StrataConfig::new(root)).is_err());
    }

    #[test]
    fn test_snapshot_storage() {
        let (storage, _temp) = create_test_storage();
        let (snapshot, layers) = root_snapshot(&storage);

        let loaded = storage.load_snapshot(&snapshot.id).unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(storage.load_layers(&loaded).unwrap(), layers);
        assert_eq!(storage.list_snapshot_ids().unwrap(), vec![snapshot.id.clone()]);
        assert!(storage.orphan_layer_files(&[loaded.clone()]).unwrap().is_empty());

        storage.delete_snapshot(&loaded).unwrap();
        assert!(!storage.snapshot_exists(&snapshot.id));
        assert!(matches!(
            storage.load_snapshot(&snapshot.id),
            Err(StrataError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (storage, _temp) = create_test_storage();
        let (snapshot, _) = root_snapshot(&storage);

        let path = storage.header_path(&snapshot.id);
        let json = fs::read_to_string(&path).unwrap().replace("Vanilla", "Modded");
        fs::write(&path, json).unwrap();

        let err = storage.load_snapshot(&snapshot.id).unwrap_err();
        assert!(matches!(err, StrataError::InvalidSnapshot { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_header_without_layers_is_detected() {
        let (storage, _temp) = create_test_storage();
        let (snapshot, _) = root_snapshot(&storage);
        storage.delete_layers_file(&snapshot.id, &snapshot.layers_digest).unwrap();
        assert!(matches!(
            storage.load_layers(&snapshot),
            Err(StrataError::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn test_orphan_layers_listed() {
        let (storage, _temp) = create_test_storage();
        let mut layers = SnapshotLayers::new("never-committed");
        layers.scopes.insert("game".into(), Layer::delta());
        storage.store_layers(&layers).unwrap();
        assert_eq!(storage.orphan_layer_files(&[]).unwrap().len(), 1);
    }

    #[test]
    fn test_head_and_scopes_persist() {
        let (storage, _temp) = create_test_storage();
        assert_eq!(storage.load_head().unwrap().head, None);
        storage.save_head(Some("abc")).unwrap();
        assert_eq!(storage.load_head().unwrap().head.as_deref(), Some("abc"));

        assert!(storage.load_scopes().unwrap().is_empty());
        let scope = Scope::new("game", temp_scope_path());
        storage.save_scopes(std::slice::from_ref(&scope)).unwrap();
        assert_eq!(storage.load_scopes().unwrap(), vec![scope]);
    }

    fn temp_scope_path() -> PathBuf {
        std::env::temp_dir()
    }
}
