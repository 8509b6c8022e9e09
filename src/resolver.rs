//! Manifest resolution
//!
//! The logical state of a scope at snapshot `S` is obtained by applying the
//! layers of the chain root → ... → `S` in order: a present entry overwrites
//! the path, a tombstone removes it. The output holds live entries only.
//!
//! Full layers list every live path (plus tombstones for everything the
//! parent had), so resolution may start at the nearest full layer instead of
//! the root. [`ManifestResolver::resolve_full_merge`] ignores that shortcut
//! and always merges from the root; both must agree, which `verify` checks.

use crate::error::{Result, StrataError};
use crate::lineage::LineageGraph;
use crate::snapshot::{Snapshot, SnapshotLayers};
use crate::storage::Storage;
use crate::types::{Layer, LayerEntry, Manifest};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

/// Where snapshot layers are loaded from
pub trait LayerSource: Send + Sync {
    /// Load the layers a header points at
    fn load_layers(&self, snapshot: &Snapshot) -> Result<SnapshotLayers>;
}

impl LayerSource for Storage {
    fn load_layers(&self, snapshot: &Snapshot) -> Result<SnapshotLayers> {
        Storage::load_layers(self, snapshot)
    }
}

/// Resolves snapshot manifests against one lineage graph
pub struct ManifestResolver<'a> {
    graph: &'a LineageGraph,
    source: &'a dyn LayerSource,
    cache: Mutex<BTreeMap<String, Arc<SnapshotLayers>>>,
}

impl<'a> ManifestResolver<'a> {
    /// Resolver over `graph`, loading layers from `source`
    pub fn new(graph: &'a LineageGraph, source: &'a dyn LayerSource) -> Self {
        Self {
            graph,
            source,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Layers of one snapshot, cached for the resolver's lifetime
    pub fn layers(&self, snapshot: &Snapshot) -> Result<Arc<SnapshotLayers>> {
        if let Some(cached) = self.cache.lock().get(&snapshot.id) {
            return Ok(Arc::clone(cached));
        }
        let layers = Arc::new(self.source.load_layers(snapshot)?);
        self.cache.lock().insert(snapshot.id.clone(), Arc::clone(&layers));
        Ok(layers)
    }

    /// Full manifest of `scope` at snapshot `id`
    ///
    /// A scope that has no layer anywhere in the chain resolves to an empty
    /// manifest; use [`has_history`](Self::has_history) to tell that apart
    /// from a scope whose files were all deleted.
    pub fn resolve(&self, id: &str, scope: &str) -> Result<Manifest> {
        let chain = self.graph.chain(id)?;
        let start = chain
            .iter()
            .rposition(|s| s.scopes.get(scope).map(|stats| stats.full).unwrap_or(false))
            .unwrap_or(0);
        trace!(
            "Resolving {} for scope '{}' from depth {} of {}",
            crate::utils::short_id(id),
            scope,
            start,
            chain.len() - 1
        );
        self.merge(&chain[start..], id, scope)
    }

    /// Full manifest of `scope` at `id`, merging every layer from the root
    pub fn resolve_full_merge(&self, id: &str, scope: &str) -> Result<Manifest> {
        let chain = self.graph.chain(id)?;
        self.merge(&chain, id, scope)
    }

    /// Manifests of every scope with history at `id`
    pub fn resolve_all(&self, id: &str) -> Result<BTreeMap<String, Manifest>> {
        let mut manifests = BTreeMap::new();
        for scope in self.scopes_with_history(id)? {
            let manifest = self.resolve(id, &scope)?;
            manifests.insert(scope, manifest);
        }
        Ok(manifests)
    }

    /// Whether any snapshot in the chain of `id` has a layer for `scope`
    pub fn has_history(&self, id: &str, scope: &str) -> Result<bool> {
        Ok(self.graph.chain(id)?.iter().any(|s| s.has_layer(scope)))
    }

    /// Scopes with a layer somewhere in the chain of `id`
    pub fn scopes_with_history(&self, id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .graph
            .chain(id)?
            .iter()
            .flat_map(|s| s.scopes.keys().cloned())
            .collect())
    }

    fn merge(&self, chain: &[&Snapshot], id: &str, scope: &str) -> Result<Manifest> {
        let mut manifest = Manifest::new();
        for snapshot in chain.iter().filter(|s| s.has_layer(scope)) {
            let layers = self.layers(snapshot)?;
            let layer = layers.scopes.get(scope).ok_or_else(|| StrataError::UnresolvableManifest {
                id: id.to_string(),
                scope: scope.to_string(),
                reason: format!("snapshot {} lists a layer it does not store", snapshot.short_id()),
            })?;
            apply_layer(&mut manifest, layer);
        }
        Ok(manifest)
    }
}

/// Apply one layer on top of a manifest
pub fn apply_layer(manifest: &mut Manifest, layer: &Layer) {
    for (path, entry) in &layer.entries {
        match entry {
            LayerEntry::Present(file) => {
                manifest.insert(path.clone(), file.clone());
            }
            LayerEntry::Tombstone => {
                manifest.remove(path);
            }
        }
    }
}

/// Layer that turns `parent` into `live`
///
/// A delta layer records added paths, content changes and metadata changes
/// as present entries and removed paths as tombstones. A full layer records
/// every live path plus the same tombstones.
pub fn layer_between(parent: &Manifest, live: &Manifest, full: bool) -> Layer {
    let mut entries = BTreeMap::new();
    for (path, entry) in live {
        let changed = match parent.get(path) {
            None => true,
            Some(old) => !old.same_content(entry) || !old.same_metadata(entry) || old.size != entry.size,
        };
        if full || changed {
            entries.insert(path.clone(), LayerEntry::Present(entry.clone()));
        }
    }
    for path in parent.keys() {
        if !live.contains_key(path) {
            entries.insert(path.clone(), LayerEntry::Tombstone);
        }
    }
    Layer { full, entries }
}
