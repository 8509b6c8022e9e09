//! Hash collections used on hot paths
//!
//! With the `gxhash` feature (default) these are gxhash maps, which need
//! AES-NI/SSE2 or NEON. Without it they fall back to the std collections
//! behind the same names, so callers never branch on the feature.

#[cfg(feature = "gxhash")]
pub use gxhash::{GxBuildHasher, HashMap, HashMapExt, HashSet};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::{HashMap, HashSet};

/// Hasher builder for concurrent maps
#[cfg(not(feature = "gxhash"))]
pub type GxBuildHasher = std::collections::hash_map::RandomState;

/// `new`/`with_capacity` for maps regardless of backend
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Empty map
    fn new() -> Self;
    /// Empty map with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for HashMap<K, V> {
    fn new() -> Self {
        HashMap::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity_and_hasher(capacity, Default::default())
    }
}
