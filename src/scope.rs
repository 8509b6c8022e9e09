//! Named scope roots
//!
//! A scope binds a stable name to one directory. Every manifest, scan and
//! restore is partitioned by scope name, so all scopes are independent
//! namespaces. The manager refuses any configuration in which a file could be
//! tracked twice (nested or equal roots) or in which a scope would contain,
//! or live under, another scope's data.

use crate::error::{Result, StrataError};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Longest accepted scope name
pub const MAX_SCOPE_NAME_LEN: usize = 64;

/// A named filesystem root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Stable identifier
    pub name: String,
    /// Absolute, canonical root directory
    pub path: PathBuf,
    /// Gitignore-style globs, relative to the root, that are not tracked
    #[serde(default)]
    pub exclusions: Vec<String>,
}

impl Scope {
    /// Scope without exclusions
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            exclusions: Vec::new(),
        }
    }

    /// Replace the exclusion globs
    pub fn with_exclusions<I, S>(mut self, exclusions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions = exclusions.into_iter().map(Into::into).collect();
        self
    }

    /// Compile the exclusion globs
    pub fn exclusion_set(&self) -> Result<GlobSet> {
        compile_patterns(&self.exclusions)
    }

    /// Absolute path for an entry relative to this scope
    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.path.join(relative)
    }
}

/// Compile a list of globs into one set
pub fn compile_patterns(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| StrataError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SCOPE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && name != "."
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(StrataError::InvalidScopeName(name.to_string()))
    }
}

fn canonical_or_absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

/// The set of configured scopes, in configuration order
#[derive(Debug, Clone)]
pub struct ScopeManager {
    scopes: Vec<Scope>,
    storage_path: PathBuf,
}

impl ScopeManager {
    /// Empty configuration for a repository at `storage_path`
    pub fn new(storage_path: &Path) -> Self {
        Self {
            scopes: Vec::new(),
            storage_path: canonical_or_absolute(storage_path),
        }
    }

    /// Configuration loaded from the repository
    ///
    /// Paths were validated when the scopes were added and are not required
    /// to exist now (an external drive may be unplugged); scanning a missing
    /// root fails at scan time instead.
    pub fn from_persisted(storage_path: &Path, scopes: Vec<Scope>) -> Result<Self> {
        let mut manager = Self::new(storage_path);
        for scope in scopes {
            validate_name(&scope.name)?;
            scope.exclusion_set()?;
            if manager.get(&scope.name).is_some() {
                return Err(StrataError::DuplicateScope(scope.name));
            }
            manager.scopes.push(scope);
        }
        Ok(manager)
    }

    /// Check `scope` against the configuration, returning it with a canonical path
    pub fn validate(&self, scope: &Scope) -> Result<Scope> {
        validate_name(&scope.name)?;
        if self.get(&scope.name).is_some() {
            return Err(StrataError::DuplicateScope(scope.name.clone()));
        }

        let invalid = |reason: &str| StrataError::InvalidScopePath {
            name: scope.name.clone(),
            path: scope.path.clone(),
            reason: reason.to_string(),
        };
        if !scope.path.is_absolute() {
            return Err(invalid("path must be absolute"));
        }
        let canonical = fs::canonicalize(&scope.path).map_err(|e| invalid(&e.to_string()))?;
        if !canonical.is_dir() {
            return Err(invalid("not a directory"));
        }
        if canonical.starts_with(&self.storage_path) {
            return Err(invalid("path lies inside the storage directory"));
        }

        for existing in &self.scopes {
            if canonical.starts_with(&existing.path) || existing.path.starts_with(&canonical) {
                return Err(StrataError::OverlappingScopes {
                    first: existing.name.clone(),
                    first_path: existing.path.clone(),
                    second: scope.name.clone(),
                    second_path: canonical,
                });
            }
        }

        scope.exclusion_set()?;

        Ok(Scope {
            name: scope.name.clone(),
            path: canonical,
            exclusions: scope.exclusions.clone(),
        })
    }

    /// Validate and append a scope
    pub fn add(&mut self, scope: Scope) -> Result<&Scope> {
        let scope = self.validate(&scope)?;
        info!("Added scope '{}' at {:?}", scope.name, scope.path);
        self.scopes.push(scope);
        let last = self.scopes.len() - 1;
        Ok(&self.scopes[last])
    }

    /// Remove a scope from the configuration
    ///
    /// Whether snapshots still reference it is the caller's check; history
    /// keyed by this name stays in the lineage either way.
    pub fn remove(&mut self, name: &str) -> Result<Scope> {
        let idx = self
            .scopes
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| StrataError::UnknownScope(name.to_string()))?;
        debug!("Removed scope '{}'", name);
        Ok(self.scopes.remove(idx))
    }

    /// Scope by name
    pub fn get(&self, name: &str) -> Option<&Scope> {
        self.scopes.iter().find(|s| s.name == name)
    }

    /// Scope by name, or `UnknownScope`
    pub fn require(&self, name: &str) -> Result<&Scope> {
        self.get(name).ok_or_else(|| StrataError::UnknownScope(name.to_string()))
    }

    /// Scopes in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter()
    }

    /// Scopes as a slice, for persistence
    pub fn as_slice(&self) -> &[Scope] {
        &self.scopes
    }

    /// Number of scopes
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether no scope is configured
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Canonical storage directory the scopes are checked against
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }
}
