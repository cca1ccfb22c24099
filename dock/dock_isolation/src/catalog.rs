//! In-process package catalog.
//!
//! Packages linked into the host binary register their export function here
//! under their package name. Each load calls the function again, so every
//! unit gets its own export table and instances, but process statics are
//! shared. Used for embedding and in tests.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use dock_core::{IsolationError, PackageExports, UnitId};
use tracing::info;

use crate::boundary::IsolationBoundary;
use crate::census::UnitCensus;
use crate::guard::UnitGuard;
use crate::unit::IsolationUnit;

/// Export function of a linked-in package.
pub type ExportsFn = fn() -> PackageExports;

/// Isolation boundary backed by linked-in packages.
pub struct CatalogBoundary {
    packages: DashMap<String, ExportsFn>,
    census: Arc<UnitCensus>,
}

impl CatalogBoundary {
    /// Create an empty catalog reporting to `census`.
    pub fn new(census: Arc<UnitCensus>) -> Self {
        Self {
            packages: DashMap::new(),
            census,
        }
    }

    /// Make a package loadable.
    pub fn register(&self, package: impl Into<String>, exports: ExportsFn) -> &Self {
        self.packages.insert(package.into(), exports);
        self
    }

    /// Remove a package from the catalog. Already loaded units are unaffected.
    pub fn unregister(&self, package: &str) -> bool {
        self.packages.remove(package).is_some()
    }

    /// Registered package names, sorted.
    pub fn packages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.packages.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl IsolationBoundary for CatalogBoundary {
    fn name(&self) -> &'static str {
        "catalog"
    }

    fn load(&self, package: &str, bundle: &Path) -> Result<IsolationUnit, IsolationError> {
        let exports_fn = self
            .packages
            .get(package)
            .map(|entry| *entry.value())
            .ok_or_else(|| IsolationError::PackageNotFound(package.to_string()))?;

        let id = UnitId::new();
        let exports = exports_fn();
        let guard = UnitGuard::new(id, package, self.census.clone(), None);

        info!(
            unit = %id,
            package = %package,
            modules = exports.module_refs().count(),
            "Loaded catalog unit"
        );

        Ok(IsolationUnit::new(exports, bundle, guard))
    }
}
