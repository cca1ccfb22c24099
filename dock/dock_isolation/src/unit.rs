//! Loaded isolation units.

use std::path::{Path, PathBuf};
use std::time::Instant;

use dock_core::{IsolationError, PackageExports, UnitId};
use tracing::{debug, info};

use crate::guard::UnitGuard;

/// One package's loaded code.
///
/// The export table is declared before the guard so it is dropped while the
/// image is still mapped.
pub struct IsolationUnit {
    exports: PackageExports,
    source: PathBuf,
    loaded_at: Instant,
    guard: UnitGuard,
}

impl IsolationUnit {
    /// Assemble a unit from a mapped image.
    pub fn new(exports: PackageExports, source: impl Into<PathBuf>, guard: UnitGuard) -> Self {
        Self {
            exports,
            source: source.into(),
            loaded_at: Instant::now(),
            guard,
        }
    }

    /// Identifier of this unit.
    pub fn id(&self) -> UnitId {
        self.guard.unit_id()
    }

    /// Package the unit belongs to.
    pub fn package(&self) -> &str {
        self.guard.package()
    }

    /// The package's export table.
    pub fn exports(&self) -> &PackageExports {
        &self.exports
    }

    /// Bundle the unit was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// When the unit was loaded.
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    /// A new reference keeping the image mapped.
    pub fn guard(&self) -> UnitGuard {
        self.guard.clone()
    }

    /// Drop the unit's own references and report whether the image could be
    /// released right away.
    ///
    /// Outstanding guards (instances still held by in-flight requests, or
    /// leaked) defer the release; that is reported as `CloseFailed` so the
    /// caller can log it, but the unit is closed either way.
    pub fn release(self) -> Result<(), IsolationError> {
        let id = self.id();
        let package = self.package().to_string();
        let Self { exports, guard, .. } = self;
        drop(exports);

        let outstanding = guard.ref_count() - 1;
        drop(guard);

        if outstanding > 0 {
            debug!(unit = %id, package = %package, outstanding, "Unit release deferred");
            return Err(IsolationError::CloseFailed {
                unit: id,
                reason: format!("{} references still outstanding, release deferred", outstanding),
            });
        }

        info!(unit = %id, package = %package, "Closed isolation unit");
        Ok(())
    }
}

impl std::fmt::Debug for IsolationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationUnit")
            .field("id", &self.id())
            .field("package", &self.package())
            .field("source", &self.source)
            .finish()
    }
}
