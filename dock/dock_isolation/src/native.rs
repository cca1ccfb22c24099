//! Native shared-library boundary.
//!
//! Each load stages a private copy of the bundle and maps it with
//! `RTLD_NOW | RTLD_LOCAL`, so a redeploy of the same package always gets a
//! fresh image with its own statics, and no unit's symbols leak into the
//! global namespace. The image is unmapped and the staged copy removed when
//! the unit's last guard drops, on the reaper pool when one is set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dock_concurrency::ThreadPool;
use dock_core::{IsolationError, UnitId};
use tracing::info;

use crate::boundary::IsolationBoundary;
use crate::census::UnitCensus;
#[cfg(unix)]
use crate::guard::{Release, UnitGuard};
use crate::unit::IsolationUnit;

/// Isolation boundary loading packages as native shared libraries.
pub struct NativeBoundary {
    shadow_dir: PathBuf,
    census: Arc<UnitCensus>,
    reaper: Option<Arc<ThreadPool>>,
}

impl NativeBoundary {
    /// Create a boundary staging bundles under `shadow_dir`.
    pub fn new(shadow_dir: impl Into<PathBuf>, census: Arc<UnitCensus>) -> Self {
        Self {
            shadow_dir: shadow_dir.into(),
            census,
            reaper: None,
        }
    }

    /// Unmap released units on `pool` instead of the dropping thread.
    pub fn with_reaper(mut self, pool: Arc<ThreadPool>) -> Self {
        self.reaper = Some(pool);
        self
    }

    /// Directory staged copies are written to.
    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }

    fn stage(&self, package: &str, id: UnitId, bundle: &Path) -> Result<PathBuf, IsolationError> {
        std::fs::create_dir_all(&self.shadow_dir).map_err(|source| IsolationError::ShadowCopy {
            path: self.shadow_dir.clone(),
            source,
        })?;

        let staged = self.shadow_dir.join(format!(
            "{}{}-{}{}",
            std::env::consts::DLL_PREFIX,
            package,
            id.short(),
            std::env::consts::DLL_SUFFIX
        ));
        std::fs::copy(bundle, &staged).map_err(|source| IsolationError::ShadowCopy {
            path: staged.clone(),
            source,
        })?;
        Ok(staged)
    }
}

impl IsolationBoundary for NativeBoundary {
    fn name(&self) -> &'static str {
        "native"
    }

    #[cfg(unix)]
    fn load(&self, package: &str, bundle: &Path) -> Result<IsolationUnit, IsolationError> {
        if !bundle.is_file() {
            return Err(IsolationError::PackageNotFound(package.to_string()));
        }

        let id = UnitId::new();
        let staged = self.stage(package, id, bundle)?;
        let library = sys::Library::open(staged)?;

        let found = library.abi_version()?;
        if found != dock_core::ABI_VERSION {
            return Err(IsolationError::AbiMismatch {
                expected: dock_core::ABI_VERSION,
                found,
            });
        }
        let exports = library.exports()?;

        info!(
            unit = %id,
            package = %package,
            bundle = %bundle.display(),
            modules = exports.module_refs().count(),
            "Loaded native unit"
        );

        let release: Release = Box::new(move || drop(library));
        let guard = match &self.reaper {
            Some(pool) => {
                UnitGuard::with_reaper(id, package, self.census.clone(), Some(release), pool.clone())
            }
            None => UnitGuard::new(id, package, self.census.clone(), Some(release)),
        };
        Ok(IsolationUnit::new(exports, bundle, guard))
    }

    #[cfg(not(unix))]
    fn load(&self, package: &str, bundle: &Path) -> Result<IsolationUnit, IsolationError> {
        let _ = (package, bundle, &self.census, &self.reaper);
        Err(IsolationError::Unsupported("native units require a unix dynamic loader"))
    }
}

#[cfg(unix)]
mod sys {
    use std::path::PathBuf;

    use dock_core::package::{ABI_VERSION_SYMBOL, EXPORTS_SYMBOL};
    use dock_core::{IsolationError, PackageExports};
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};
    use libloading::Symbol;
    use tracing::{debug, warn};

    type AbiVersionFn = extern "C" fn() -> u32;
    type ExportsFn = extern "C" fn() -> *mut PackageExports;

    /// A mapped staged copy; unmapped and deleted on drop.
    pub(super) struct Library {
        inner: Option<libloading::Library>,
        staged: PathBuf,
    }

    impl Library {
        pub(super) fn open(staged: PathBuf) -> Result<Self, IsolationError> {
            // SAFETY: the staged copy is private to this unit. Its initializers
            // are package code built against the same dock_core revision,
            // which `abi_version` checks before anything else is called.
            match unsafe { UnixLibrary::open(Some(&staged), RTLD_NOW | RTLD_LOCAL) } {
                Ok(lib) => Ok(Self {
                    inner: Some(lib.into()),
                    staged,
                }),
                Err(e) => {
                    let _ = std::fs::remove_file(&staged);
                    Err(IsolationError::LoadFailed {
                        path: staged,
                        reason: e.to_string(),
                    })
                }
            }
        }

        fn symbol<T: Copy>(&self, name: &'static [u8], label: &'static str) -> Result<T, IsolationError> {
            let lib = self
                .inner
                .as_ref()
                .ok_or(IsolationError::MissingSymbol(label))?;
            // SAFETY: `T` is the signature `declare_package!` exports under
            // `name`; the pointer is only used while `self` keeps the image mapped.
            let sym: Symbol<T> = unsafe { lib.get(name) }.map_err(|e| {
                debug!(symbol = label, "Symbol lookup failed: {}", e);
                IsolationError::MissingSymbol(label)
            })?;
            Ok(*sym)
        }

        pub(super) fn abi_version(&self) -> Result<u32, IsolationError> {
            let version: AbiVersionFn = self.symbol(ABI_VERSION_SYMBOL, "dock_abi_version")?;
            Ok(version())
        }

        pub(super) fn exports(&self) -> Result<PackageExports, IsolationError> {
            let exports: ExportsFn = self.symbol(EXPORTS_SYMBOL, "dock_package_exports")?;
            let raw = exports();
            if raw.is_null() {
                return Err(IsolationError::LoadFailed {
                    path: self.staged.clone(),
                    reason: "export function returned null".to_string(),
                });
            }
            // SAFETY: allocated by `declare_package!` with Box::into_raw and
            // handed over exactly once.
            Ok(*unsafe { Box::from_raw(raw) })
        }
    }

    impl Drop for Library {
        fn drop(&mut self) {
            if let Some(lib) = self.inner.take() {
                if let Err(e) = lib.close() {
                    warn!(staged = %self.staged.display(), "Failed to unmap unit: {}", e);
                }
            }
            if let Err(e) = std::fs::remove_file(&self.staged) {
                debug!(staged = %self.staged.display(), "Could not remove staged bundle: {}", e);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_bundle_is_package_not_found() {
        let dir = TempDir::new().unwrap();
        let boundary = NativeBoundary::new(dir.path().join("shadow"), Arc::new(UnitCensus::new()));

        let err = boundary
            .load("repoA", &dir.path().join("librepo_a.so"))
            .unwrap_err();
        assert!(matches!(err, IsolationError::PackageNotFound(p) if p == "repoA"));
    }

    #[test]
    fn test_garbage_bundle_fails_and_cleans_stage() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("librepo_a.so");
        std::fs::write(&bundle, b"not an elf image").unwrap();

        let census = Arc::new(UnitCensus::new());
        let boundary = NativeBoundary::new(dir.path().join("shadow"), census.clone());

        let err = boundary.load("repoA", &bundle).unwrap_err();
        assert!(matches!(err, IsolationError::LoadFailed { .. }));
        assert_eq!(census.live_units(), 0);

        let staged = std::fs::read_dir(boundary.shadow_dir()).unwrap().count();
        assert_eq!(staged, 0);
    }
}
