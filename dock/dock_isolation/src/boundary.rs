//! Isolation boundary.
//!
//! An isolation boundary turns a package bundle on disk into an
//! [`IsolationUnit`] whose symbols are segregated from the host's and from
//! every other unit's, and closes units again.

use std::path::Path;

use dock_core::IsolationError;

use crate::unit::IsolationUnit;

/// A mechanism for loading and closing package code.
pub trait IsolationBoundary: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Load a package.
    ///
    /// # Arguments
    ///
    /// * `package` - The package name.
    /// * `bundle` - The package's built bundle.
    ///
    /// # Returns
    ///
    /// * `Ok(IsolationUnit)` - A new unit; never shared with earlier loads.
    /// * `Err(IsolationError::PackageNotFound)` - If the boundary has no code for the package.
    /// * `Err` - If the code exists but could not be loaded.
    ///
    /// This blocks (disk I/O, symbol resolution) and must not run on a reactor thread.
    fn load(&self, package: &str, bundle: &Path) -> Result<IsolationUnit, IsolationError>;

    /// Close a unit.
    ///
    /// Best effort: the unit is closed whatever the result, and an error only
    /// reports that its memory could not be reclaimed right away.
    fn close(&self, unit: IsolationUnit) -> Result<(), IsolationError> {
        unit.release()
    }
}
