//! # Dock Isolation
//!
//! Loading and closing of package code. A package's bundle becomes an
//! [`IsolationUnit`] through an [`IsolationBoundary`]:
//!
//! - [`NativeBoundary`] maps the bundle as a private shared library.
//! - [`CatalogBoundary`] serves packages linked into the host.
//!
//! Both report to a process-scoped [`UnitCensus`], which counts a unit as
//! live until the last [`UnitGuard`] for it drops.

pub mod boundary;
pub mod catalog;
pub mod census;
pub mod guard;
pub mod native;
pub mod unit;

pub use boundary::IsolationBoundary;
pub use catalog::{CatalogBoundary, ExportsFn};
pub use census::{CensusSnapshot, UnitCensus};
pub use guard::UnitGuard;
pub use native::NativeBoundary;
pub use unit::IsolationUnit;
