//! Package management for the dock runtime
//!
//! On-disk layout, instance construction, module lifecycle and the
//! coordinator that ties them to the routing map.

pub mod container;
pub mod coordinator;
pub mod layout;
pub mod lifecycle;

pub use container::{Construction, Container};
pub use coordinator::{Coordinator, DeploySummary, DeploymentInfo, UndeployReport};
pub use layout::{normalize_address, ModuleDescriptor, PackageLayout, PackagePlan};
pub use lifecycle::{ModuleInstance, ModuleState, PackageState};
