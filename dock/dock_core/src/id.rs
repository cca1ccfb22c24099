//! Strongly-typed identifiers.
//!
//! Every identifier is a UUID tagged with a phantom marker, so a unit id can
//! never be passed where a deployment id is expected.
//!
//! ```
//! use dock_core::id::{DeploymentId, UnitId};
//!
//! let unit = UnitId::new();
//! let deployment = DeploymentId::new();
//! assert_ne!(unit.to_string(), deployment.to_string());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

/// A type-safe identifier based on UUID.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T> {
    uuid: Uuid,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    /// Create a new random identifier.
    pub fn new() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _marker: PhantomData,
        }
    }

    /// The underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// First eight hex digits, enough to tell units apart in log lines.
    pub fn short(&self) -> String {
        self.uuid.simple().to_string()[..8].to_string()
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

impl<T> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self::from_uuid)
    }
}

/// Marker for isolation unit identifiers.
#[derive(Debug)]
pub enum UnitMarker {}

/// Marker for deployment identifiers.
#[derive(Debug)]
pub enum DeploymentMarker {}

/// Identifies one loaded isolation unit. A redeploy always yields a new id.
pub type UnitId = Id<UnitMarker>;

/// Identifies one deploy attempt of a package.
pub type DeploymentId = Id<DeploymentMarker>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<UnitId> = (0..100).map(|_| UnitId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_id_parse_roundtrip() {
        let raw = "550e8400-e29b-41d4-a716-446655440000";
        let id = DeploymentId::from_str(raw).unwrap();
        assert_eq!(id.to_string(), raw);
        assert_eq!(id.short(), "550e8400");
    }

    #[test]
    fn test_id_serializes_as_plain_uuid() {
        let id = UnitId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.uuid()));
    }
}
