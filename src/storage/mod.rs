//! Snapshot Storage
//!
//! Components persist their snapshots through the [`Storage`] trait so an
//! interrupted run can be picked up again by a later process. Keys follow
//! `"{type}:{id}"`, e.g. `work:extract`.
//!
//! # Backends
//!
//! - [`MemoryStorage`]: in-process map, the default for tests and embedding
//! - [`FileStorage`]: one JSON document per key in a directory

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::workflow::model::ComponentKind;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Key-value store for persisted snapshots.
///
/// Implementations only need per-key consistency: sibling components always
/// write disjoint keys.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Builds the storage key for a component.
pub fn storage_key(kind: ComponentKind, id: &str) -> String {
    format!("{}:{}", kind, id)
}
