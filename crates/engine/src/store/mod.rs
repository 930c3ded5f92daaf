//! Persistence behind the collaborator traits.

mod memory;
mod sqlite;

use async_trait::async_trait;

use common::{Result, SourceKey};

use crate::state::SelectionState;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Versioned storage of [`SelectionState`].
///
/// `save` is compare-and-swap on `state.version`: it succeeds only if the
/// stored version still equals the version the caller read, and fails with
/// `Error::ConcurrentUpdate` otherwise. A later writer never silently
/// overwrites an earlier one.
#[async_trait]
pub trait SelectionStore: Send + Sync {
    async fn load(&self, key: &SourceKey) -> Result<Option<SelectionState>>;

    /// Store `state` and return its new version.
    async fn save(&self, state: &SelectionState) -> Result<u64>;

    async fn load_all(&self) -> Result<Vec<SelectionState>>;
}
