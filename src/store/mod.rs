//! Update record persistence.
//!
//! Records are created PENDING by the HTTP layer, claimed by exactly one
//! build task through [`UpdateStore::claim_build`], and saved once more in a
//! terminal state.

pub mod keydb;
pub mod memory;

use anyhow::Result;

use crate::model::{NewUpdate, UpdateRecord};

pub use keydb::KeyDbStore;
pub use memory::MemoryStore;

#[async_trait::async_trait]
pub trait UpdateStore: Send + Sync {
    /// Persist a new PENDING record for `account` and return it with its id.
    async fn create(&self, account: &str, update: NewUpdate) -> Result<UpdateRecord>;

    /// Account-scoped read: records owned by another account are `None`.
    async fn get(&self, account: &str, id: u64) -> Result<Option<UpdateRecord>>;

    /// All records owned by `account`, oldest first.
    async fn list(&self, account: &str) -> Result<Vec<UpdateRecord>>;

    /// Overwrite a record.  Refuses writes that would move the stored state
    /// backwards.
    async fn save(&self, record: &UpdateRecord) -> Result<()>;

    /// Build lease: atomically move record `id` from PENDING to BUILDING.
    ///
    /// Returns `false` when the record is missing or not PENDING.
    async fn claim_build(&self, id: u64) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}
