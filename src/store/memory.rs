//! Process-local store used when no KeyDB endpoint is configured.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::debug;

use super::UpdateStore;
use crate::model::{NewUpdate, UpdateRecord, UpdateState};

#[derive(Debug)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<u64, UpdateRecord>>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UpdateStore for MemoryStore {
    async fn create(&self, account: &str, update: NewUpdate) -> Result<UpdateRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = UpdateRecord::new(id, account, update);
        self.records.lock().await.insert(id, record.clone());
        debug!(id, %account, "update record created");
        Ok(record)
    }

    async fn get(&self, account: &str, id: u64) -> Result<Option<UpdateRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(&id).filter(|r| r.account == account).cloned())
    }

    async fn list(&self, account: &str) -> Result<Vec<UpdateRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| r.account == account)
            .cloned()
            .collect())
    }

    async fn save(&self, record: &UpdateRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        let stored = records
            .get_mut(&record.id)
            .with_context(|| format!("update {} does not exist", record.id))?;
        anyhow::ensure!(
            stored.state == record.state || stored.state.can_transition_to(record.state),
            "update {} is {} and cannot be saved as {}",
            record.id,
            stored.state,
            record.state
        );
        *stored = record.clone();
        Ok(())
    }

    async fn claim_build(&self, id: u64) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(&id) {
            Some(record) if record.state == UpdateState::Pending => {
                record.transition(UpdateState::Building)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
