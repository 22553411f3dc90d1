//! In-memory credential store. Nothing survives the process; used by tests
//! and dry runs.

use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    error::Result,
    store::{CredentialStore, LoadReport, StoredAccount},
    types::AccountKey,
};

#[derive(Default)]
pub struct InMemoryCredentialStore {
    records: Mutex<BTreeMap<String, StoredAccount>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a single record, if present.
    pub fn get(&self, key: &AccountKey) -> Option<StoredAccount> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(&key.to_string()).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load_all(&self) -> Result<LoadReport> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(LoadReport {
            records: records.values().cloned().collect(),
            skipped: 0,
        })
    }

    async fn save(&self, record: &StoredAccount) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(record.key().to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &AccountKey) -> Result<bool> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.remove(&key.to_string()).is_some())
    }
}
