//! In-memory index of live accounts and each owner's default pointer.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio::sync::{Mutex, MutexGuard};

use crate::{
    error::{Error, Result},
    session::AccountSession,
    types::{AccountId, AccountIdentity, AccountKey, AccountSettings, OwnerId},
};

/// A live account. Settings are shared with the inbound handler; writes are
/// serialized through [`AccountEntry::lock_for_update`].
pub struct AccountEntry {
    identity: AccountIdentity,
    settings: Arc<RwLock<AccountSettings>>,
    update: Mutex<()>,
    session: Arc<AccountSession>,
}

impl AccountEntry {
    pub fn new(
        identity: AccountIdentity,
        settings: AccountSettings,
        session: Arc<AccountSession>,
    ) -> Self {
        Self {
            identity,
            settings: Arc::new(RwLock::new(settings)),
            update: Mutex::new(()),
            session,
        }
    }

    pub fn key(&self) -> AccountKey {
        self.identity.key
    }

    pub fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    pub fn session(&self) -> &Arc<AccountSession> {
        &self.session
    }

    /// Consistent copy of the current settings.
    pub fn settings(&self) -> AccountSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn settings_handle(&self) -> Arc<RwLock<AccountSettings>> {
        Arc::clone(&self.settings)
    }

    /// Held for the whole read-modify-persist-commit cycle of an update.
    pub async fn lock_for_update(&self) -> MutexGuard<'_, ()> {
        self.update.lock().await
    }

    pub fn replace_settings(&self, settings: AccountSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }
}

#[derive(Default)]
struct OwnerAccounts {
    accounts: Vec<Arc<AccountEntry>>,
    default: Option<AccountId>,
}

#[derive(Default)]
pub struct AccountRegistry {
    owners: RwLock<HashMap<OwnerId, OwnerAccounts>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<OwnerId, OwnerAccounts>> {
        self.owners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<OwnerId, OwnerAccounts>> {
        self.owners.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &AccountKey) -> Option<Arc<AccountEntry>> {
        self.read()
            .get(&key.owner)?
            .accounts
            .iter()
            .find(|e| e.key() == *key)
            .cloned()
    }

    /// Insert or replace. The first account an owner gets becomes their
    /// default. Returns the replaced entry, if any.
    pub fn put(&self, entry: Arc<AccountEntry>) -> Option<Arc<AccountEntry>> {
        let key = entry.key();
        let mut owners = self.write();
        let owner = owners.entry(key.owner).or_default();
        if owner.default.is_none() {
            owner.default = Some(key.account);
        }
        match owner.accounts.iter_mut().find(|e| e.key() == key) {
            Some(slot) => Some(std::mem::replace(slot, entry)),
            None => {
                owner.accounts.push(entry);
                None
            },
        }
    }

    /// Remove an account; clears the owner's default if it pointed here.
    pub fn remove(&self, key: &AccountKey) -> Option<Arc<AccountEntry>> {
        let mut owners = self.write();
        let owner = owners.get_mut(&key.owner)?;
        let index = owner.accounts.iter().position(|e| e.key() == *key)?;
        let removed = owner.accounts.remove(index);
        if owner.default == Some(key.account) {
            owner.default = None;
        }
        if owner.accounts.is_empty() {
            owners.remove(&key.owner);
        }
        Some(removed)
    }

    /// Accounts of one owner in insertion order.
    pub fn accounts(&self, owner: OwnerId) -> Vec<Arc<AccountEntry>> {
        self.read()
            .get(&owner)
            .map(|o| o.accounts.clone())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<AccountEntry>> {
        self.read()
            .values()
            .flat_map(|o| o.accounts.iter().cloned())
            .collect()
    }

    pub fn default_account(&self, owner: OwnerId) -> Option<AccountId> {
        self.read().get(&owner).and_then(|o| o.default)
    }

    /// Point the owner's default at an existing account.
    pub fn set_default(&self, key: &AccountKey) -> Result<()> {
        let mut owners = self.write();
        let owner = owners
            .get_mut(&key.owner)
            .filter(|o| o.accounts.iter().any(|e| e.key() == *key))
            .ok_or(Error::unknown_account(*key))?;
        owner.default = Some(key.account);
        Ok(())
    }

    /// The account an owner's commands apply to.
    pub fn current(&self, owner: OwnerId) -> Result<Arc<AccountEntry>> {
        let account = self
            .default_account(owner)
            .ok_or(Error::NoDefaultAccount)?;
        let key = AccountKey::new(owner, account);
        self.get(&key).ok_or(Error::unknown_account(key))
    }

    /// Take every entry out, leaving the registry empty.
    pub fn drain(&self) -> Vec<Arc<AccountEntry>> {
        self.write()
            .drain()
            .flat_map(|(_, o)| o.accounts)
            .collect()
    }
}
