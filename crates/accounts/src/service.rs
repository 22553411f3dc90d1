//! Operator-facing operations over all accounts.
//!
//! Every settings change follows the same cycle under the entry's update
//! lock: copy, modify, persist, then commit to memory. A failed write leaves
//! the in-memory state untouched and is returned to the caller.

use std::sync::Arc;

use {
    futures::future::join_all,
    tracing::{info, warn},
};

use crate::{
    error::{Error, Result},
    filter::AutoresponderHandler,
    login::{LoginManager, LoginStage, LoginStep},
    platform::PlatformConnector,
    registry::{AccountEntry, AccountRegistry},
    sender::Pacing,
    session::AccountSession,
    store::{CredentialStore, StoredAccount},
    templates::TemplateSource,
    types::{
        AccountId, AccountIdentity, AccountKey, AccountSettings, OwnerId, ReplyCount,
        TargetConfig,
    },
};

/// One row of `/sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub account: AccountId,
    pub is_default: bool,
    pub enabled: bool,
    pub listening: bool,
    pub chat_id: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub loaded: usize,
    pub skipped: usize,
    pub started: usize,
    pub failed: usize,
}

pub struct AutoresponderService {
    registry: AccountRegistry,
    logins: LoginManager,
    store: Arc<dyn CredentialStore>,
    connector: Arc<dyn PlatformConnector>,
    templates: Arc<dyn TemplateSource>,
    pacing: Pacing,
}

impl AutoresponderService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn PlatformConnector>,
        templates: Arc<dyn TemplateSource>,
        pacing: Pacing,
    ) -> Self {
        Self {
            registry: AccountRegistry::new(),
            logins: LoginManager::new(),
            store,
            connector,
            templates,
            pacing,
        }
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    fn build_entry(
        &self,
        identity: AccountIdentity,
        settings: AccountSettings,
    ) -> Result<Arc<AccountEntry>> {
        let client = self.connector.client(&identity)?;
        let session = Arc::new(AccountSession::new(identity.key, client, self.pacing));
        Ok(Arc::new(AccountEntry::new(identity, settings, session)))
    }

    /// Connect, start the worker and (re)attach the autoresponder.
    async fn start_listening(&self, entry: &AccountEntry) -> Result<()> {
        let session = entry.session();
        session.open().await?;
        session.attach_listener(Arc::new(AutoresponderHandler::new(
            entry.settings_handle(),
            Arc::clone(&self.templates),
        )))
    }

    async fn update_settings<F>(&self, entry: &AccountEntry, mutate: F) -> Result<AccountSettings>
    where
        F: FnOnce(&mut AccountSettings) + Send,
    {
        let _guard = entry.lock_for_update().await;
        let mut next = entry.settings();
        mutate(&mut next);
        self.store
            .save(&StoredAccount::new(entry.identity().clone(), next.clone()))
            .await?;
        entry.replace_settings(next.clone());
        Ok(next)
    }

    /// Load every persisted account and resume the ones that were running.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let loaded = self.store.load_all().await?;
        let mut report = RestoreReport {
            skipped: loaded.skipped,
            ..RestoreReport::default()
        };

        let mut resumable = Vec::new();
        for stored in loaded.records {
            let key = stored.key();
            let entry = match self.build_entry(stored.identity, stored.settings) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(%key, error = %e, "skipping account that cannot be restored");
                    report.skipped += 1;
                    continue;
                },
            };
            let settings = entry.settings();
            if settings.status.enabled && settings.target.chat_id.is_some() {
                resumable.push(Arc::clone(&entry));
            }
            self.registry.put(entry);
            report.loaded += 1;
        }

        for entry in resumable {
            match self.start_listening(&entry).await {
                Ok(()) => report.started += 1,
                Err(e) => {
                    warn!(key = %entry.key(), error = %e, "failed to resume autoresponder");
                    report.failed += 1;
                },
            }
        }

        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            started = report.started,
            failed = report.failed,
            "accounts restored"
        );
        Ok(report)
    }

    pub fn begin_login(&self, owner: OwnerId) -> Result<AccountId> {
        self.logins.begin(owner).map(|key| key.account)
    }

    pub fn login_stage(&self, owner: OwnerId) -> Option<LoginStage> {
        self.logins.stage(owner)
    }

    pub fn login_active(&self, owner: OwnerId) -> bool {
        self.logins.is_active(owner)
    }

    pub fn cancel_login(&self, owner: OwnerId) -> Option<AccountId> {
        self.logins.abandon(owner).map(|key| key.account)
    }

    /// Feed one operator message into the handshake. On completion the
    /// account is persisted, registered and made the owner's default.
    pub async fn submit_login(
        &self,
        owner: OwnerId,
        message_id: Option<i32>,
        input: &str,
    ) -> Result<LoginStep> {
        let step = self
            .logins
            .submit(owner, message_id, input, self.connector.as_ref())
            .await?;
        if let LoginStep::Completed(identity) = &step {
            self.register(identity.clone()).await?;
        }
        Ok(step)
    }

    async fn register(&self, identity: AccountIdentity) -> Result<()> {
        let key = identity.key;
        let settings = AccountSettings::default();
        self.store
            .save(&StoredAccount::new(identity.clone(), settings.clone()))
            .await?;
        let entry = self.build_entry(identity, settings)?;
        self.registry.put(entry);
        self.registry.set_default(&key)?;
        info!(%key, "account registered");
        Ok(())
    }

    /// Replace the target chat and allowed senders. A running autoresponder
    /// is re-attached so the new target applies to the next event.
    pub async fn set_target(
        &self,
        owner: OwnerId,
        chat_id: i64,
        allowed_sender_ids: impl IntoIterator<Item = i64>,
    ) -> Result<TargetConfig> {
        let entry = self.registry.current(owner)?;
        let target = TargetConfig {
            chat_id: Some(chat_id),
            allowed_sender_ids: allowed_sender_ids.into_iter().collect(),
        };
        let settings = self
            .update_settings(&entry, |s| s.target = target)
            .await?;
        if settings.status.enabled {
            self.start_listening(&entry).await?;
        }
        info!(key = %entry.key(), chat_id, "target updated");
        Ok(settings.target)
    }

    pub async fn start(&self, owner: OwnerId) -> Result<AccountId> {
        let entry = self.registry.current(owner)?;
        let key = entry.key();
        let was_enabled = entry.settings().status.enabled;
        if entry.settings().target.chat_id.is_none() {
            return Err(Error::NoTargetChat { key });
        }

        self.start_listening(&entry).await?;
        if let Err(e) = self
            .update_settings(&entry, |s| s.status.enabled = true)
            .await
        {
            if !was_enabled {
                entry.session().detach_listener();
            }
            return Err(e);
        }
        info!(%key, "autoresponder started");
        Ok(key.account)
    }

    pub async fn stop(&self, owner: OwnerId) -> Result<AccountId> {
        let entry = self.registry.current(owner)?;
        self.update_settings(&entry, |s| s.status.enabled = false)
            .await?;
        entry.session().detach_listener();
        info!(key = %entry.key(), "autoresponder stopped");
        Ok(entry.key().account)
    }

    /// The record keeps the delay as a signed integer; larger values would
    /// not survive a restore and are refused.
    pub async fn set_delay(&self, owner: OwnerId, seconds: u64) -> Result<AccountId> {
        if i64::try_from(seconds).is_err() {
            return Err(Error::InvalidReplyDelay { requested: seconds });
        }
        let entry = self.registry.current(owner)?;
        self.update_settings(&entry, |s| s.status.reply_delay_secs = seconds)
            .await?;
        Ok(entry.key().account)
    }

    /// Out-of-range values are refused before anything changes.
    pub async fn set_reply_count(&self, owner: OwnerId, requested: i64) -> Result<ReplyCount> {
        let count = ReplyCount::new(requested)?;
        let entry = self.registry.current(owner)?;
        self.update_settings(&entry, |s| s.status.reply_count = count)
            .await?;
        Ok(count)
    }

    pub fn list_accounts(&self, owner: OwnerId) -> Vec<AccountSummary> {
        let default = self.registry.default_account(owner);
        self.registry
            .accounts(owner)
            .iter()
            .map(|entry| {
                let settings = entry.settings();
                AccountSummary {
                    account: entry.key().account,
                    is_default: default == Some(entry.key().account),
                    enabled: settings.status.enabled,
                    listening: entry.session().is_listening(),
                    chat_id: settings.target.chat_id,
                }
            })
            .collect()
    }

    /// Target of the owner's current account.
    pub fn target(&self, owner: OwnerId) -> Result<(AccountId, TargetConfig)> {
        let entry = self.registry.current(owner)?;
        Ok((entry.key().account, entry.settings().target))
    }

    pub fn select_account(&self, owner: OwnerId, raw: &str) -> Result<AccountId> {
        let account = AccountId::parse(raw)?;
        self.registry.set_default(&AccountKey::new(owner, account))?;
        info!(%owner, %account, "default account changed");
        Ok(account)
    }

    /// Remove the record, close the live session, forget the account.
    pub async fn delete_account(&self, owner: OwnerId, raw: &str) -> Result<AccountId> {
        let account = AccountId::parse(raw)?;
        let key = AccountKey::new(owner, account);
        let entry = self.registry.get(&key);

        let existed = match &entry {
            Some(entry) => {
                let _guard = entry.lock_for_update().await;
                self.store.delete(&key).await?
            },
            None => self.store.delete(&key).await?,
        };
        if entry.is_none() && !existed {
            return Err(Error::unknown_account(key));
        }

        if let Some(entry) = self.registry.remove(&key) {
            entry.session().close().await;
        }
        info!(%key, "account deleted");
        Ok(account)
    }

    /// Close every session concurrently and drop pending handshakes.
    pub async fn shutdown(&self) {
        self.logins.clear();
        let entries = self.registry.drain();
        let count = entries.len();
        join_all(entries.iter().map(|entry| entry.session().close())).await;
        info!(sessions = count, "all sessions closed");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            platform::InboundEvent,
            store_file::FileCredentialStore,
            store_memory::InMemoryCredentialStore,
            templates::StaticTemplates,
            test_support::{FakeClient, FakeConnector, LoginScript},
        },
        async_trait::async_trait,
        std::time::Duration,
        tokio::time::Instant,
    };

    const OWNER: OwnerId = OwnerId(42);
    const CHAT: i64 = -100123456;

    struct Harness {
        service: AutoresponderService,
        connector: Arc<FakeConnector>,
    }

    fn harness_with(store: Arc<dyn CredentialStore>, templates: &[&str]) -> Harness {
        let connector = FakeConnector::new();
        let service = AutoresponderService::new(
            store,
            connector.clone(),
            Arc::new(StaticTemplates::new(templates.iter().copied())),
            Pacing::default(),
        );
        Harness { service, connector }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryCredentialStore::new()), &["hi", "hello", "hey"])
    }

    async fn login(h: &Harness) -> AccountId {
        let account = h.service.begin_login(OWNER).unwrap();
        for input in ["12345", "abcdef0123", "+15551234567", "5-4-3-2-1"] {
            h.service.submit_login(OWNER, None, input).await.unwrap();
        }
        account
    }

    fn client(h: &Harness, account: AccountId) -> Arc<FakeClient> {
        h.connector
            .client_for(&AccountKey::new(OWNER, account))
            .unwrap()
    }

    fn trigger(message_id: i32, sender: i64) -> InboundEvent {
        InboundEvent {
            message_id,
            chat_id: CHAT,
            sender_id: Some(sender),
            outgoing: false,
            text: "ping".into(),
        }
    }

    async fn wait_for_sends(client: &FakeClient, count: usize) {
        while client.sent().len() < count {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn completed_login_is_persisted_and_becomes_default() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let h = harness_with(store.clone(), &["hi"]);
        let account = login(&h).await;

        let key = AccountKey::new(OWNER, account);
        let stored = store.get(&key).unwrap();
        assert!(!stored.identity.session_token.is_empty());
        assert_eq!(stored.identity.credentials.api_id, 12345);
        assert_eq!(stored.settings, AccountSettings::default());
        assert_eq!(h.service.registry().default_account(OWNER), Some(account));
        assert!(!h.service.login_active(OWNER));
    }

    #[tokio::test]
    async fn two_factor_login_registers_account() {
        let h = harness();
        h.connector.set_login(LoginScript {
            password: Some("hunter2".into()),
            ..LoginScript::default()
        });
        let account = h.service.begin_login(OWNER).unwrap();
        for input in ["1", "h", "+15551234567", "54321", "hunter2"] {
            h.service.submit_login(OWNER, None, input).await.unwrap();
        }
        assert_eq!(h.service.registry().default_account(OWNER), Some(account));
        assert_eq!(h.service.list_accounts(OWNER).len(), 1);
    }

    #[tokio::test]
    async fn abandoned_login_keeps_previous_default() {
        let h = harness();
        let first = login(&h).await;
        h.service.begin_login(OWNER).unwrap();
        h.service.cancel_login(OWNER);
        assert_eq!(h.service.registry().default_account(OWNER), Some(first));
    }

    #[tokio::test]
    async fn start_requires_target_chat() {
        let h = harness();
        login(&h).await;
        assert!(matches!(
            h.service.start(OWNER).await,
            Err(Error::NoTargetChat { .. })
        ));
    }

    #[tokio::test]
    async fn operations_without_account_fail() {
        let h = harness();
        assert!(matches!(
            h.service.start(OWNER).await,
            Err(Error::NoDefaultAccount)
        ));
        assert!(matches!(
            h.service.set_delay(OWNER, 3).await,
            Err(Error::NoDefaultAccount)
        ));
    }

    #[tokio::test]
    async fn reply_count_out_of_range_changes_nothing() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let h = harness_with(store.clone(), &["hi"]);
        let account = login(&h).await;
        h.service.set_reply_count(OWNER, 2).await.unwrap();

        assert!(matches!(
            h.service.set_reply_count(OWNER, 4).await,
            Err(Error::InvalidReplyCount { requested: 4 })
        ));
        let stored = store.get(&AccountKey::new(OWNER, account)).unwrap();
        assert_eq!(stored.settings.status.reply_count.get(), 2);
    }

    #[tokio::test]
    async fn oversized_delay_changes_nothing() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let h = harness_with(store.clone(), &["hi"]);
        let account = login(&h).await;
        h.service.set_delay(OWNER, 30).await.unwrap();

        let too_large = u64::MAX;
        assert!(matches!(
            h.service.set_delay(OWNER, too_large).await,
            Err(Error::InvalidReplyDelay { requested }) if requested == too_large
        ));
        let stored = store.get(&AccountKey::new(OWNER, account)).unwrap();
        assert_eq!(stored.settings.status.reply_delay_secs, 30);

        let largest = u64::try_from(i64::MAX).unwrap();
        h.service.set_delay(OWNER, largest).await.unwrap();
        let stored = store.get(&AccountKey::new(OWNER, account)).unwrap();
        assert_eq!(stored.settings.status.reply_delay_secs, largest);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_produces_delayed_jittered_replies() {
        let h = harness();
        let account = login(&h).await;
        h.service.set_target(OWNER, CHAT, [555]).await.unwrap();
        h.service.set_delay(OWNER, 2).await.unwrap();
        h.service.set_reply_count(OWNER, 3).await.unwrap();
        h.service.start(OWNER).await.unwrap();

        let client = client(&h, account);
        let accepted = Instant::now();
        client.push_event(trigger(1, 555));
        client.push_event(trigger(2, 999));
        wait_for_sends(&client, 3).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let sent = client.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|m| m.chat_id == CHAT));
        assert!(sent[0].at - accepted >= Duration::from_secs(2));
        for pair in sent.windows(2) {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= Duration::from_millis(700) && gap <= Duration::from_millis(1200));
        }
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_new_triggers() {
        let h = harness();
        let account = login(&h).await;
        h.service.set_target(OWNER, CHAT, [555]).await.unwrap();
        h.service.start(OWNER).await.unwrap();
        h.service.stop(OWNER).await.unwrap();

        let client = client(&h, account);
        client.push_event(trigger(1, 555));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(client.attempts().is_empty());
        assert!(!h.service.list_accounts(OWNER)[0].listening);
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retarget_applies_to_next_event() {
        let h = harness();
        let account = login(&h).await;
        h.service.set_target(OWNER, CHAT, [555]).await.unwrap();
        h.service.start(OWNER).await.unwrap();
        h.service.set_target(OWNER, CHAT, [777]).await.unwrap();

        let client = client(&h, account);
        client.push_event(trigger(1, 555));
        client.push_event(trigger(2, 777));
        wait_for_sends(&client, 1).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.sent().len(), 1);
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn settings_survive_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let account = {
            let h = harness_with(Arc::new(FileCredentialStore::new(tmp.path())), &["hi"]);
            let account = login(&h).await;
            h.service.set_target(OWNER, CHAT, [555, 556]).await.unwrap();
            h.service.set_delay(OWNER, 7).await.unwrap();
            h.service.set_reply_count(OWNER, 3).await.unwrap();
            h.service.start(OWNER).await.unwrap();
            h.service.shutdown().await;
            account
        };

        let h = harness_with(Arc::new(FileCredentialStore::new(tmp.path())), &["hi"]);
        let report = h.service.restore().await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.started, 1);

        let entry = h.service.registry().current(OWNER).unwrap();
        assert_eq!(entry.key().account, account);
        let settings = entry.settings();
        assert_eq!(settings.target.chat_id, Some(CHAT));
        assert_eq!(
            settings.target.allowed_sender_ids.iter().copied().collect::<Vec<_>>(),
            vec![555, 556]
        );
        assert_eq!(settings.status.reply_delay_secs, 7);
        assert_eq!(settings.status.reply_count.get(), 3);
        assert!(settings.status.enabled);
        assert!(entry.session().is_listening());
        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn select_and_delete_accounts() {
        let h = harness();
        let first = login(&h).await;
        let second = login(&h).await;
        assert_eq!(h.service.registry().default_account(OWNER), Some(second));

        h.service
            .select_account(OWNER, &first.to_string().to_uppercase())
            .unwrap();
        assert_eq!(h.service.registry().default_account(OWNER), Some(first));
        assert!(matches!(
            h.service.select_account(OWNER, "nope"),
            Err(Error::InvalidAccountId { .. })
        ));

        h.service
            .delete_account(OWNER, &first.to_string())
            .await
            .unwrap();
        assert_eq!(h.service.registry().default_account(OWNER), None);
        assert_eq!(client(&h, first).disconnects(), 1);
        assert!(matches!(
            h.service.delete_account(OWNER, &first.to_string()).await,
            Err(Error::UnknownAccount { .. })
        ));

        let listed = h.service.list_accounts(OWNER);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].account, second);
        assert!(!listed[0].is_default);
    }

    #[tokio::test]
    async fn other_owners_cannot_touch_accounts() {
        let h = harness();
        let account = login(&h).await;
        assert!(matches!(
            h.service.select_account(OwnerId(7), &account.to_string()),
            Err(Error::UnknownAccount { .. })
        ));
        assert!(h.service.list_accounts(OwnerId(7)).is_empty());
    }

    struct FailingStore;

    #[async_trait]
    impl CredentialStore for FailingStore {
        async fn load_all(&self) -> Result<crate::store::LoadReport> {
            Ok(crate::store::LoadReport::default())
        }

        async fn save(&self, _record: &StoredAccount) -> Result<()> {
            Err(Error::persistence(
                "failed to write record",
                std::io::Error::other("disk full"),
            ))
        }

        async fn delete(&self, _key: &AccountKey) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn persistence_failure_is_surfaced_and_state_unchanged() {
        let h = harness_with(Arc::new(InMemoryCredentialStore::new()), &["hi"]);
        let identity = AccountIdentity {
            key: AccountKey::new(OWNER, AccountId::generate()),
            credentials: crate::types::ApiCredentials::new(1, "h"),
            session_token: crate::types::SessionToken::new("t"),
        };
        let entry = h
            .service
            .build_entry(identity, AccountSettings::default())
            .unwrap();
        h.service.registry().put(entry.clone());

        let failing = AutoresponderService::new(
            Arc::new(FailingStore),
            h.connector.clone(),
            Arc::new(StaticTemplates::new(["hi"])),
            Pacing::default(),
        );
        failing.registry().put(entry.clone());
        assert!(matches!(
            failing.set_delay(OWNER, 9).await,
            Err(Error::Persistence { .. })
        ));
        assert_eq!(entry.settings().status.reply_delay_secs, 0);
    }

    #[tokio::test]
    async fn restore_skips_accounts_without_target() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let mut settings = AccountSettings::default();
        settings.status.enabled = true;
        store
            .save(&StoredAccount::new(
                AccountIdentity {
                    key: AccountKey::new(OWNER, AccountId::generate()),
                    credentials: crate::types::ApiCredentials::new(1, "h"),
                    session_token: crate::types::SessionToken::new("t"),
                },
                settings,
            ))
            .await
            .unwrap();

        let h = harness_with(store, &["hi"]);
        let report = h.service.restore().await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.started, 0);
        assert!(!h.service.list_accounts(OWNER)[0].listening);
    }
}
