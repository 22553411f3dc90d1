//! Persistence trait and the on-disk record format.

use std::collections::BTreeSet;

use {
    async_trait::async_trait,
    secrecy::ExposeSecret,
    serde::{Deserialize, Deserializer, Serialize},
};

use crate::{
    error::Result,
    types::{
        AccountId, AccountIdentity, AccountKey, AccountSettings, ApiCredentials,
        AutoresponderStatus, OwnerId, ReplyCount, SessionToken, TargetConfig,
    },
};

/// One account as it lives in the store.
#[derive(Debug, Clone)]
pub struct StoredAccount {
    pub identity: AccountIdentity,
    pub settings: AccountSettings,
}

impl StoredAccount {
    #[must_use]
    pub fn new(identity: AccountIdentity, settings: AccountSettings) -> Self {
        Self { identity, settings }
    }

    #[must_use]
    pub fn key(&self) -> AccountKey {
        self.identity.key
    }
}

/// Outcome of a bulk load. Records that could not be read are skipped and
/// counted, never fatal.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<StoredAccount>,
    pub skipped: usize,
}

/// Persistence backend for account records. Each account is an independent
/// unit; no two accounts share a record.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_all(&self) -> Result<LoadReport>;

    /// Write the full record, replacing any previous version.
    async fn save(&self, record: &StoredAccount) -> Result<()>;

    /// Remove a record. Returns `false` when there was nothing to remove.
    async fn delete(&self, key: &AccountKey) -> Result<bool>;
}

/// Serialized form of a single account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AccountRecord {
    #[serde(deserialize_with = "string_or_integer")]
    pub api_id: String,
    pub api_hash: String,
    #[serde(alias = "session_str")]
    pub session_token: String,
    #[serde(default)]
    pub target_data: TargetRecord,
    #[serde(default)]
    pub autoresponder_status: bool,
    #[serde(default)]
    pub response_delay: i64,
    #[serde(default = "default_multi_response")]
    pub multi_response: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TargetRecord {
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

fn default_multi_response() -> i64 {
    1
}

/// `api_id` was historically written as a number; accept both.
fn string_or_integer<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(n) => n.to_string(),
    })
}

/// Why a record on disk could not be turned into an account.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RecordError {
    #[error("file name is not <owner>_<uuid-v4>.json")]
    BadFileName,
    #[error("api_id {0:?} is not a number")]
    BadApiId(String),
    #[error("session token is empty")]
    EmptyToken,
}

impl AccountRecord {
    pub(crate) fn from_stored(stored: &StoredAccount) -> Self {
        let AccountSettings { target, status } = &stored.settings;
        Self {
            api_id: stored.identity.credentials.api_id.to_string(),
            api_hash: stored
                .identity
                .credentials
                .api_hash
                .expose_secret()
                .clone(),
            session_token: stored.identity.session_token.expose().to_string(),
            target_data: TargetRecord {
                chat_id: target.chat_id,
                user_ids: target.allowed_sender_ids.iter().copied().collect(),
            },
            autoresponder_status: status.enabled,
            response_delay: i64::try_from(status.reply_delay_secs).unwrap_or(i64::MAX),
            multi_response: i64::from(status.reply_count.get()),
        }
    }

    pub(crate) fn into_stored(
        self,
        key: AccountKey,
    ) -> std::result::Result<StoredAccount, RecordError> {
        let api_id = self
            .api_id
            .trim()
            .parse::<i32>()
            .map_err(|_| RecordError::BadApiId(self.api_id.clone()))?;
        if self.session_token.is_empty() {
            return Err(RecordError::EmptyToken);
        }
        let identity = AccountIdentity {
            key,
            credentials: ApiCredentials::new(api_id, self.api_hash),
            session_token: SessionToken::new(self.session_token),
        };
        let settings = AccountSettings {
            target: TargetConfig {
                chat_id: self.target_data.chat_id,
                allowed_sender_ids: self
                    .target_data
                    .user_ids
                    .into_iter()
                    .collect::<BTreeSet<_>>(),
            },
            status: AutoresponderStatus {
                enabled: self.autoresponder_status,
                reply_delay_secs: u64::try_from(self.response_delay).unwrap_or(0),
                reply_count: ReplyCount::clamped(self.multi_response),
            },
        };
        Ok(StoredAccount::new(identity, settings))
    }
}

/// `<owner>_<account>.json`
pub(crate) fn file_name(key: &AccountKey) -> String {
    format!("{key}.json")
}

/// Inverse of [`file_name`]. Rejects anything whose account part is not a
/// canonical v4 UUID.
pub(crate) fn parse_file_name(name: &str) -> std::result::Result<AccountKey, RecordError> {
    let stem = name.strip_suffix(".json").ok_or(RecordError::BadFileName)?;
    let (owner, raw_account) = stem.split_once('_').ok_or(RecordError::BadFileName)?;
    let owner = owner.parse::<i64>().map_err(|_| RecordError::BadFileName)?;
    let account = AccountId::parse(raw_account).map_err(|_| RecordError::BadFileName)?;
    // Files are always written lowercase; anything else was not written by us.
    if account.to_string() != raw_account {
        return Err(RecordError::BadFileName);
    }
    Ok(AccountKey::new(OwnerId(owner), account))
}
