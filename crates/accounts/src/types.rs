//! Identity and per-account settings types.

use std::{collections::BTreeSet, fmt, str::FromStr, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    uuid::{Uuid, Variant, Version},
};

use crate::error::{Error, Result};

/// The operator (control bot user) that owns one or more accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub i64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A managed account, always a random (version 4) UUID rendered in lowercase
/// hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(Uuid);

impl AccountId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an operator- or filename-supplied id. Only the canonical
    /// 36-character hyphenated form of a v4 UUID is accepted; case is
    /// ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let candidate = raw.trim().to_ascii_lowercase();
        if candidate.len() != 36 {
            return Err(Error::invalid_account_id(raw));
        }
        let uuid = Uuid::try_parse(&candidate).map_err(|_| Error::invalid_account_id(raw))?;
        if uuid.get_version() != Some(Version::Random) || uuid.get_variant() != Variant::RFC4122 {
            return Err(Error::invalid_account_id(raw));
        }
        Ok(Self(uuid))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for AccountId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Composite identity used for every per-account lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountKey {
    pub owner: OwnerId,
    pub account: AccountId,
}

impl AccountKey {
    #[must_use]
    pub fn new(owner: OwnerId, account: AccountId) -> Self {
        Self { owner, account }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.owner, self.account)
    }
}

/// How many copies of a reply are sent per trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplyCount(u8);

impl ReplyCount {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 3;

    /// Operator-requested value: anything outside `[1, 3]` is rejected.
    pub fn new(requested: i64) -> Result<Self> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&requested) {
            Ok(Self(requested as u8))
        } else {
            Err(Error::InvalidReplyCount { requested })
        }
    }

    /// Value read back from storage: forced into `[1, 3]`.
    #[must_use]
    pub fn clamped(raw: i64) -> Self {
        Self(raw.clamp(i64::from(Self::MIN), i64::from(Self::MAX)) as u8)
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for ReplyCount {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl fmt::Display for ReplyCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which conversation an account watches and whose messages trigger replies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetConfig {
    pub chat_id: Option<i64>,
    pub allowed_sender_ids: BTreeSet<i64>,
}

/// Autoresponder switches for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoresponderStatus {
    pub enabled: bool,
    pub reply_delay_secs: u64,
    pub reply_count: ReplyCount,
}

impl AutoresponderStatus {
    #[must_use]
    pub fn reply_delay(&self) -> Duration {
        Duration::from_secs(self.reply_delay_secs)
    }
}

/// Everything the operator can change about an account. Cloned as a whole
/// whenever a consistent snapshot is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSettings {
    pub target: TargetConfig,
    pub status: AutoresponderStatus,
}

/// Application credentials obtained from my.telegram.org.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_id: i32,
    pub api_hash: Secret<String>,
}

impl ApiCredentials {
    #[must_use]
    pub fn new(api_id: i32, api_hash: impl Into<String>) -> Self {
        Self {
            api_id,
            api_hash: Secret::new(api_hash.into()),
        }
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &"[REDACTED]")
            .finish()
    }
}

/// Opaque, platform-specific session blob. Persisted verbatim.
#[derive(Clone)]
pub struct SessionToken(Secret<String>);

impl SessionToken {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Secret::new(raw.into()))
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// A fully authenticated account.
#[derive(Debug, Clone)]
pub struct AccountIdentity {
    pub key: AccountKey,
    pub credentials: ApiCredentials,
    pub session_token: SessionToken,
}
