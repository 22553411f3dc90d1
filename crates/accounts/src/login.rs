//! Conversational login: api id, api hash, phone, code, optional password.
//!
//! One handshake per owner. Inputs are plain strings from chat; nothing
//! submitted here is ever logged.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, LazyLock, Mutex},
};

use {
    regex::Regex,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    platform::{CodeOutcome, LoginHandshake, PlatformConnector, PlatformError},
    types::{AccountId, AccountIdentity, AccountKey, ApiCredentials, OwnerId, SessionToken},
};

#[allow(clippy::expect_used)]
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9]\d{7,14}$").expect("phone pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoginStage {
    ApiId,
    ApiHash,
    Phone,
    Code,
    TwoFactor,
}

impl LoginStage {
    /// What the operator should send next.
    #[must_use]
    pub fn prompt(self) -> &'static str {
        match self {
            Self::ApiId => "Send your api_id (digits, from my.telegram.org).",
            Self::ApiHash => "Send your api_hash.",
            Self::Phone => "Send the phone number in international format, e.g. +15551234567.",
            Self::Code => "Send the login code Telegram just sent you. Separate the digits with dashes (1-2-3-4-5) so Telegram does not expire it.",
            Self::TwoFactor => "This account has two-step verification. Send the cloud password.",
        }
    }
}

/// Why an input was refused without leaving the current stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputProblem {
    ApiIdNotNumeric,
    Empty,
    PhoneMalformed,
    CodeMalformed,
    CodeRejected,
    PasswordRejected,
    /// Transient platform trouble; the same input may be retried.
    Unavailable(String),
}

impl fmt::Display for InputProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiIdNotNumeric => f.write_str("api_id must be a number"),
            Self::Empty => f.write_str("input is empty"),
            Self::PhoneMalformed => f.write_str("that does not look like a phone number"),
            Self::CodeMalformed => f.write_str("the code should only contain digits"),
            Self::CodeRejected => f.write_str("Telegram rejected that code"),
            Self::PasswordRejected => f.write_str("wrong password"),
            Self::Unavailable(reason) => write!(f, "Telegram error: {reason}"),
        }
    }
}

#[derive(Debug)]
pub enum LoginStep {
    /// Input accepted; the handshake now waits at this stage.
    Advanced(LoginStage),
    /// Input refused; same stage, earlier answers kept.
    Retry {
        stage: LoginStage,
        problem: InputProblem,
    },
    /// Message already consumed (a redelivery); nothing happened.
    Ignored,
    /// Authorized. The handshake is gone; the caller owns the identity now.
    Completed(AccountIdentity),
}

fn parse_api_id(input: &str) -> Option<i32> {
    let input = input.trim();
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    input.parse().ok()
}

/// Digits only; the separators operators use to dodge code invalidation
/// are dropped.
fn normalize_code(input: &str) -> Option<String> {
    let code: String = input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect();
    (!code.is_empty() && code.bytes().all(|b| b.is_ascii_digit())).then_some(code)
}

pub struct LoginSession {
    key: AccountKey,
    stage: LoginStage,
    api_id: Option<i32>,
    api_hash: Option<String>,
    handshake: Option<Box<dyn LoginHandshake>>,
    consumed: HashSet<i32>,
}

impl LoginSession {
    fn new(key: AccountKey) -> Self {
        Self {
            key,
            stage: LoginStage::ApiId,
            api_id: None,
            api_hash: None,
            handshake: None,
            consumed: HashSet::new(),
        }
    }

    pub fn key(&self) -> AccountKey {
        self.key
    }

    pub fn stage(&self) -> LoginStage {
        self.stage
    }

    fn credentials(&self) -> Result<ApiCredentials> {
        match (self.api_id, &self.api_hash) {
            (Some(id), Some(hash)) => Ok(ApiCredentials::new(id, hash.clone())),
            _ => Err(Error::NoHandshake),
        }
    }

    fn retry(&self, problem: InputProblem) -> LoginStep {
        LoginStep::Retry {
            stage: self.stage,
            problem,
        }
    }

    fn advance_to(&mut self, stage: LoginStage) -> LoginStep {
        self.stage = stage;
        LoginStep::Advanced(stage)
    }

    fn complete(&self, token: SessionToken) -> Result<LoginStep> {
        if token.is_empty() {
            return Err(PlatformError::other("platform returned an empty session").into());
        }
        Ok(LoginStep::Completed(AccountIdentity {
            key: self.key,
            credentials: self.credentials()?,
            session_token: token,
        }))
    }

    /// Apply one operator input. `Err` means the handshake is over.
    async fn advance(
        &mut self,
        connector: &dyn PlatformConnector,
        input: &str,
    ) -> Result<LoginStep> {
        match self.stage {
            LoginStage::ApiId => Ok(match parse_api_id(input) {
                Some(id) => {
                    self.api_id = Some(id);
                    self.advance_to(LoginStage::ApiHash)
                },
                None => self.retry(InputProblem::ApiIdNotNumeric),
            }),
            LoginStage::ApiHash => {
                let hash = input.trim();
                if hash.is_empty() {
                    return Ok(self.retry(InputProblem::Empty));
                }
                self.api_hash = Some(hash.to_string());
                Ok(self.advance_to(LoginStage::Phone))
            },
            LoginStage::Phone => {
                let phone = input.trim();
                if !PHONE_RE.is_match(phone) {
                    return Ok(self.retry(InputProblem::PhoneMalformed));
                }
                let credentials = self.credentials()?;
                let handshake = connector.request_code(&credentials, phone).await?;
                info!(key = %self.key, "login code requested");
                self.handshake = Some(handshake);
                Ok(self.advance_to(LoginStage::Code))
            },
            LoginStage::Code => {
                let Some(code) = normalize_code(input) else {
                    return Ok(self.retry(InputProblem::CodeMalformed));
                };
                let handshake = self.handshake.as_mut().ok_or(Error::NoHandshake)?;
                match handshake.submit_code(&code).await {
                    Ok(CodeOutcome::Authorized(token)) => self.complete(token),
                    Ok(CodeOutcome::PasswordRequired) | Err(PlatformError::PasswordRequired) => {
                        debug!(key = %self.key, "account requires a cloud password");
                        Ok(self.advance_to(LoginStage::TwoFactor))
                    },
                    Err(PlatformError::CodeInvalid) => Ok(self.retry(InputProblem::CodeRejected)),
                    Err(PlatformError::CodeExpired) => Err(Error::ExpiredChallenge),
                    Err(e) if e.is_fatal() => Err(e.into()),
                    Err(e) => Ok(self.retry(InputProblem::Unavailable(e.to_string()))),
                }
            },
            LoginStage::TwoFactor => {
                if input.is_empty() {
                    return Ok(self.retry(InputProblem::Empty));
                }
                let handshake = self.handshake.as_mut().ok_or(Error::NoHandshake)?;
                match handshake.submit_password(input).await {
                    Ok(token) => self.complete(token),
                    Err(PlatformError::PasswordInvalid) => {
                        Ok(self.retry(InputProblem::PasswordRejected))
                    },
                    Err(e) if e.is_fatal() => Err(e.into()),
                    Err(e) => Ok(self.retry(InputProblem::Unavailable(e.to_string()))),
                }
            },
        }
    }
}

type SharedSession = Arc<tokio::sync::Mutex<LoginSession>>;

/// All in-progress handshakes, at most one per owner.
#[derive(Default)]
pub struct LoginManager {
    sessions: Mutex<HashMap<OwnerId, SharedSession>>,
}

impl LoginManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<OwnerId, SharedSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a handshake with a freshly generated account id.
    pub fn begin(&self, owner: OwnerId) -> Result<AccountKey> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&owner) {
            return Err(Error::HandshakeInProgress);
        }
        let key = AccountKey::new(owner, AccountId::generate());
        sessions.insert(
            owner,
            Arc::new(tokio::sync::Mutex::new(LoginSession::new(key))),
        );
        info!(%key, "login started");
        Ok(key)
    }

    pub fn is_active(&self, owner: OwnerId) -> bool {
        self.sessions().contains_key(&owner)
    }

    /// Current stage, or `None` when idle or mid-step.
    pub fn stage(&self, owner: OwnerId) -> Option<LoginStage> {
        let session = self.sessions().get(&owner).cloned()?;
        session.try_lock().ok().map(|s| s.stage())
    }

    /// Drop the owner's handshake, if any.
    pub fn abandon(&self, owner: OwnerId) -> Option<AccountKey> {
        let session = self.sessions().remove(&owner)?;
        let key = session.try_lock().ok().map(|s| s.key());
        info!(%owner, "login abandoned");
        key
    }

    /// Drop every handshake (shutdown).
    pub fn clear(&self) {
        self.sessions().clear();
    }

    /// Feed one operator message into the owner's handshake. `message_id`
    /// deduplicates redelivered messages.
    pub async fn submit(
        &self,
        owner: OwnerId,
        message_id: Option<i32>,
        input: &str,
        connector: &dyn PlatformConnector,
    ) -> Result<LoginStep> {
        let session = self
            .sessions()
            .get(&owner)
            .cloned()
            .ok_or(Error::NoHandshake)?;

        let mut guard = session.lock().await;
        if let Some(id) = message_id
            && !guard.consumed.insert(id)
        {
            return Ok(LoginStep::Ignored);
        }

        let outcome = guard.advance(connector, input).await;
        let stage = guard.stage;
        drop(guard);

        let finished = matches!(outcome, Ok(LoginStep::Completed(_)) | Err(_));
        let still_current = {
            let mut sessions = self.sessions();
            let current = sessions
                .get(&owner)
                .is_some_and(|s| Arc::ptr_eq(s, &session));
            if current && finished {
                sessions.remove(&owner);
            }
            current
        };

        if !still_current {
            // Cancelled while the platform call was in flight.
            return Err(Error::NoHandshake);
        }
        match &outcome {
            Ok(LoginStep::Completed(identity)) => info!(key = %identity.key, "login completed"),
            Err(e) => warn!(%owner, ?stage, error = %e, "login aborted"),
            Ok(_) => {},
        }
        outcome
    }
}
