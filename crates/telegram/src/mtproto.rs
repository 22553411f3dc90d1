//! Account connections over MTProto (grammers).
//!
//! Sessions are exported as base64 of the grammers session blob and stored
//! verbatim in the account record.
//!
//! Logins talk `auth.sendCode`/`auth.signIn` directly so the RPC error name
//! of a rejected code survives to [`classify`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    grammers_client::{
        Client, Config, InitParams, InputMessage, InvocationError, SignInError, Update,
        types::PasswordToken,
    },
    grammers_session::{PackedChat, PackedType, Session},
    grammers_tl_types as tl,
    parrot_accounts::{
        platform::{
            CodeOutcome, InboundEvent, LoginHandshake, PlatformClient, PlatformConnector,
            PlatformError, PlatformResult,
        },
        types::{AccountIdentity, AccountKey, ApiCredentials, SessionToken},
    },
    secrecy::ExposeSecret,
    tracing::{debug, info, warn},
};

/// Offset between a bare channel id and its marked (`-100…`) form.
const CHANNEL_MARK: i64 = 1_000_000_000_000;

/// Data center a fresh session connects to.
const DEFAULT_DC: i32 = 2;

/// RPC status Telegram uses for `*_MIGRATE_n`.
const SEE_OTHER: i32 = 303;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The chat id as the Bot API and operators write it.
fn marked_id(chat: &PackedChat) -> i64 {
    match chat.ty {
        PackedType::User | PackedType::Bot => chat.id,
        PackedType::Chat => -chat.id,
        _ => -(CHANNEL_MARK + chat.id),
    }
}

/// Classify an RPC failure by its Telegram error name.
fn classify(error: InvocationError) -> PlatformError {
    match error {
        InvocationError::Rpc(rpc) => classify_rpc(&rpc.name, rpc.code, rpc.value),
        InvocationError::Dropped | InvocationError::Io(_) => {
            PlatformError::connection(error.to_string())
        },
        other => PlatformError::other(other.to_string()),
    }
}

fn classify_rpc(name: &str, code: i32, value: Option<u32>) -> PlatformError {
    match name {
        "FLOOD_WAIT" | "FLOOD_PREMIUM_WAIT" | "SLOWMODE_WAIT" => PlatformError::RateLimited {
            wait: Duration::from_secs(u64::from(value.unwrap_or(1))),
        },
        "CHAT_WRITE_FORBIDDEN"
        | "CHAT_SEND_PLAIN_FORBIDDEN"
        | "CHAT_RESTRICTED"
        | "USER_BANNED_IN_CHANNEL"
        | "CHANNEL_PRIVATE" => PlatformError::SendForbidden {
            reason: name.to_string(),
        },
        "PHONE_CODE_INVALID" | "PHONE_CODE_EMPTY" => PlatformError::CodeInvalid,
        "PHONE_CODE_EXPIRED" => PlatformError::CodeExpired,
        "SESSION_PASSWORD_NEEDED" => PlatformError::PasswordRequired,
        "PASSWORD_HASH_INVALID" => PlatformError::PasswordInvalid,
        "AUTH_KEY_UNREGISTERED" | "AUTH_KEY_INVALID" | "SESSION_REVOKED" | "SESSION_EXPIRED"
        | "USER_DEACTIVATED" | "USER_DEACTIVATED_BAN" => PlatformError::Unauthorized,
        _ => PlatformError::other(format!("{name} ({code})")),
    }
}

fn export_session(client: &Client) -> SessionToken {
    SessionToken::new(BASE64.encode(client.session().save()))
}

async fn open_client(credentials: &ApiCredentials, session: Session) -> PlatformResult<Client> {
    Client::connect(Config {
        session,
        api_id: credentials.api_id,
        api_hash: credentials.api_hash.expose_secret().clone(),
        params: InitParams::default(),
    })
    .await
    .map_err(|e| PlatformError::connection(e.to_string()))
}

async fn send_code(
    client: &Client,
    credentials: &ApiCredentials,
    phone: &str,
) -> Result<tl::enums::auth::SentCode, InvocationError> {
    client
        .invoke(&tl::functions::auth::SendCode {
            phone_number: phone.to_string(),
            api_id: credentials.api_id,
            api_hash: credentials.api_hash.expose_secret().clone(),
            settings: tl::types::CodeSettings {
                allow_flashcall: false,
                current_number: false,
                allow_app_hash: false,
                allow_missed_call: false,
                allow_firebase: false,
                unknown_number: false,
                logout_tokens: None,
                token: None,
                app_sandbox: None,
            }
            .into(),
        })
        .await
}

fn phone_code_hash(sent: tl::enums::auth::SentCode) -> PlatformResult<String> {
    match sent {
        tl::enums::auth::SentCode::Code(code) => Ok(code.phone_code_hash),
        _ => Err(PlatformError::other(
            "Telegram did not send a login code for this number",
        )),
    }
}

/// Fresh SRP parameters for one `auth.checkPassword` attempt.
async fn password_token(client: &Client) -> PlatformResult<PasswordToken> {
    let tl::enums::account::Password::Password(password) = client
        .invoke(&tl::functions::account::GetPassword {})
        .await
        .map_err(classify)?;
    Ok(PasswordToken::new(password))
}

/// Builds [`MtprotoClient`]s and runs phone logins.
#[derive(Debug, Default, Clone, Copy)]
pub struct MtprotoConnector;

impl MtprotoConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlatformConnector for MtprotoConnector {
    fn client(&self, identity: &AccountIdentity) -> PlatformResult<Arc<dyn PlatformClient>> {
        Ok(Arc::new(MtprotoClient::new(identity.clone())?))
    }

    async fn request_code(
        &self,
        credentials: &ApiCredentials,
        phone: &str,
    ) -> PlatformResult<Box<dyn LoginHandshake>> {
        let mut dc = DEFAULT_DC;
        let mut client = open_client(credentials, Session::new()).await?;
        let sent = match send_code(&client, credentials, phone).await {
            Ok(sent) => sent,
            // The number is homed on another data center; start over there.
            Err(InvocationError::Rpc(rpc)) if rpc.code == SEE_OTHER => {
                dc = rpc
                    .value
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| PlatformError::other(format!("{} without a data center", rpc.name)))?;
                debug!(dc, "phone number lives on another data center");
                let session = Session::new();
                session.set_user(0, dc, false);
                client = open_client(credentials, session).await?;
                send_code(&client, credentials, phone)
                    .await
                    .map_err(classify)?
            },
            Err(e) => return Err(classify(e)),
        };
        let phone_code_hash = phone_code_hash(sent)?;
        debug!(api_id = credentials.api_id, dc, "login code sent");
        Ok(Box::new(MtprotoHandshake {
            client,
            dc,
            phone: phone.to_string(),
            phone_code_hash,
            password: None,
        }))
    }
}

struct MtprotoHandshake {
    client: Client,
    dc: i32,
    phone: String,
    phone_code_hash: String,
    password: Option<PasswordToken>,
}

#[async_trait]
impl LoginHandshake for MtprotoHandshake {
    async fn submit_code(&mut self, code: &str) -> PlatformResult<CodeOutcome> {
        let request = tl::functions::auth::SignIn {
            phone_number: self.phone.clone(),
            phone_code_hash: self.phone_code_hash.clone(),
            phone_code: Some(code.to_string()),
            email_verification: None,
        };
        match self.client.invoke(&request).await {
            Ok(tl::enums::auth::Authorization::Authorization(auth)) => {
                if let tl::enums::User::User(user) = &auth.user {
                    self.client.session().set_user(user.id, self.dc, user.bot);
                }
                Ok(CodeOutcome::Authorized(export_session(&self.client)))
            },
            Ok(tl::enums::auth::Authorization::SignUpRequired(_)) => Err(PlatformError::other(
                "this phone number has no Telegram account",
            )),
            Err(e) => match classify(e) {
                PlatformError::PasswordRequired => {
                    self.password = Some(password_token(&self.client).await?);
                    Ok(CodeOutcome::PasswordRequired)
                },
                other => Err(other),
            },
        }
    }

    async fn submit_password(&mut self, password: &str) -> PlatformResult<SessionToken> {
        let token = match self.password.take() {
            Some(token) => token,
            None => password_token(&self.client).await?,
        };
        match self.client.check_password(token, password.as_bytes()).await {
            Ok(_) => Ok(export_session(&self.client)),
            Err(SignInError::InvalidPassword) => {
                // SRP parameters are single use.
                self.password = Some(password_token(&self.client).await?);
                Err(PlatformError::PasswordInvalid)
            },
            Err(SignInError::Other(e)) => Err(classify(e)),
            Err(e) => Err(PlatformError::other(e.to_string())),
        }
    }
}

/// One authorized account connection.
pub struct MtprotoClient {
    key: AccountKey,
    credentials: ApiCredentials,
    session: Vec<u8>,
    client: Mutex<Option<Client>>,
    /// Chats seen in inbound updates; sending needs their access hash.
    chats: Mutex<HashMap<i64, PackedChat>>,
}

impl MtprotoClient {
    pub fn new(identity: AccountIdentity) -> PlatformResult<Self> {
        let session = BASE64
            .decode(identity.session_token.expose().trim())
            .map_err(|e| PlatformError::other(format!("stored session is not base64: {e}")))?;
        Ok(Self {
            key: identity.key,
            credentials: identity.credentials,
            session,
            client: Mutex::new(None),
            chats: Mutex::new(HashMap::new()),
        })
    }

    fn current(&self) -> PlatformResult<Client> {
        lock(&self.client)
            .clone()
            .ok_or_else(|| PlatformError::connection("not connected"))
    }
}

#[async_trait]
impl PlatformClient for MtprotoClient {
    async fn connect(&self) -> PlatformResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let session = Session::load(&self.session)
            .map_err(|e| PlatformError::other(format!("stored session is unreadable: {e}")))?;
        let client = open_client(&self.credentials, session).await?;
        if !client.is_authorized().await.map_err(classify)? {
            warn!(key = %self.key, "stored session is no longer authorized");
            return Err(PlatformError::Unauthorized);
        }
        *lock(&self.client) = Some(client);
        info!(key = %self.key, "mtproto client connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.client).is_some()
    }

    async fn next_event(&self) -> PlatformResult<InboundEvent> {
        let client = self.current()?;
        loop {
            let Update::NewMessage(message) = client.next_update().await.map_err(classify)? else {
                continue;
            };
            let chat = message.chat().pack();
            let chat_id = marked_id(&chat);
            lock(&self.chats).insert(chat_id, chat);
            return Ok(InboundEvent {
                message_id: message.id(),
                chat_id,
                sender_id: message.sender().map(|s| marked_id(&s.pack())),
                outgoing: message.outgoing(),
                text: message.text().to_string(),
            });
        }
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> PlatformResult<()> {
        let client = self.current()?;
        let chat = lock(&self.chats)
            .get(&chat_id)
            .copied()
            .ok_or_else(|| PlatformError::other(format!("chat {chat_id} has not been seen yet")))?;
        client
            .send_message(chat, InputMessage::text(text))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn disconnect(&self) -> PlatformResult<()> {
        if lock(&self.client).take().is_some() {
            debug!(key = %self.key, "mtproto client dropped");
        }
        Ok(())
    }
}
