//! Scriptable in-process platform used by unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{sync::mpsc, time::Instant},
};

use crate::{
    platform::{
        CodeOutcome, InboundEvent, LoginHandshake, PlatformClient, PlatformConnector,
        PlatformError, PlatformResult,
    },
    types::{AccountIdentity, AccountKey, ApiCredentials, SessionToken},
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outcome for one scripted send. Unscripted sends succeed.
#[derive(Debug, Clone)]
pub enum SendScript {
    RateLimited(Duration),
    Forbidden,
    Fail,
}

#[derive(Debug, Clone)]
pub struct SendAttempt {
    pub chat_id: i64,
    pub text: String,
    pub at: Instant,
    pub delivered: bool,
}

pub struct FakeClient {
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail_connect: AtomicBool,
    events_tx: mpsc::UnboundedSender<PlatformResult<InboundEvent>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PlatformResult<InboundEvent>>>,
    script: Mutex<VecDeque<SendScript>>,
    attempts: Mutex<Vec<SendAttempt>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            script: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn push_event(&self, event: InboundEvent) {
        let _ = self.events_tx.send(Ok(event));
    }

    pub fn push_error(&self, error: PlatformError) {
        let _ = self.events_tx.send(Err(error));
    }

    pub fn script_send(&self, outcome: SendScript) {
        lock(&self.script).push_back(outcome);
    }

    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<SendAttempt> {
        lock(&self.attempts).clone()
    }

    pub fn sent(&self) -> Vec<SendAttempt> {
        self.attempts().into_iter().filter(|a| a.delivered).collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformClient for FakeClient {
    async fn connect(&self) -> PlatformResult<()> {
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(PlatformError::connection("scripted connect failure"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn next_event(&self) -> PlatformResult<InboundEvent> {
        let mut rx = self.events_rx.lock().await;
        match rx.recv().await {
            Some(event) => event,
            None => Err(PlatformError::connection("event stream closed")),
        }
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> PlatformResult<()> {
        let scripted = lock(&self.script).pop_front();
        let result = match scripted {
            None => Ok(()),
            Some(SendScript::RateLimited(wait)) => Err(PlatformError::RateLimited { wait }),
            Some(SendScript::Forbidden) => Err(PlatformError::SendForbidden {
                reason: "CHAT_WRITE_FORBIDDEN".into(),
            }),
            Some(SendScript::Fail) => Err(PlatformError::other("scripted failure")),
        };
        lock(&self.attempts).push(SendAttempt {
            chat_id,
            text: text.to_string(),
            at: Instant::now(),
            delivered: result.is_ok(),
        });
        result
    }

    async fn disconnect(&self) -> PlatformResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// How the next login handshake behaves.
#[derive(Debug, Clone)]
pub struct LoginScript {
    pub valid_code: String,
    pub password: Option<String>,
    pub code_expired: bool,
    pub request_error: Option<String>,
}

impl Default for LoginScript {
    fn default() -> Self {
        Self {
            valid_code: "54321".into(),
            password: None,
            code_expired: false,
            request_error: None,
        }
    }
}

struct FakeHandshake {
    phone: String,
    script: LoginScript,
}

impl FakeHandshake {
    fn token(&self) -> SessionToken {
        SessionToken::new(format!("fake-session-{}", self.phone.trim_start_matches('+')))
    }
}

#[async_trait]
impl LoginHandshake for FakeHandshake {
    async fn submit_code(&mut self, code: &str) -> PlatformResult<CodeOutcome> {
        if self.script.code_expired {
            return Err(PlatformError::CodeExpired);
        }
        if code != self.script.valid_code {
            return Err(PlatformError::CodeInvalid);
        }
        if self.script.password.is_some() {
            return Ok(CodeOutcome::PasswordRequired);
        }
        Ok(CodeOutcome::Authorized(self.token()))
    }

    async fn submit_password(&mut self, password: &str) -> PlatformResult<SessionToken> {
        match &self.script.password {
            Some(expected) if expected == password => Ok(self.token()),
            _ => Err(PlatformError::PasswordInvalid),
        }
    }
}

#[derive(Default)]
pub struct FakeConnector {
    clients: Mutex<HashMap<AccountKey, Arc<FakeClient>>>,
    login: Mutex<LoginScript>,
    code_requests: Mutex<Vec<(i32, String)>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_login(&self, script: LoginScript) {
        *lock(&self.login) = script;
    }

    /// Client handed out for `key`, if one was created.
    pub fn client_for(&self, key: &AccountKey) -> Option<Arc<FakeClient>> {
        lock(&self.clients).get(key).cloned()
    }

    pub fn code_requests(&self) -> Vec<(i32, String)> {
        lock(&self.code_requests).clone()
    }
}

#[async_trait]
impl PlatformConnector for FakeConnector {
    fn client(&self, identity: &AccountIdentity) -> PlatformResult<Arc<dyn PlatformClient>> {
        let client = lock(&self.clients)
            .entry(identity.key)
            .or_insert_with(FakeClient::new)
            .clone();
        Ok(client)
    }

    async fn request_code(
        &self,
        credentials: &ApiCredentials,
        phone: &str,
    ) -> PlatformResult<Box<dyn LoginHandshake>> {
        lock(&self.code_requests).push((credentials.api_id, phone.to_string()));
        let script = lock(&self.login).clone();
        if let Some(message) = &script.request_error {
            return Err(PlatformError::connection(message.clone()));
        }
        Ok(Box::new(FakeHandshake {
            phone: phone.to_string(),
            script,
        }))
    }
}
