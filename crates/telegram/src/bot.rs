use std::time::Duration;

use {
    parrot_config::ControlBotConfig,
    secrecy::ExposeSecret,
    teloxide::{
        ApiError, RequestError,
        prelude::*,
        types::{AllowedUpdate, UpdateKind},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    commands::bot_commands,
    error::{Error, Result},
    handlers::{self, ControlContext},
};

/// Long-poll timeout passed to `getUpdates`, in seconds.
const POLL_TIMEOUT_SECS: u32 = 30;

/// Pause after a failed `getUpdates` before polling again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A verified bot connection.
pub struct ControlBot {
    pub bot: Bot,
    pub username: Option<String>,
}

/// Build the bot, verify the token and prepare it for long polling.
pub async fn connect(config: &ControlBotConfig) -> Result<ControlBot> {
    // Client timeout must outlast the long-poll timeout or every idle poll
    // would be aborted client-side.
    let client = teloxide::net::default_reqwest_settings()
        .timeout(Duration::from_secs(45))
        .build()?;
    let bot = Bot::with_client(config.token.expose_secret(), client);

    let me = bot.get_me().await?;
    let username = me.username.clone();

    // Delete any existing webhook so long polling works.
    bot.delete_webhook().send().await?;

    // Register slash commands for autocomplete in Telegram clients.
    if let Err(e) = bot.set_my_commands(bot_commands()).await {
        warn!("failed to register bot commands: {e}");
    }

    info!(username = ?username, "control bot connected (webhook cleared)");
    Ok(ControlBot { bot, username })
}

/// Process updates until `cancel` fires.
///
/// Returns `Ok(())` on cancellation. Another process polling with the same
/// token is fatal for this loop and comes back as an error so the caller can
/// decide whether to restart.
pub async fn run_polling(bot: &Bot, ctx: &ControlContext, cancel: CancellationToken) -> Result<()> {
    info!("starting control bot polling loop");
    let mut offset: i32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("control bot polling stopped");
                return Ok(());
            },
            result = bot
                .get_updates()
                .offset(offset)
                .timeout(POLL_TIMEOUT_SECS)
                .allowed_updates(vec![AllowedUpdate::Message])
                .send() => result,
        };

        match result {
            Ok(updates) => {
                debug!(count = updates.len(), "got telegram updates");
                for update in updates {
                    offset = update.id.as_offset();
                    match update.kind {
                        UpdateKind::Message(msg) => {
                            let chat_id = msg.chat.id.0;
                            if let Err(e) = handlers::handle_message(msg, bot, ctx).await {
                                error!(chat_id, error = %e, "error handling control message");
                            }
                        },
                        other => debug!("ignoring non-message update: {other:?}"),
                    }
                }
            },
            Err(RequestError::Api(ApiError::TerminatedByOtherGetUpdates)) => {
                warn!("another instance is already running with this bot token");
                return Err(Error::PollingConflict);
            },
            Err(e) => {
                warn!(error = %e, "telegram getUpdates failed");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {},
                }
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        axum::{Json, Router, extract::State, http::Uri, routing::post},
        parrot_accounts::{
            AutoresponderService,
            platform::{
                LoginHandshake, PlatformClient, PlatformConnector, PlatformError, PlatformResult,
            },
            sender::Pacing,
            store_memory::InMemoryCredentialStore,
            templates::StaticTemplates,
            types::{AccountIdentity, ApiCredentials},
        },
        serde_json::json,
        std::sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        tokio::sync::oneshot,
    };

    struct NoPlatform;

    #[async_trait::async_trait]
    impl PlatformConnector for NoPlatform {
        fn client(&self, _identity: &AccountIdentity) -> PlatformResult<Arc<dyn PlatformClient>> {
            Err(PlatformError::other("unused"))
        }

        async fn request_code(
            &self,
            _credentials: &ApiCredentials,
            _phone: &str,
        ) -> PlatformResult<Box<dyn LoginHandshake>> {
            Err(PlatformError::other("unused"))
        }
    }

    /// Serves one `/help` message on the first `getUpdates`, then either
    /// conflicts or returns nothing.
    #[derive(Clone)]
    struct MockApi {
        polls: Arc<AtomicUsize>,
        sent: Arc<Mutex<Vec<String>>>,
        conflict_after_first: bool,
    }

    async fn handler(State(api): State<MockApi>, uri: Uri) -> Json<serde_json::Value> {
        let method = uri.path().rsplit('/').next().unwrap_or_default().to_string();
        if method.eq_ignore_ascii_case("GetUpdates") {
            let n = api.polls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Json(json!({
                    "ok": true,
                    "result": [{
                        "update_id": 10,
                        "message": {
                            "message_id": 1,
                            "date": 1,
                            "chat": { "id": 42, "type": "private", "first_name": "Alice" },
                            "from": { "id": 1001, "is_bot": false, "first_name": "Alice" },
                            "text": "/help"
                        }
                    }]
                }));
            }
            if api.conflict_after_first {
                return Json(json!({
                    "ok": false,
                    "error_code": 409,
                    "description": "Conflict: terminated by other getUpdates request; make sure that only one bot instance is running"
                }));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Json(json!({ "ok": true, "result": [] }));
        }
        if method.eq_ignore_ascii_case("SendMessage") {
            api.sent.lock().unwrap().push(method);
            return Json(json!({
                "ok": true,
                "result": {
                    "message_id": 2,
                    "date": 0,
                    "chat": { "id": 42, "type": "private", "first_name": "Alice" },
                    "text": "ok"
                }
            }));
        }
        Json(json!({ "ok": true, "result": true }))
    }

    async fn serve(api: MockApi) -> (Bot, oneshot::Sender<()>) {
        let app = Router::new()
            .route("/{*path}", post(handler))
            .with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("serve mock telegram api");
        });
        let api_url = reqwest::Url::parse(&format!("http://{addr}/")).expect("parse api url");
        (Bot::new("test-token").set_api_url(api_url), shutdown_tx)
    }

    fn context() -> ControlContext {
        ControlContext {
            service: Arc::new(AutoresponderService::new(
                Arc::new(InMemoryCredentialStore::new()),
                Arc::new(NoPlatform),
                Arc::new(StaticTemplates::new(["hi"])),
                Pacing::default(),
            )),
            whitelist: vec![1001],
            bot_username: None,
        }
    }

    fn mock(conflict_after_first: bool) -> MockApi {
        MockApi {
            polls: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
            conflict_after_first,
        }
    }

    #[tokio::test]
    async fn conflict_is_fatal() {
        let api = mock(true);
        let (bot, shutdown) = serve(api.clone()).await;

        let out = run_polling(&bot, &context(), CancellationToken::new()).await;
        assert!(matches!(out, Err(Error::PollingConflict)), "{out:?}");
        assert_eq!(api.sent.lock().unwrap().len(), 1);
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let api = mock(false);
        let (bot, shutdown) = serve(api.clone()).await;
        let cancel = CancellationToken::new();

        let ctx = context();
        let poll = run_polling(&bot, &ctx, cancel.clone());
        let stopper = async {
            while api.sent.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        };
        let (out, ()) = tokio::join!(poll, stopper);
        assert!(out.is_ok());
        assert!(api.polls.load(Ordering::SeqCst) >= 2);
        let _ = shutdown.send(());
    }
}
