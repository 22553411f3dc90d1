//! Control-bot message handling: access check, command dispatch, login
//! input, and the operator-facing wording of every outcome.

use std::{fmt::Write as _, sync::Arc};

use {
    parrot_accounts::{
        AutoresponderService, Error as AccountsError,
        login::{LoginStage, LoginStep},
        service::AccountSummary,
        types::{OwnerId, TargetConfig},
    },
    teloxide::{
        prelude::*,
        types::{MediaKind, MessageKind},
    },
    tracing::{debug, info, warn},
};

use crate::{
    access::check_access,
    commands::{self, Command, HELP_TEXT, ParseError},
    error::Result,
    outbound,
};

/// Everything a control-bot message handler needs.
pub struct ControlContext {
    pub service: Arc<AutoresponderService>,
    pub whitelist: Vec<i64>,
    /// Without the `@`; used to ignore commands addressed to other bots.
    pub bot_username: Option<String>,
}

/// Handle one inbound control-bot message.
pub async fn handle_message(msg: Message, bot: &Bot, ctx: &ControlContext) -> Result<()> {
    let Some(text) = extract_text(&msg) else {
        debug!(chat_id = msg.chat.id.0, "ignoring non-text control message");
        return Ok(());
    };

    let sender = msg
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok());
    let owner = match check_access(&ctx.whitelist, msg.chat.is_private(), sender) {
        Ok(owner) => owner,
        Err(reason) => {
            debug!(chat_id = msg.chat.id.0, sender_id = ?sender, %reason, "control message denied");
            return Ok(());
        },
    };

    if let Some(reply) = respond(ctx, owner, msg.id.0, &text).await {
        outbound::send_text(bot, msg.chat.id, &reply).await?;
    }
    Ok(())
}

/// Compute the reply for one whitelisted operator message. `None` means
/// stay silent.
pub async fn respond(
    ctx: &ControlContext,
    owner: OwnerId,
    message_id: i32,
    text: &str,
) -> Option<String> {
    match commands::parse(text, ctx.bot_username.as_deref()) {
        Some(Ok(command)) => Some(run_command(&ctx.service, owner, command).await),
        // A cloud password may well start with a slash.
        Some(Err(ParseError::Unknown(_))) if ctx.service.login_active(owner) => {
            submit_login(&ctx.service, owner, message_id, text).await
        },
        Some(Err(e)) => Some(e.to_string()),
        None => submit_login(&ctx.service, owner, message_id, text).await,
    }
}

async fn submit_login(
    service: &AutoresponderService,
    owner: OwnerId,
    message_id: i32,
    input: &str,
) -> Option<String> {
    login_reply(service.submit_login(owner, Some(message_id), input).await)
}

fn login_reply(result: parrot_accounts::Result<LoginStep>) -> Option<String> {
    match result {
        Ok(LoginStep::Advanced(stage)) => Some(stage.prompt().to_string()),
        Ok(LoginStep::Retry { stage, problem }) => {
            Some(format!("Not accepted: {problem}.\n{}", stage.prompt()))
        },
        Ok(LoginStep::Ignored) => None,
        Ok(LoginStep::Completed(identity)) => Some(format!(
            "Logged in. Account {} is now your current account.\n\
             Next: /addid <chat_id> <user_id>, then /run.",
            identity.key.account
        )),
        Err(AccountsError::ExpiredChallenge) => {
            Some("The login code expired. Request a new code with /auth.".to_string())
        },
        Err(AccountsError::NoHandshake) => {
            Some("No login in progress. Start one with /auth.".to_string())
        },
        Err(e) => Some(format!("Login failed: {e}. Start again with /auth.")),
    }
}

async fn run_command(service: &AutoresponderService, owner: OwnerId, command: Command) -> String {
    debug!(%owner, ?command, "control command");
    let outcome = match command {
        Command::Help => Ok(HELP_TEXT.to_string()),
        Command::Auth => service.begin_login(owner).map(|account| {
            info!(%owner, %account, "login started");
            format!(
                "Logging in a new account ({account}). Send /cancel to abort.\n{}",
                LoginStage::ApiId.prompt()
            )
        }),
        Command::Cancel => Ok(match service.cancel_login(owner) {
            Some(account) => format!("Login for {account} cancelled."),
            None => "No login in progress.".to_string(),
        }),
        Command::AddId { chat_id, sender_id } => service
            .set_target(owner, chat_id, [sender_id])
            .await
            .map(|target| format!("Target set.\n{}", describe_target(&target))),
        Command::Run => service
            .start(owner)
            .await
            .map(|account| format!("Autoresponder running for {account}.")),
        Command::Stop => service
            .stop(owner)
            .await
            .map(|account| format!("Autoresponder stopped for {account}.")),
        Command::SetDelay { seconds } => service
            .set_delay(owner, seconds)
            .await
            .map(|_| format!("Reply delay set to {seconds}s.")),
        Command::Multi { count } => service
            .set_reply_count(owner, count)
            .await
            .map(|count| format!("Replies per trigger set to {}.", count.get())),
        Command::ListIds => service
            .target(owner)
            .map(|(account, target)| format!("Account {account}\n{}", describe_target(&target))),
        Command::Sessions => Ok(describe_accounts(&service.list_accounts(owner))),
        Command::SetSession { account } => service
            .select_account(owner, &account)
            .map(|account| format!("Current account is now {account}.")),
        Command::DelSession { account } => service
            .delete_account(owner, &account)
            .await
            .map(|account| format!("Account {account} deleted.")),
    };
    outcome.unwrap_or_else(|e| error_reply(owner, &e))
}

fn error_reply(owner: OwnerId, error: &AccountsError) -> String {
    match error {
        AccountsError::NoTargetChat { .. } => {
            "Set a target first: /addid <chat_id> <user_id>".to_string()
        },
        AccountsError::HandshakeInProgress => {
            "A login is already in progress. Finish it or send /cancel.".to_string()
        },
        AccountsError::Persistence { .. } => {
            warn!(%owner, %error, "could not persist operator change");
            format!("Could not save the change: {error}")
        },
        AccountsError::Platform(e) => {
            warn!(%owner, error = %e, "platform error during command");
            format!("Telegram error: {e}")
        },
        other => capitalize(&other.to_string()),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn describe_target(target: &TargetConfig) -> String {
    let chat = target
        .chat_id
        .map_or_else(|| "not set".to_string(), |id| id.to_string());
    let senders = if target.allowed_sender_ids.is_empty() {
        "none".to_string()
    } else {
        target
            .allowed_sender_ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("Chat: {chat}\nSenders: {senders}")
}

fn describe_accounts(accounts: &[AccountSummary]) -> String {
    if accounts.is_empty() {
        return "You have no accounts yet. Log one in with /auth.".to_string();
    }
    let mut out = String::from("Your accounts (★ = current):");
    for a in accounts {
        let marker = if a.is_default { "★" } else { "·" };
        let state = match (a.enabled, a.listening) {
            (true, true) => "running",
            (true, false) => "enabled, not connected",
            (false, _) => "stopped",
        };
        let chat = a
            .chat_id
            .map_or_else(|| "no target".to_string(), |id| format!("chat {id}"));
        let _ = write!(out, "\n{marker} {} ({state}, {chat})", a.account);
    }
    out
}

/// Extract text content from a message.
fn extract_text(msg: &Message) -> Option<String> {
    match &msg.kind {
        MessageKind::Common(common) => match &common.media_kind {
            MediaKind::Text(t) => Some(t.text.clone()),
            _ => None,
        },
        _ => None,
    }
}
