//! Decides whether an inbound message triggers a reply and, if so, turns a
//! settings snapshot into a [`ReplyJob`].

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use {
    async_trait::async_trait,
    tracing::{debug, info, warn},
};

use crate::{
    platform::InboundEvent,
    sender::{JobQueue, ReplyJob},
    session::InboundHandler,
    templates::TemplateSource,
    types::AccountSettings,
};

/// Why an event was not turned into a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Disabled,
    NoTargetChat,
    OtherChat,
    OwnMessage,
    UnknownSender,
    SenderNotAllowed,
    EmptyTemplatePool,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "autoresponder disabled",
            Self::NoTargetChat => "no target chat configured",
            Self::OtherChat => "message is not in the target chat",
            Self::OwnMessage => "message was sent by the account itself",
            Self::UnknownSender => "message has no sender",
            Self::SenderNotAllowed => "sender is not on the allowed list",
            Self::EmptyTemplatePool => "no reply templates available",
        })
    }
}

/// Event-side checks. Cheap; run before templates are loaded.
pub fn admit(event: &InboundEvent, settings: &AccountSettings) -> Result<(), Rejection> {
    if !settings.status.enabled {
        return Err(Rejection::Disabled);
    }
    let Some(target) = settings.target.chat_id else {
        return Err(Rejection::NoTargetChat);
    };
    if event.chat_id != target {
        return Err(Rejection::OtherChat);
    }
    if event.outgoing {
        return Err(Rejection::OwnMessage);
    }
    let Some(sender) = event.sender_id else {
        return Err(Rejection::UnknownSender);
    };
    if !settings.target.allowed_sender_ids.contains(&sender) {
        return Err(Rejection::SenderNotAllowed);
    }
    Ok(())
}

/// Resolve a job from a settings snapshot and a template pool.
pub fn build_job(settings: &AccountSettings, templates: Vec<String>) -> Result<ReplyJob, Rejection> {
    let chat_id = settings.target.chat_id.ok_or(Rejection::NoTargetChat)?;
    if templates.is_empty() {
        return Err(Rejection::EmptyTemplatePool);
    }
    Ok(ReplyJob {
        chat_id,
        templates: templates.into(),
        copies: settings.status.reply_count,
        delay: settings.status.reply_delay(),
    })
}

/// Listener callback wiring the filter to an account's queue. Settings are
/// read live so operator changes apply to the next event.
pub struct AutoresponderHandler {
    settings: Arc<RwLock<AccountSettings>>,
    templates: Arc<dyn TemplateSource>,
}

impl AutoresponderHandler {
    pub fn new(settings: Arc<RwLock<AccountSettings>>, templates: Arc<dyn TemplateSource>) -> Self {
        Self {
            settings,
            templates,
        }
    }
}

#[async_trait]
impl InboundHandler for AutoresponderHandler {
    async fn on_event(&self, queue: &JobQueue, event: InboundEvent) {
        let key = queue.key();
        let snapshot = self
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        if let Err(reason) = admit(&event, &snapshot) {
            debug!(%key, message_id = event.message_id, %reason, "ignoring message");
            return;
        }

        let pool = self.templates.load().await;
        let job = match build_job(&snapshot, pool) {
            Ok(job) => job,
            Err(reason) => {
                warn!(%key, message_id = event.message_id, %reason, "trigger dropped");
                return;
            },
        };

        match queue.push(job) {
            Ok(()) => info!(%key, message_id = event.message_id, pending = queue.pending(), "reply queued"),
            Err(e) => warn!(%key, error = %e, "could not queue reply"),
        }
    }
}
