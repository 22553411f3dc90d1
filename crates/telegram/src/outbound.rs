//! Replies from the control bot to operators.

use std::{future::Future, time::Duration};

use {
    teloxide::{RequestError, prelude::*},
    tracing::warn,
};

use crate::error::Result;

const TELEGRAM_RETRY_AFTER_MAX_RETRIES: usize = 4;

/// Telegram's hard limit on message text, in UTF-16 units. Counting chars
/// keeps us under it for everything outside the astral planes.
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

/// Send `text` to `chat_id`, split into as many messages as needed.
pub async fn send_text(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for chunk in chunk_text(text, TELEGRAM_MAX_MESSAGE_LEN) {
        run_with_retry(chat_id.0, "send_message", || {
            bot.send_message(chat_id, chunk.clone()).send()
        })
        .await?;
    }
    Ok(())
}

/// Run a Bot API request, sleeping through `RetryAfter` responses.
pub async fn run_with_retry<T, F, Fut>(
    chat_id: i64,
    operation: &'static str,
    mut request: F,
) -> std::result::Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RequestError>>,
{
    let mut retries = 0usize;

    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(wait) = retry_after_duration(&err) else {
                    return Err(err);
                };

                if retries >= TELEGRAM_RETRY_AFTER_MAX_RETRIES {
                    warn!(
                        chat_id,
                        operation,
                        retries,
                        retry_after_secs = wait.as_secs(),
                        "telegram rate limit persisted after retries"
                    );
                    return Err(err);
                }

                retries += 1;
                warn!(
                    chat_id,
                    operation,
                    retries,
                    max_retries = TELEGRAM_RETRY_AFTER_MAX_RETRIES,
                    retry_after_secs = wait.as_secs(),
                    "telegram rate limited, waiting before retry"
                );
                tokio::time::sleep(wait).await;
            },
        }
    }
}

fn retry_after_duration(error: &RequestError) -> Option<Duration> {
    match error {
        RequestError::RetryAfter(wait) => Some(wait.duration()),
        _ => None,
    }
}

/// Split on line boundaries where possible; a single over-long line is cut
/// at the char limit.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let needed = if current.is_empty() {
            line_len
        } else {
            line_len + 1
        };
        if current_len + needed <= max_chars {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            current_len += needed;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        let mut rest = line;
        while rest.chars().count() > max_chars {
            let split = rest
                .char_indices()
                .nth(max_chars)
                .map_or(rest.len(), |(i, _)| i);
            chunks.push(rest[..split].to_string());
            rest = &rest[split..];
        }
        current.push_str(rest);
        current_len = rest.chars().count();
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}
