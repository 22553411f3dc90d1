//! Per-account reply worker.
//!
//! Jobs are drained strictly in arrival order, one at a time. Every pause
//! (reply delay, inter-copy jitter, rate-limit wait) races the session's
//! cancellation token so teardown never waits out a sleep.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    parrot_config::SenderConfig,
    rand::{Rng, seq::IndexedRandom},
    tokio::sync::{Mutex, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    error::{Error, Result},
    platform::{PlatformClient, PlatformError},
    types::{AccountKey, ReplyCount},
};

/// A unit of reply work, fully resolved when it was accepted.
#[derive(Debug, Clone)]
pub struct ReplyJob {
    pub chat_id: i64,
    /// Template pool captured at trigger time.
    pub templates: Arc<[String]>,
    pub copies: ReplyCount,
    pub delay: Duration,
}

/// Timing knobs for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    jitter_min_ms: u64,
    jitter_max_ms: u64,
    rate_limit_ceiling: Duration,
    max_rate_limit_retries: u32,
}

impl Pacing {
    #[must_use]
    pub fn rate_limit_ceiling(&self) -> Duration {
        self.rate_limit_ceiling
    }

    /// Random gap between two copies of the same job.
    fn jitter(&self) -> Duration {
        let ms = if self.jitter_min_ms >= self.jitter_max_ms {
            self.jitter_min_ms
        } else {
            rand::rng().random_range(self.jitter_min_ms..=self.jitter_max_ms)
        };
        Duration::from_millis(ms)
    }
}

impl From<&SenderConfig> for Pacing {
    fn from(cfg: &SenderConfig) -> Self {
        Self {
            jitter_min_ms: cfg.jitter_min_ms.min(cfg.jitter_max_ms),
            jitter_max_ms: cfg.jitter_max_ms.max(cfg.jitter_min_ms),
            rate_limit_ceiling: Duration::from_secs(cfg.rate_limit_ceiling_secs),
            max_rate_limit_retries: cfg.max_rate_limit_retries,
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::from(&SenderConfig::default())
    }
}

/// Producer half of an account's FIFO. Cloned into listeners.
#[derive(Clone)]
pub struct JobQueue {
    key: AccountKey,
    tx: mpsc::UnboundedSender<ReplyJob>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl JobQueue {
    pub(crate) fn new(key: AccountKey) -> (Self, mpsc::UnboundedReceiver<ReplyJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            key,
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (queue, rx)
    }

    pub fn key(&self) -> AccountKey {
        self.key
    }

    pub fn push(&self, job: ReplyJob) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed { key: self.key });
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Error::SessionClosed { key: self.key }
        })
    }

    /// Jobs accepted but not yet finished (queued or in progress).
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn finish_one(&self) {
        // Saturating: a job dropped during shutdown may never be counted down.
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// What happened to one job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: u8,
    pub dropped: u8,
}

struct Cancelled;

async fn pause(cancel: &CancellationToken, duration: Duration) -> std::result::Result<(), Cancelled> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Drain the queue until cancelled. The receiver sits behind a mutex so a
/// replacement worker can pick it up if this one dies.
pub(crate) async fn run_sender(
    queue: JobQueue,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<ReplyJob>>>,
    client: Arc<dyn PlatformClient>,
    pacing: Pacing,
    cancel: CancellationToken,
) {
    let key = queue.key();
    let mut rx = rx.lock().await;
    debug!(%key, "reply sender started");

    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let outcome = deliver(&key, client.as_ref(), &job, &pacing, &cancel).await;
        queue.finish_one();
        match outcome {
            Ok(report) => {
                info!(%key, chat_id = job.chat_id, sent = report.sent, dropped = report.dropped, "reply job finished");
            },
            Err(Cancelled) => break,
        }
    }

    debug!(%key, "reply sender stopped");
}

async fn deliver(
    key: &AccountKey,
    client: &dyn PlatformClient,
    job: &ReplyJob,
    pacing: &Pacing,
    cancel: &CancellationToken,
) -> std::result::Result<DeliveryReport, Cancelled> {
    pause(cancel, job.delay).await?;

    let copies = job.copies.get().min(ReplyCount::MAX);
    let mut report = DeliveryReport::default();

    for copy in 1..=copies {
        // The rng handle is not Send; keep it out of any await.
        let Some(text) = job.templates.choose(&mut rand::rng()).cloned() else {
            warn!(%key, "reply job has an empty template pool");
            break;
        };

        let mut rate_limited = 0u32;
        loop {
            match client.send_message(job.chat_id, &text).await {
                Ok(()) => {
                    report.sent += 1;
                    debug!(%key, chat_id = job.chat_id, copy, "reply sent");
                    break;
                },
                Err(PlatformError::RateLimited { wait }) => {
                    if rate_limited >= pacing.max_rate_limit_retries {
                        warn!(%key, chat_id = job.chat_id, copy, retries = rate_limited, "still rate limited, dropping copy");
                        report.dropped += 1;
                        break;
                    }
                    rate_limited += 1;
                    let wait = wait.min(pacing.rate_limit_ceiling);
                    warn!(%key, chat_id = job.chat_id, wait_secs = wait.as_secs(), "rate limited, pausing sender");
                    pause(cancel, wait).await?;
                },
                Err(PlatformError::SendForbidden { reason }) => {
                    warn!(%key, chat_id = job.chat_id, %reason, "not allowed to post in target chat");
                    report.dropped += 1;
                    break;
                },
                Err(e) => {
                    error!(%key, chat_id = job.chat_id, error = %e, "failed to send reply");
                    report.dropped += 1;
                    break;
                },
            }
        }

        if copy < copies {
            pause(cancel, pacing.jitter()).await?;
        }
    }

    Ok(report)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            test_support::{FakeClient, SendScript},
            types::{AccountId, OwnerId},
        },
        tokio::time::Instant,
    };

    fn key() -> AccountKey {
        AccountKey::new(OwnerId(1), AccountId::generate())
    }

    fn job(templates: &[&str], copies: i64, delay_secs: u64) -> ReplyJob {
        ReplyJob {
            chat_id: -100123456,
            templates: templates.iter().map(|t| (*t).to_string()).collect(),
            copies: ReplyCount::new(copies).unwrap(),
            delay: Duration::from_secs(delay_secs),
        }
    }

    fn spawn_worker(
        client: Arc<FakeClient>,
        pacing: Pacing,
    ) -> (JobQueue, CancellationToken, tokio::task::JoinHandle<()>) {
        let (queue, rx) = JobQueue::new(key());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sender(
            queue.clone(),
            Arc::new(Mutex::new(rx)),
            client,
            pacing,
            cancel.clone(),
        ));
        (queue, cancel, task)
    }

    async fn wait_idle(queue: &JobQueue) {
        while queue.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_in_arrival_order() {
        let client = FakeClient::new();
        let (queue, cancel, task) = spawn_worker(client.clone(), Pacing::default());

        queue.push(job(&["first"], 2, 1)).unwrap();
        queue.push(job(&["second"], 1, 0)).unwrap();
        queue.push(job(&["third"], 3, 0)).unwrap();
        wait_idle(&queue).await;

        let texts: Vec<_> = client.sent().into_iter().map(|m| m.text).collect();
        assert_eq!(
            texts,
            vec!["first", "first", "second", "third", "third", "third"]
        );
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delay_then_jittered_copies() {
        let client = FakeClient::new();
        let (queue, cancel, task) = spawn_worker(client.clone(), Pacing::default());
        let pool = ["hi", "hello", "hey"];

        let accepted = Instant::now();
        queue.push(job(&pool, 3, 2)).unwrap();
        wait_idle(&queue).await;

        let sent = client.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|m| pool.contains(&m.text.as_str())));
        assert!(sent[0].at - accepted >= Duration::from_secs(2));
        for pair in sent.windows(2) {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= Duration::from_millis(700), "gap too short: {gap:?}");
            assert!(gap <= Duration::from_millis(1200), "gap too long: {gap:?}");
        }
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_pauses_and_retries_same_copy() {
        let client = FakeClient::new();
        client.script_send(SendScript::RateLimited(Duration::from_secs(5)));
        let (queue, cancel, task) = spawn_worker(client.clone(), Pacing::default());

        queue.push(job(&["only"], 2, 0)).unwrap();
        wait_idle(&queue).await;

        let attempts = client.attempts();
        assert_eq!(attempts.len(), 3);
        assert!(!attempts[0].delivered);
        assert!(attempts[1].delivered);
        assert!(attempts[1].at - attempts[0].at >= Duration::from_secs(5));
        assert_eq!(client.sent().len(), 2);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_wait_is_capped_by_ceiling() {
        let client = FakeClient::new();
        client.script_send(SendScript::RateLimited(Duration::from_secs(3600)));
        let pacing = Pacing::from(&SenderConfig {
            rate_limit_ceiling_secs: 10,
            ..SenderConfig::default()
        });
        let (queue, cancel, task) = spawn_worker(client.clone(), pacing);

        queue.push(job(&["x"], 1, 0)).unwrap();
        wait_idle(&queue).await;

        let attempts = client.attempts();
        assert_eq!(attempts.len(), 2);
        let waited = attempts[1].at - attempts[0].at;
        assert!(waited >= Duration::from_secs(10));
        assert!(waited < Duration::from_secs(11));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limit_drops_the_copy() {
        let client = FakeClient::new();
        for _ in 0..10 {
            client.script_send(SendScript::RateLimited(Duration::from_secs(1)));
        }
        let pacing = Pacing::from(&SenderConfig {
            max_rate_limit_retries: 2,
            ..SenderConfig::default()
        });
        let (queue, cancel, task) = spawn_worker(client.clone(), pacing);

        queue.push(job(&["x"], 1, 0)).unwrap();
        wait_idle(&queue).await;

        assert_eq!(client.attempts().len(), 3);
        assert!(client.sent().is_empty());
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_copy_is_skipped_and_worker_continues() {
        let client = FakeClient::new();
        client.script_send(SendScript::Forbidden);
        let (queue, cancel, task) = spawn_worker(client.clone(), Pacing::default());

        queue.push(job(&["a"], 2, 0)).unwrap();
        queue.push(job(&["b"], 1, 0)).unwrap();
        wait_idle(&queue).await;

        let texts: Vec<_> = client.sent().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["a", "b"]);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_reply_delay() {
        let client = FakeClient::new();
        let (queue, cancel, task) = spawn_worker(client.clone(), Pacing::default());

        queue.push(job(&["late"], 1, 600)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = Instant::now();
        cancel.cancel();
        task.await.unwrap();

        assert!(Instant::now() - started < Duration::from_secs(1));
        assert!(client.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_rate_limit_pause() {
        let client = FakeClient::new();
        client.script_send(SendScript::RateLimited(Duration::from_secs(300)));
        let (queue, cancel, task) = spawn_worker(client.clone(), Pacing::default());

        queue.push(job(&["x"], 3, 0)).unwrap();
        while client.attempts().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = Instant::now();
        cancel.cancel();
        task.await.unwrap();

        assert!(Instant::now() - started < Duration::from_secs(1));
        let attempts = client.attempts();
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_idle_worker() {
        let client = FakeClient::new();
        let (_queue, cancel, task) = spawn_worker(client.clone(), Pacing::default());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let started = Instant::now();
        cancel.cancel();
        task.await.unwrap();

        assert!(Instant::now() - started < Duration::from_secs(1));
        assert!(client.attempts().is_empty());
    }

    #[test]
    fn push_after_close_is_rejected() {
        let (queue, _rx) = JobQueue::new(key());
        queue.close();
        assert!(matches!(
            queue.push(job(&["x"], 1, 0)),
            Err(Error::SessionClosed { .. })
        ));
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn pacing_normalises_inverted_bounds() {
        let pacing = Pacing::from(&SenderConfig {
            jitter_min_ms: 900,
            jitter_max_ms: 100,
            ..SenderConfig::default()
        });
        for _ in 0..64 {
            let jitter = pacing.jitter();
            assert!(jitter >= Duration::from_millis(100));
            assert!(jitter <= Duration::from_millis(900));
        }
    }
}
