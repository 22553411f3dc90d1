//! Live connection of one account: the platform client, its reply worker
//! and at most one inbound listener.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    error::{Error, Result},
    platform::{InboundEvent, PlatformClient},
    sender::{JobQueue, Pacing, ReplyJob, run_sender},
    types::AccountKey,
};

/// How long `close` waits for a task to notice cancellation before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Pause after a non-fatal listener error before polling again.
const LISTENER_BACKOFF: Duration = Duration::from_secs(1);

/// Receives every new message seen by an attached listener.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_event(&self, queue: &JobQueue, event: InboundEvent);
}

struct Listener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct AccountSession {
    key: AccountKey,
    client: Arc<dyn PlatformClient>,
    pacing: Pacing,
    queue: JobQueue,
    rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<ReplyJob>>>,
    cancel: CancellationToken,
    sender: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<Listener>>,
    closed: AtomicBool,
}

impl AccountSession {
    pub fn new(key: AccountKey, client: Arc<dyn PlatformClient>, pacing: Pacing) -> Self {
        let (queue, rx) = JobQueue::new(key);
        Self {
            key,
            client,
            pacing,
            queue,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            cancel: CancellationToken::new(),
            sender: Mutex::new(None),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> AccountKey {
        self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Jobs accepted and not yet finished.
    pub fn pending_jobs(&self) -> usize {
        self.queue.pending()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed { key: self.key });
        }
        Ok(())
    }

    /// Connect if needed and make sure exactly one reply worker is running.
    pub async fn open(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.client.is_connected() {
            self.client.connect().await?;
            info!(key = %self.key, "account connected");
        }
        self.ensure_sender();
        Ok(())
    }

    fn ensure_sender(&self) {
        let mut sender = lock(&self.sender);
        if sender.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if sender.is_some() {
            warn!(key = %self.key, "reply sender exited unexpectedly, restarting");
        }
        *sender = Some(tokio::spawn(run_sender(
            self.queue.clone(),
            Arc::clone(&self.rx),
            Arc::clone(&self.client),
            self.pacing,
            self.cancel.clone(),
        )));
    }

    /// Queue a job for the reply worker.
    pub fn enqueue(&self, job: ReplyJob) -> Result<()> {
        self.ensure_open()?;
        self.queue.push(job)
    }

    /// Start routing new messages to `handler`, replacing any previous
    /// listener.
    pub fn attach_listener(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        self.ensure_open()?;
        let mut slot = lock(&self.listener);
        if let Some(previous) = slot.take() {
            previous.cancel.cancel();
        }

        let cancel = self.cancel.child_token();
        let task = tokio::spawn(listen(
            self.queue.clone(),
            Arc::clone(&self.client),
            handler,
            cancel.clone(),
        ));
        *slot = Some(Listener { cancel, task });
        debug!(key = %self.key, "listener attached");
        Ok(())
    }

    /// Stop routing new messages. Already-queued jobs still run.
    pub fn detach_listener(&self) -> bool {
        match lock(&self.listener).take() {
            Some(listener) => {
                listener.cancel.cancel();
                debug!(key = %self.key, "listener detached");
                true
            },
            None => false,
        }
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.listener)
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }

    /// Detach, stop the worker, disconnect. Safe to call more than once;
    /// failures are logged, never returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
        self.cancel.cancel();

        let listener = lock(&self.listener).take().map(|l| l.task);
        let sender = lock(&self.sender).take();
        for task in [listener, sender].into_iter().flatten() {
            let abort = task.abort_handle();
            match tokio::time::timeout(CLOSE_GRACE, task).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) if e.is_cancelled() => {},
                Ok(Err(e)) => warn!(key = %self.key, error = %e, "session task failed"),
                Err(_) => {
                    warn!(key = %self.key, "session task did not stop in time, aborting");
                    abort.abort();
                },
            }
        }

        let dropped = self.queue.pending();
        if dropped > 0 {
            info!(key = %self.key, dropped, "discarding queued replies");
        }
        if let Err(e) = self.client.disconnect().await {
            warn!(key = %self.key, error = %e, "disconnect failed");
        }
        info!(key = %self.key, "session closed");
    }
}

async fn listen(
    queue: JobQueue,
    client: Arc<dyn PlatformClient>,
    handler: Arc<dyn InboundHandler>,
    cancel: CancellationToken,
) {
    let key = queue.key();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = client.next_event() => event,
        };
        match event {
            Ok(event) => handler.on_event(&queue, event).await,
            Err(e) if e.is_fatal() => {
                error!(%key, error = %e, "listener lost its connection");
                break;
            },
            Err(e) => {
                warn!(%key, error = %e, "error while waiting for updates");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(LISTENER_BACKOFF) => {},
                }
            },
        }
    }
    debug!(%key, "listener stopped");
}
