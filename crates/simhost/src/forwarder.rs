//! Activity forwarder: ships a run's agent actions to an external HTTP sink.
//!
//! - Batches per platform (default 5 activities per POST)
//! - `DO_NOTHING` actions are skipped
//! - Failed batches retried with exponential backoff
//! - `stop()` flushes whatever is buffered, bounded by `stop_timeout`

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::SIMHOST_VERSION;
use crate::action::AgentAction;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub url: String,
    pub batch_size: usize,
    /// Partial batches older than this are sent anyway.
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
    pub stop_timeout: Duration,
}

impl ForwarderConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            batch_size: 5,
            flush_interval: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            retry_status_codes: vec![429, 500, 502, 503, 504],
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwarderStats {
    pub queued: u64,
    pub skipped: u64,
    pub sent_batches: u64,
    pub sent_activities: u64,
    pub failed_batches: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    skipped: AtomicU64,
    sent_batches: AtomicU64,
    sent_activities: AtomicU64,
    failed_batches: AtomicU64,
}

pub struct ActivityForwarder {
    tx: mpsc::UnboundedSender<AgentAction>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl ActivityForwarder {
    /// Spawn the background sender for `run_id`.
    pub fn start(run_id: &str, config: ForwarderConfig) -> Result<Self, ForwardError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(token) = std::env::var("SIMHOST_FORWARD_TOKEN")
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let user_agent = format!("simhost/{SIMHOST_VERSION}");
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let stop_timeout = config.stop_timeout;

        let sender = BatchSender {
            run_id: run_id.to_string(),
            client,
            config,
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(sender.run(rx, cancel.clone()));

        tracing::info!(run_id, "Activity forwarder started");
        Ok(Self {
            tx,
            cancel,
            counters,
            task: Mutex::new(Some(task)),
            stop_timeout,
        })
    }

    pub fn push(&self, action: &AgentAction) {
        if action.is_idle() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.tx.send(action.clone()).is_ok() {
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            sent_batches: self.counters.sent_batches.load(Ordering::Relaxed),
            sent_activities: self.counters.sent_activities.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Flush and stop. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Activity forwarder task failed"),
            Err(_) => {
                tracing::warn!(timeout = ?self.stop_timeout, "Activity forwarder did not flush in time, aborting");
                task.abort();
            }
        }
        let stats = self.stats();
        tracing::info!(?stats, "Activity forwarder stopped");
    }
}

struct BatchSender {
    run_id: String,
    client: reqwest::Client,
    config: ForwarderConfig,
    counters: Arc<Counters>,
}

impl BatchSender {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<AgentAction>, cancel: CancellationToken) {
        let mut buffers: HashMap<String, Vec<AgentAction>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                action = rx.recv() => {
                    let Some(action) = action else { break };
                    let buffer = buffers.entry(action.platform.clone()).or_default();
                    buffer.push(action);
                    if buffer.len() >= self.config.batch_size {
                        let batch = std::mem::take(buffer);
                        let platform = batch[0].platform.clone();
                        self.send_batch(&platform, batch).await;
                    }
                }
                _ = ticker.tick() => {
                    self.flush(&mut buffers).await;
                }
            }
        }

        while let Ok(action) = rx.try_recv() {
            buffers.entry(action.platform.clone()).or_default().push(action);
        }
        self.flush(&mut buffers).await;
    }

    async fn flush(&self, buffers: &mut HashMap<String, Vec<AgentAction>>) {
        for (platform, buffer) in buffers.iter_mut() {
            for chunk in std::mem::take(buffer).chunks(self.config.batch_size.max(1)) {
                self.send_batch(platform, chunk.to_vec()).await;
            }
        }
    }

    async fn send_batch(&self, platform: &str, batch: Vec<AgentAction>) {
        if batch.is_empty() {
            return;
        }
        let text = batch.iter().map(describe).collect::<Vec<_>>().join("\n");
        let payload = serde_json::json!({
            "run_id": self.run_id,
            "platform": platform,
            "count": batch.len(),
            "text": text,
            "activities": batch,
        });

        let mut attempt = 0;
        loop {
            let retryable = match self.client.post(&self.config.url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    self.counters.sent_batches.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .sent_activities
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    tracing::debug!(platform, count = batch.len(), "Forwarded activity batch");
                    return;
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    tracing::warn!(platform, status, attempt, "Activity batch rejected");
                    self.config.retry_status_codes.contains(&status)
                }
                Err(e) => {
                    tracing::warn!(platform, error = %e, attempt, "Activity batch send failed");
                    true
                }
            };

            attempt += 1;
            if !retryable || attempt >= self.config.max_retries {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                tracing::error!(platform, count = batch.len(), attempts = attempt, "Dropping activity batch");
                return;
            }
            let backoff = self.config.backoff_base * (1 << attempt.min(10));
            tokio::time::sleep(backoff).await;
        }
    }
}

/// One-line natural language rendering of an action.
fn describe(action: &AgentAction) -> String {
    let name = if action.agent_name.is_empty() {
        format!("agent {}", action.agent_id)
    } else {
        action.agent_name.clone()
    };
    let content = action
        .action_args
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty());

    match (action.action_type.to_ascii_uppercase().as_str(), content) {
        ("CREATE_POST", Some(content)) => format!("{name} posted: \"{content}\""),
        ("CREATE_COMMENT", Some(content)) => format!("{name} commented: \"{content}\""),
        ("QUOTE_POST", Some(content)) => format!("{name} quoted a post: \"{content}\""),
        ("LIKE_POST", _) => format!("{name} liked a post"),
        ("DISLIKE_POST", _) => format!("{name} disliked a post"),
        ("REPOST", _) => format!("{name} reposted a post"),
        ("FOLLOW", _) => format!("{name} followed a user"),
        ("SEARCH_POSTS", _) => format!("{name} searched posts"),
        (other, _) => format!("{name} performed {}", other.to_ascii_lowercase()),
    }
}
