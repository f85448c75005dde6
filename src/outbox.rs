//! Outbox worker. Rows are written by lifecycle commands inside their own
//! transactions; this side delivers them after commit, one at a time, with
//! capped exponential backoff on failure.
use crate::clock::Clock;
use crate::contract::{DocumentHandOff, DocumentService};
use crate::db::{self, OutboxTask, Pool};
use crate::model::OutboxKind;
use crate::notify::{Notification, NotificationSink};
use anyhow::{anyhow, Result};
use futures::future::join_all;
use tracing::{info, instrument, warn};

/// Retry limits for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_backoff_secs: i64,
    /// Tasks that failed this many times are dropped; 0 retries forever.
    pub max_attempts: i64,
}

/// Where outbox tasks go.
pub struct Dispatch<'a> {
    pub notifications: &'a dyn NotificationSink,
    pub documents: &'a dyn DocumentService,
    pub clock: &'a dyn Clock,
}

async fn dispatch(task: &OutboxTask, to: &Dispatch<'_>) -> Result<()> {
    match OutboxKind::parse_kind(&task.kind) {
        Some(OutboxKind::Notify) => {
            let n: Notification = serde_json::from_str(&task.payload)?;
            to.notifications.deliver(&n).await
        }
        Some(OutboxKind::Contract) => {
            let h: DocumentHandOff = serde_json::from_str(&task.payload)?;
            to.documents
                .application_finalized(h.application_id, h.status)
                .await
        }
        None => Err(anyhow!("unknown outbox kind {}", task.kind)),
    }
}

/// Deliver the next due task. Returns whether a task was picked up.
#[instrument(skip_all)]
pub async fn process_next_task(pool: &Pool, to: &Dispatch<'_>, retry: RetryPolicy) -> Result<bool> {
    let Some(task) = db::next_due_outbox(pool, to.clock.now()).await? else {
        return Ok(false);
    };
    let OutboxTask {
        id,
        ref kind,
        application_id,
        attempt,
        ..
    } = task;
    match dispatch(&task, to).await {
        Ok(()) => {
            db::delete_outbox(pool, id).await?;
            info!(id, kind = %kind, application_id, "outbox task delivered");
        }
        Err(err) if retry.max_attempts > 0 && attempt + 1 >= retry.max_attempts => {
            warn!(?err, id, kind = %kind, application_id, attempt, "outbox task dropped after max attempts");
            db::delete_outbox(pool, id).await?;
        }
        Err(err) => {
            warn!(?err, id, kind = %kind, application_id, attempt, "outbox task failed; backoff");
            db::backoff_outbox_with_cap(pool, id, attempt, retry.max_backoff_secs, to.clock.now())
                .await?;
        }
    }
    Ok(true)
}

/// Deliver one notification to several sinks at once, e.g. the live hub
/// and an audit log. Succeeds only if every sink accepted it.
pub struct FanOut {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanOut {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait::async_trait]
impl NotificationSink for FanOut {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let results = join_all(self.sinks.iter().map(|s| s.deliver(notification))).await;
        results.into_iter().collect()
    }
}

/// Sink that writes each notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait::async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, n: &Notification) -> Result<()> {
        info!(
            application_id = n.application_id,
            recipient = ?n.recipient(),
            status = ?n.new_status,
            "{}",
            n.message
        );
        Ok(())
    }
}
