use crate::db;
use crate::import::SyncService;
use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

/// Counts of what one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub resumed: usize,
    /// Pairs whose head work item is still backing off.
    pub waiting: usize,
    pub failed: usize,
}

enum PairOutcome {
    Started,
    Resumed,
    Waiting,
    Failed,
}

/// One scheduler tick: every enabled pair either resumes its oldest work
/// item or, with none queued, starts a fresh run. Failures, including queue
/// errors, stay with their pair and are logged, never returned.
#[instrument(skip_all)]
pub async fn drain(service: &SyncService, max_backoff_secs: i64) -> Result<TickReport> {
    let mut report = TickReport::default();
    for sub in service.config().enabled_subscriptions() {
        let outcome = drain_pair(service, &sub.remote, &sub.channel, max_backoff_secs)
            .await
            .unwrap_or_else(|err| {
                error!(?err, remote = %sub.remote, channel = %sub.channel, "work queue error");
                PairOutcome::Failed
            });
        match outcome {
            PairOutcome::Started => report.started += 1,
            PairOutcome::Resumed => report.resumed += 1,
            PairOutcome::Waiting => report.waiting += 1,
            PairOutcome::Failed => report.failed += 1,
        }
    }
    Ok(report)
}

async fn drain_pair(
    service: &SyncService,
    remote: &str,
    channel: &str,
    max_backoff_secs: i64,
) -> Result<PairOutcome> {
    let pool = service.pool();
    match db::head_pending_sync(pool, remote, channel).await? {
        Some((item, true)) => match service.run_work_item(&item).await {
            Ok(run) => {
                info!(id = item.id, remote, channel, pages = run.pages, "work item drained");
                Ok(PairOutcome::Resumed)
            }
            Err(err) => {
                warn!(
                    ?err,
                    id = item.id,
                    remote,
                    channel,
                    cursor = item.url.as_deref().unwrap_or("<root>"),
                    attempt = item.attempt,
                    "work item failed; backoff"
                );
                db::backoff_pending_sync_with_cap(pool, item.id, item.attempt, max_backoff_secs)
                    .await?;
                Ok(PairOutcome::Failed)
            }
        },
        Some((item, false)) => {
            debug!(id = item.id, remote, channel, "work item not due");
            Ok(PairOutcome::Waiting)
        }
        None => match service.sync(remote, channel, None).await {
            Ok(_) => Ok(PairOutcome::Started),
            Err(err) => {
                error!(?err, remote, channel, cursor = "<root>", "sync run failed");
                Ok(PairOutcome::Failed)
            }
        },
    }
}

/// Queue a run for a pair; `url = None` restarts at the channel root.
#[instrument(skip(pool))]
pub async fn enqueue(
    pool: &db::Pool,
    remote_id: &str,
    channel_id: &str,
    url: Option<&str>,
) -> Result<i64> {
    let id = db::enqueue_pending_sync(pool, remote_id, channel_id, url).await?;
    info!(id, "work item queued");
    Ok(id)
}
