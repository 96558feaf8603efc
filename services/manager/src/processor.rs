//! Queue processor: drains the durable command queue in batches.
//!
//! One long-running worker.  Each cycle claims up to 20 rows, walks them
//! against the live session registry, and commits every mutation in one
//! transaction.  A device with recent live-client activity has its rows
//! deferred (reset, not retried) so interactive traffic keeps priority over
//! replay.

use crate::queue::{ClaimedBatch, CommandQueue, MAX_RETRIES, QueueError, QueuedCommand};
use crate::status::{StatusKey, StatusMap};
use crate::upstream::{CommandError, DeviceLink, Row, SessionMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CLAIM_LIMIT: i64 = 20;
pub const IDLE_SLEEP: Duration = Duration::from_secs(2);

/// Replay pauses for a device while a live client was active this recently.
pub const LIVE_CLIENT_IDLE_SECS: i64 = 15;

// ---------------------------------------------------------------------------
// Pure decision logic
// ---------------------------------------------------------------------------

/// Whether queued work must yield to an interactive client.
pub fn yields_to_live_client(idle_secs: i64) -> bool {
    idle_secs < LIVE_CLIENT_IDLE_SECS
}

/// What to do with a claimed row after an execution attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Delete the row; it is done.
    Complete,
    /// Record the failure; delete when `terminal`.
    Fail { error: String, terminal: bool },
}

/// Map an execution result onto the row's fate.
///
/// A trap is terminal regardless of the retry counter: the device refused
/// the command and will keep refusing it.  Transient failures count retries
/// and turn terminal when the counter would reach [`MAX_RETRIES`].
pub fn disposition(result: &Result<Vec<Row>, CommandError>, retry_count: i32) -> Disposition {
    match result {
        Ok(_) => Disposition::Complete,
        Err(e @ CommandError::Trap { .. }) => Disposition::Fail {
            error: e.to_string(),
            terminal: true,
        },
        Err(e) => Disposition::Fail {
            error: e.to_string(),
            terminal: retry_count + 1 >= MAX_RETRIES,
        },
    }
}

// ---------------------------------------------------------------------------
// QueueProcessor
// ---------------------------------------------------------------------------

pub struct QueueProcessor<L: DeviceLink> {
    queue: Arc<CommandQueue>,
    sessions: SessionMap<L>,
    status: StatusMap,
}

impl<L: DeviceLink> QueueProcessor<L> {
    pub fn new(queue: Arc<CommandQueue>, sessions: SessionMap<L>, status: StatusMap) -> Self {
        QueueProcessor {
            queue,
            sessions,
            status,
        }
    }

    /// Run forever: claim, process, commit, sleep when idle.
    pub async fn run(self) {
        info!("queue processor started");
        loop {
            match self.run_cycle().await {
                Ok(0) => tokio::time::sleep(IDLE_SLEEP).await,
                Ok(n) => debug!(processed = n, "queue batch finished"),
                Err(e) => {
                    warn!(error = %e, "queue cycle failed, batch rolled back");
                    self.status
                        .set(StatusKey::Processor, format!("Error: {}", e))
                        .await;
                    tokio::time::sleep(IDLE_SLEEP).await;
                }
            }
        }
    }

    /// One claim-process-commit cycle; returns the number of claimed rows.
    pub async fn run_cycle(&self) -> Result<usize, QueueError> {
        let mut batch = self.queue.claim_batch(CLAIM_LIMIT).await?;
        let rows = batch.rows.clone();
        if rows.is_empty() {
            batch.commit().await?;
            return Ok(0);
        }

        info!(count = rows.len(), "processing queued commands");
        self.status
            .set(
                StatusKey::Processor,
                format!("Processing {} queued commands", rows.len()),
            )
            .await;

        match self.process_rows(&mut batch, &rows).await {
            Ok(()) => {
                batch.commit().await?;
                self.status
                    .set(
                        StatusKey::Processor,
                        format!(
                            "OK, last batch finished {}",
                            chrono::Utc::now().format("%H:%M:%S")
                        ),
                    )
                    .await;
                Ok(rows.len())
            }
            Err(e) => {
                let _ = batch.rollback().await;
                Err(e)
            }
        }
    }

    async fn process_rows(
        &self,
        batch: &mut ClaimedBatch,
        rows: &[QueuedCommand],
    ) -> Result<(), QueueError> {
        for row in rows {
            let link = self.sessions.read().await.get(&row.device_id).cloned();
            let Some(link) = link.filter(|l| l.is_connected()) else {
                debug!(
                    id = row.id,
                    device_id = row.device_id,
                    "device not connected, recording failure"
                );
                batch.fail(row, "Device not connected", false).await?;
                continue;
            };

            if yields_to_live_client(link.live_idle_secs()) {
                debug!(
                    id = row.id,
                    device_id = row.device_id,
                    "live client active, deferring row"
                );
                batch.reset(row.id).await?;
                continue;
            }

            debug!(
                id = row.id,
                device_id = row.device_id,
                attempt = row.retry_count + 1,
                "executing queued command"
            );
            let result = link.run_command(row.words.clone()).await;
            match disposition(&result, row.retry_count) {
                Disposition::Complete => batch.complete(row.id).await?,
                Disposition::Fail { error, terminal } => {
                    warn!(
                        id = row.id,
                        device_id = row.device_id,
                        error = %error,
                        terminal,
                        "queued command failed"
                    );
                    batch.fail(row, &error, terminal).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_guard_boundaries() {
        assert!(yields_to_live_client(0));
        assert!(yields_to_live_client(5));
        assert!(yields_to_live_client(14));
        assert!(!yields_to_live_client(15));
        assert!(!yields_to_live_client(20));
    }

    #[test]
    fn success_completes_regardless_of_retry_count() {
        assert_eq!(disposition(&Ok(vec![]), 0), Disposition::Complete);
        assert_eq!(disposition(&Ok(vec![]), 3), Disposition::Complete);
    }

    #[test]
    fn trap_is_terminal_on_the_first_attempt() {
        let result = Err(CommandError::Trap {
            message: "no such chain".to_owned(),
        });
        assert_eq!(
            disposition(&result, 0),
            Disposition::Fail {
                error: "Trap: no such chain".to_owned(),
                terminal: true,
            }
        );
    }

    #[test]
    fn transient_failures_turn_terminal_at_max_retries() {
        let result: Result<Vec<Row>, _> =
            Err(CommandError::transient("ConnectionError", "refused"));
        for retry in 0..MAX_RETRIES - 1 {
            assert_eq!(
                disposition(&result, retry),
                Disposition::Fail {
                    error: "ConnectionError: refused".to_owned(),
                    terminal: false,
                },
                "retry {}",
                retry
            );
        }
        assert_eq!(
            disposition(&result, MAX_RETRIES - 1),
            Disposition::Fail {
                error: "ConnectionError: refused".to_owned(),
                terminal: true,
            }
        );
    }
}
