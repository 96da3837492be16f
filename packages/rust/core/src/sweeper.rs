//! Periodic recovery of erred and stuck items.
//!
//! Two independent sweeps per pass:
//! - **retry**: `error(stage)` items whose backoff has elapsed go back to the
//!   stage's pending state (eligible again, not re-claimed).
//! - **stuck**: in-progress items held longer than the stage's task budget
//!   go back to pending with one more attempt counted, or to `dead` if that
//!   was the last one.
//!
//! Every move is a conditional write on the status and revision the sweeper
//! read, so any number of sweepers can run alongside each other and alongside
//! workers. A worker finishing just as its item is reclaimed loses the race
//! and its commit is discarded.

use std::sync::Arc;

use linkflow_shared::{FailureKind, Outcome, Result, Stage, Status};
use linkflow_storage::ItemUpdate;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::clock;
use crate::engine::{Engine, Step};
use crate::retry::{self, FailedAttempt, RetryDecision};

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Erred items made eligible again.
    pub retried: u32,
    /// Stuck items returned to pending.
    pub reclaimed: u32,
    /// Stuck items that ran out of attempts.
    pub dead_lettered: u32,
    /// Items someone else moved between our read and our write.
    pub lost: u32,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.retried + self.reclaimed + self.dead_lettered == 0
    }
}

pub struct Sweeper {
    engine: Arc<Engine>,
}

impl Sweeper {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run both sweeps once over every stage.
    #[instrument(skip_all)]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for stage in Stage::ALL {
            self.sweep_retries(stage, &mut report).await?;
            self.sweep_stuck(stage, &mut report).await?;
        }
        if !report.is_empty() {
            info!(
                retried = report.retried,
                reclaimed = report.reclaimed,
                dead_lettered = report.dead_lettered,
                lost = report.lost,
                "sweep pass"
            );
        }
        Ok(report)
    }

    async fn sweep_retries(&self, stage: Stage, report: &mut SweepReport) -> Result<()> {
        let now = self.engine.now();
        let batch = self.engine.config().sweep_batch;
        let due = self
            .engine
            .storage()
            .list_eligible(Status::Error(stage), now, None, batch)
            .await?;

        for item in due {
            let mut update = ItemUpdate::from(&item);
            update.status = stage.pending();
            update.next_eligible_at = now;
            let step = Step::new(stage.pending(), Outcome::Retried, Some(stage))
                .detail(format!("attempt {} due", item.attempt_count + 1));

            match self.engine.apply_steps(&item, &[step], update, None, now).await? {
                Some(_) => report.retried += 1,
                None => report.lost += 1,
            }
        }
        Ok(())
    }

    async fn sweep_stuck(&self, stage: Stage, report: &mut SweepReport) -> Result<()> {
        let now = self.engine.now();
        let config = self.engine.config();
        let policy = config.stage(stage);
        let cutoff = clock::before(now, policy.task_budget);
        let stuck = self
            .engine
            .storage()
            .list_in_state_since(stage.in_progress(), cutoff, config.sweep_batch)
            .await?;

        for item in stuck {
            let attempt = FailedAttempt {
                kind: FailureKind::Timeout,
                dead_letter: false,
                attempt_count: item.attempt_count.saturating_add(1),
                total_attempts: item.total_attempts.saturating_add(1),
            };
            let held = (now - item.status_changed_at).num_seconds();
            let reason = format!(
                "{}: held in {} for {held}s, budget {}s",
                FailureKind::Timeout,
                item.status,
                policy.task_budget.as_secs()
            );

            let applied = match retry::decide(policy, config.pipeline_max_attempts, attempt, now) {
                RetryDecision::Retry { .. } => {
                    let mut update = ItemUpdate::from(&item);
                    update.status = stage.pending();
                    update.attempt_count = attempt.attempt_count;
                    update.total_attempts = attempt.total_attempts;
                    update.next_eligible_at = now;
                    update.last_error = Some(reason.clone());
                    update.failed_stage = Some(stage);
                    let step =
                        Step::new(stage.pending(), Outcome::Reclaimed, Some(stage)).detail(reason);

                    let result = self.engine.apply_steps(&item, &[step], update, None, now).await?;
                    if result.is_some() {
                        report.reclaimed += 1;
                        debug!(item_id = %item.id, stage = %stage, held, "reclaimed stuck item");
                    }
                    result.is_some()
                }
                RetryDecision::DeadLetter(why) => {
                    let result = self
                        .engine
                        .dead_letter(&item, stage, attempt, reason, why, now)
                        .await?;
                    if result.is_some() {
                        report.dead_lettered += 1;
                    }
                    result.is_some()
                }
            };
            if !applied {
                report.lost += 1;
            }
        }
        Ok(())
    }

    /// Sweep every `sweep_interval` until `shutdown` is cancelled. A failed
    /// pass is logged and the next one runs on schedule.
    pub async fn run(&self, shutdown: CancellationToken) {
        let period = self.engine.config().sweep_interval;
        info!(interval_secs = period.as_secs(), "sweeper starting");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "sweep pass failed");
                    }
                }
            }
        }
        info!("sweeper stopped");
    }
}
