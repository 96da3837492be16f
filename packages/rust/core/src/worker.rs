//! Stage worker contract and a generic driver for it.
//!
//! Domain logic (fetching, normalizing, extracting) lives outside this crate
//! behind [`StageHandler`]. [`WorkerLoop`] runs one handler against the
//! engine:
//!
//! ```text
//! loop
//!   claim(stage, queue)   -> nothing eligible: sleep, poll again
//!   handler.process(item) -> bounded by the stage's task budget
//!   Ok(payload)           -> commit(item, payload)
//!   Err(failure)          -> fail(item, failure)
//!   budget exceeded       -> fail(item, timeout)
//! ```
//!
//! A worker that dies between claim and commit needs no cleanup: the
//! sweeper reclaims the item once its budget has passed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use linkflow_shared::{Classification, FailureKind, Result, Stage, WorkItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;

/// A worker's report of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: FailureKind,
    /// Human-readable reason, stored on the item.
    pub reason: String,
    /// Skip remaining retries and dead-letter now.
    pub dead_letter: bool,
}

impl StageFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            dead_letter: false,
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, reason)
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, reason)
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, reason)
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, reason)
    }

    /// Request immediate dead-lettering.
    pub fn dead_letter(mut self) -> Self {
        self.dead_letter = true;
        self
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Stage-specific processing supplied by the embedding application.
pub trait StageHandler: Send + Sync {
    /// The stage this handler processes.
    fn stage(&self) -> Stage;

    /// Restrict claims to one classification's queue.
    fn queue(&self) -> Option<Classification> {
        None
    }

    /// Process a claimed item and return the stage output payload.
    fn process(
        &self,
        item: &WorkItem,
    ) -> impl Future<Output = std::result::Result<serde_json::Value, StageFailure>> + Send;
}

/// What one iteration of a worker did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Committed,
    Failed,
    /// The claim was lost before the result could be recorded.
    Discarded,
}

/// Running totals for a [`WorkerLoop`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub committed: u64,
    pub failed: u64,
    pub discarded: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: WorkOutcome) {
        match outcome {
            WorkOutcome::Committed => self.committed += 1,
            WorkOutcome::Failed => self.failed += 1,
            WorkOutcome::Discarded => self.discarded += 1,
        }
    }
}

/// Drives a [`StageHandler`] through claim, process, commit or fail.
pub struct WorkerLoop<H> {
    engine: Arc<Engine>,
    handler: H,
    poll_interval: Duration,
}

impl<H: StageHandler> WorkerLoop<H> {
    pub fn new(engine: Arc<Engine>, handler: H) -> Self {
        Self {
            engine,
            handler,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// How long to sleep when nothing is claimable.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and process at most one item. `None` means nothing was claimable.
    pub async fn run_once(&self) -> Result<Option<WorkOutcome>> {
        let stage = self.handler.stage();
        let Some(item) = self.engine.claim(stage, self.handler.queue()).await? else {
            return Ok(None);
        };

        let budget = self.engine.config().stage(stage).task_budget;
        let result = match tokio::time::timeout(budget, self.handler.process(&item)).await {
            Ok(Ok(payload)) => self.engine.commit(&item, payload).await?.map(|_| WorkOutcome::Committed),
            Ok(Err(failure)) => self.engine.fail(&item, &failure).await?.map(|_| WorkOutcome::Failed),
            Err(_) => {
                let failure = StageFailure::timeout(format!(
                    "no result within {}s task budget",
                    budget.as_secs()
                ));
                self.engine.fail(&item, &failure).await?.map(|_| WorkOutcome::Failed)
            }
        };
        Ok(Some(result.unwrap_or(WorkOutcome::Discarded)))
    }

    /// Process items until `shutdown` is cancelled. Storage errors are
    /// logged and retried after the poll interval.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerStats {
        let stage = self.handler.stage();
        info!(stage = %stage, queue = ?self.handler.queue(), "worker starting");
        let mut stats = WorkerStats::default();

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(outcome)) => {
                    debug!(stage = %stage, ?outcome, "processed item");
                    stats.record(outcome);
                    if outcome == WorkOutcome::Discarded {
                        warn!(stage = %stage, "result discarded, item was reclaimed");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(stage = %stage, error = %e, "worker iteration failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(
            stage = %stage,
            committed = stats.committed,
            failed = stats.failed,
            discarded = stats.discarded,
            "worker stopped"
        );
        stats
    }
}
