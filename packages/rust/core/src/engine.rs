//! The transition engine: ingestion, classification and routing, the
//! claim/commit/fail worker contract, and the operator interface.
//!
//! Every mutation goes through [`Engine::apply_steps`]: the edges are
//! validated against the state graph, written as one conditional update
//! guarded by the observed status and revision, audited in the same
//! transaction, and only then reported to the observer. A write that
//! matches zero rows is a lost race and yields `None`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use linkflow_shared::{
    Classification, ItemRef, LinkflowError, Outcome, PipelineConfig, Provenance, Result, Stage,
    StageOutput, Status, TransitionRecord, UpsertResult, WorkItem,
};
use linkflow_storage::{ConditionalWrite, ItemUpdate, Sighting, Storage};

use crate::backpressure::{BackpressureController, GateState};
use crate::classify::{Classifier, UrlPatternClassifier};
use crate::clock::{self, Clock, SystemClock};
use crate::ingest;
use crate::observe::{TracingObserver, TransitionEvent, TransitionObserver};
use crate::retry::{self, DeadReason, FailedAttempt, RetryDecision};
use crate::transition;
use crate::worker::StageFailure;

/// Candidates fetched per claim round.
const CLAIM_BATCH: u32 = 8;
/// Rounds a claim makes when every candidate in a batch was taken by others.
const CLAIM_ROUNDS: usize = 3;
/// Attempts an operator command makes against concurrent writers.
const OPERATOR_RETRIES: usize = 3;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one classification pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassifyReport {
    pub job: u32,
    pub post: u32,
    pub unknown: u32,
    /// Items another process classified first.
    pub lost: u32,
}

impl ClassifyReport {
    pub fn classified(&self) -> u32 {
        self.job + self.post + self.unknown
    }
}

/// Result of one routing pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteReport {
    pub routed: u32,
    /// Routable items were left behind because the acquisition gate is full.
    pub deferred: bool,
    pub lost: u32,
}

/// Result of [`Engine::advance`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    pub classify: ClassifyReport,
    pub route: RouteReport,
}

/// Per-status counts plus the current gate of every stage.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub counts: Vec<(Status, u64)>,
    pub gates: Vec<GateState>,
}

impl StatusReport {
    pub fn count(&self, status: Status) -> u64 {
        self.counts
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    }
}

/// Everything known about one item.
#[derive(Debug, Clone)]
pub struct ItemDetail {
    pub item: WorkItem,
    pub transitions: Vec<TransitionRecord>,
    pub sightings: Vec<Sighting>,
    pub outputs: Vec<StageOutput>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One edge of a write. A single write may cross two edges
/// (`in progress -> error -> dead`).
#[derive(Debug, Clone)]
pub(crate) struct Step {
    to: Status,
    outcome: Outcome,
    stage: Option<Stage>,
    detail: Option<String>,
}

impl Step {
    pub(crate) fn new(to: Status, outcome: Outcome, stage: Option<Stage>) -> Self {
        Self {
            to,
            outcome,
            stage,
            detail: None,
        }
    }

    pub(crate) fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Acquisition queue name for a classification.
pub fn queue_name(classification: Classification) -> &'static str {
    match classification {
        Classification::Job => "acquisition.job",
        Classification::Post => "acquisition.post",
        Classification::Unknown => "unrouted",
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The pipeline's single entry point for state changes.
pub struct Engine {
    storage: Arc<Storage>,
    config: Arc<PipelineConfig>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn TransitionObserver>,
    classifier: Arc<dyn Classifier>,
    gates: BackpressureController,
}

impl Engine {
    /// Engine on the system clock, logging transitions through `tracing`,
    /// classifying with the configured URL patterns.
    pub fn new(storage: Arc<Storage>, config: PipelineConfig) -> Result<Self> {
        let classifier = UrlPatternClassifier::from_config(&config)?;
        let config = Arc::new(config);
        Ok(Self {
            gates: BackpressureController::new(storage.clone(), config.clone()),
            storage,
            config,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
            classifier: Arc::new(classifier),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gates(&self) -> &BackpressureController {
        &self.gates
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate, write, audit and observe one or more chained edges.
    pub(crate) async fn apply_steps(
        &self,
        item: &WorkItem,
        steps: &[Step],
        update: ItemUpdate,
        output: Option<&StageOutput>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let mut from = item.status;
        let mut records = Vec::with_capacity(steps.len());
        for step in steps {
            transition::validate(from, step.to)?;
            records.push(TransitionRecord {
                item_id: item.id,
                from,
                to: step.to,
                stage: step.stage,
                outcome: step.outcome,
                detail: step.detail.clone(),
                at: now,
            });
            from = step.to;
        }
        if update.status != from {
            return Err(LinkflowError::illegal_transition(from, update.status));
        }

        let write = ConditionalWrite {
            item_id: item.id,
            expected_status: item.status,
            expected_revision: item.revision,
            update,
            output,
            audit: &records,
            at: now,
        };
        let Some(updated) = self.storage.apply(&write).await? else {
            debug!(item_id = %item.id, status = %item.status, "conditional write lost the race");
            return Ok(None);
        };

        let mut since = item.status_changed_at;
        for record in &records {
            self.observer.on_transition(&TransitionEvent {
                item_id: record.item_id,
                from: record.from,
                to: record.to,
                stage: record.stage,
                duration: (now - since).to_std().unwrap_or_default(),
                outcome: record.outcome,
            });
            since = now;
        }
        Ok(Some(updated))
    }

    async fn find(&self, item: &ItemRef) -> Result<WorkItem> {
        let found = match item {
            ItemRef::Id(id) => self.storage.get_item(*id).await?,
            ItemRef::Key(key) => {
                let key = ingest::identity_key(key).unwrap_or_else(|_| key.clone());
                self.storage.get_item_by_key(&key).await?
            }
        };
        found.ok_or_else(|| LinkflowError::not_found(item.to_string()))
    }

    /// Look up an item by id or identity key.
    pub async fn get(&self, item: &ItemRef) -> Result<WorkItem> {
        self.find(item).await
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Idempotently submit a link. Re-submitting merges provenance and never
    /// touches the item's status.
    #[instrument(skip_all, fields(link = %link))]
    pub async fn submit(&self, link: &str, provenance: &Provenance) -> Result<UpsertResult> {
        let key = ingest::identity_key(link)?;
        let result = self
            .storage
            .upsert_item(&key, link.trim(), provenance, self.clock.now())
            .await?;
        if result.inserted {
            info!(item_id = %result.id, identity_key = %key, "new item");
        } else {
            debug!(item_id = %result.id, identity_key = %key, "merged into existing item");
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Classification and routing
    // -----------------------------------------------------------------------

    /// Classify up to `limit` new items.
    #[instrument(skip_all)]
    pub async fn classify_pending(&self, limit: u32) -> Result<ClassifyReport> {
        let mut report = ClassifyReport::default();
        for item in self.storage.list_by_status(Status::New, limit).await? {
            let classification = self
                .classifier
                .classify(&item.link, item.provenance.category.as_deref());

            let mut update = ItemUpdate::from(&item);
            update.status = Status::Classified;
            update.classification = classification;
            let step = Step::new(Status::Classified, Outcome::Classified, None)
                .detail(classification.as_str());

            let now = self.clock.now();
            match self.apply_steps(&item, &[step], update, None, now).await? {
                Some(_) => match classification {
                    Classification::Job => report.job += 1,
                    Classification::Post => report.post += 1,
                    Classification::Unknown => report.unknown += 1,
                },
                None => report.lost += 1,
            }
        }
        if report.classified() > 0 {
            info!(
                job = report.job,
                post = report.post,
                unknown = report.unknown,
                "classified items"
            );
        }
        Ok(report)
    }

    /// Route classified job and post items into the acquisition queue,
    /// admitting no more than the acquisition gate's headroom. Unknown
    /// items stay parked in `classified`.
    #[instrument(skip_all)]
    pub async fn route_pending(&self, limit: u32) -> Result<RouteReport> {
        let mut report = RouteReport::default();
        let gate = self.gates.gate(Stage::Acquisition).await?;
        let budget = match gate.headroom() {
            Some(headroom) => headroom.min(u64::from(limit)) as u32,
            None => limit,
        };

        let now = self.clock.now();
        let mut candidates = Vec::new();
        for classification in [Classification::Job, Classification::Post] {
            candidates.extend(
                self.storage
                    .list_eligible(Status::Classified, now, Some(classification), limit)
                    .await?,
            );
        }
        if candidates.is_empty() {
            return Ok(report);
        }
        if candidates.len() > budget as usize && gate.threshold.is_some() {
            report.deferred = true;
        }
        if budget == 0 {
            info!(
                backlog = gate.backlog,
                threshold = gate.threshold,
                "acquisition gate closed, routing deferred"
            );
            return Ok(report);
        }

        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0)));
        candidates.truncate(budget as usize);

        for item in candidates {
            let mut update = ItemUpdate::from(&item);
            update.status = Status::Queued;
            update.attempt_count = 0;
            update.next_eligible_at = now;
            let step = Step::new(Status::Queued, Outcome::Routed, Some(Stage::Acquisition))
                .detail(format!("queue={}", queue_name(item.classification)));

            match self.apply_steps(&item, &[step], update, None, now).await? {
                Some(_) => report.routed += 1,
                None => report.lost += 1,
            }
        }
        if report.routed > 0 || report.deferred {
            info!(routed = report.routed, deferred = report.deferred, "routed items");
        }
        Ok(report)
    }

    /// One classification pass followed by one routing pass.
    pub async fn advance(&self, limit: u32) -> Result<AdvanceReport> {
        Ok(AdvanceReport {
            classify: self.classify_pending(limit).await?,
            route: self.route_pending(limit).await?,
        })
    }

    // -----------------------------------------------------------------------
    // Worker contract
    // -----------------------------------------------------------------------

    /// Claim one eligible item for `stage`, optionally from one
    /// classification's queue. Returns `None` when nothing is eligible or
    /// when the downstream stage's gate is closed.
    #[instrument(skip_all, fields(stage = %stage))]
    pub async fn claim(
        &self,
        stage: Stage,
        queue: Option<Classification>,
    ) -> Result<Option<WorkItem>> {
        if !self.gates.may_claim(stage).await? {
            debug!("downstream gate closed, not claiming");
            return Ok(None);
        }

        for _ in 0..CLAIM_ROUNDS {
            let now = self.clock.now();
            let candidates = self
                .storage
                .list_eligible(stage.pending(), now, queue, CLAIM_BATCH)
                .await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for item in candidates {
                let mut update = ItemUpdate::from(&item);
                update.status = stage.in_progress();
                let step = Step::new(stage.in_progress(), Outcome::Claimed, Some(stage));
                if let Some(claimed) = self.apply_steps(&item, &[step], update, None, now).await? {
                    debug!(item_id = %claimed.id, attempt = claimed.attempt_count, "claimed");
                    return Ok(Some(claimed));
                }
            }
        }
        Ok(None)
    }

    /// Complete the stage `item` was claimed for and store its output. The
    /// status change and the output land in one transaction.
    ///
    /// Returns `None` if the claim is no longer held (the sweeper reclaimed
    /// it, or someone else moved the item on); the output is then discarded.
    #[instrument(skip_all, fields(item_id = %item.id, status = %item.status))]
    pub async fn commit(
        &self,
        item: &WorkItem,
        payload: serde_json::Value,
    ) -> Result<Option<WorkItem>> {
        let stage = item
            .status
            .in_progress_stage()
            .ok_or_else(|| LinkflowError::illegal_transition(item.status, "committed"))?;
        let now = self.clock.now();

        let mut update = ItemUpdate::from(item);
        update.status = stage.completed();
        update.attempt_count = 0;
        update.next_eligible_at = now;
        let output = StageOutput {
            item_id: item.id,
            stage,
            payload,
            produced_at: now,
        };
        let step = Step::new(stage.completed(), Outcome::Committed, Some(stage));

        let result = self
            .apply_steps(item, &[step], update, Some(&output), now)
            .await?;
        match &result {
            Some(done) => info!(to = %done.status, "stage committed"),
            None => warn!("commit discarded, claim no longer held"),
        }
        Ok(result)
    }

    /// Record a failed attempt. The item moves to `error(stage)` to wait out
    /// its backoff, or on to `dead` when retries are exhausted, the failure
    /// is permanent, or the worker asked for it.
    #[instrument(skip_all, fields(item_id = %item.id, status = %item.status, kind = %failure.kind))]
    pub async fn fail(&self, item: &WorkItem, failure: &StageFailure) -> Result<Option<WorkItem>> {
        let stage = item
            .status
            .in_progress_stage()
            .ok_or_else(|| LinkflowError::illegal_transition(item.status, Status::Dead))?;
        let now = self.clock.now();
        let attempt = FailedAttempt {
            kind: failure.kind,
            dead_letter: failure.dead_letter,
            attempt_count: item.attempt_count.saturating_add(1),
            total_attempts: item.total_attempts.saturating_add(1),
        };
        let reason = format!("{}: {}", failure.kind, failure.reason);

        let result = match retry::decide(
            self.config.stage(stage),
            self.config.pipeline_max_attempts,
            attempt,
            now,
        ) {
            RetryDecision::Retry { next_eligible_at } => {
                let mut update = ItemUpdate::from(item);
                update.status = Status::Error(stage);
                update.attempt_count = attempt.attempt_count;
                update.total_attempts = attempt.total_attempts;
                update.next_eligible_at = next_eligible_at;
                update.last_error = Some(reason.clone());
                update.failed_stage = Some(stage);
                let step =
                    Step::new(Status::Error(stage), Outcome::Failed, Some(stage)).detail(reason);

                let result = self.apply_steps(item, &[step], update, None, now).await?;
                if result.is_some() {
                    info!(
                        attempt = attempt.attempt_count,
                        retry_at = %next_eligible_at,
                        "attempt failed, retry scheduled"
                    );
                }
                result
            }
            RetryDecision::DeadLetter(why) => {
                self.dead_letter(item, stage, attempt, reason, why, now)
                    .await?
            }
        };
        if result.is_none() {
            warn!("failure discarded, claim no longer held");
        }
        Ok(result)
    }

    /// Move an in-progress item through `error(stage)` to `dead` in one write.
    pub(crate) async fn dead_letter(
        &self,
        item: &WorkItem,
        stage: Stage,
        attempt: FailedAttempt,
        reason: String,
        why: DeadReason,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let mut update = ItemUpdate::from(item);
        update.status = Status::Dead;
        update.attempt_count = attempt.attempt_count;
        update.total_attempts = attempt.total_attempts;
        update.next_eligible_at = now;
        update.last_error = Some(reason.clone());
        update.failed_stage = Some(stage);
        let steps = [
            Step::new(Status::Error(stage), Outcome::Failed, Some(stage)).detail(reason),
            Step::new(Status::Dead, Outcome::DeadLettered, Some(stage)).detail(why.to_string()),
        ];

        let result = self.apply_steps(item, &steps, update, None, now).await?;
        if result.is_some() {
            warn!(
                item_id = %item.id,
                stage = %stage,
                attempt = attempt.attempt_count,
                reason = %why,
                "item dead-lettered"
            );
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Operator interface
    // -----------------------------------------------------------------------

    /// Make an item eligible now. The status is left alone; an item waiting
    /// in `error(stage)` is picked up by the next retry sweep. Claimed items
    /// are refused, since the write would void the worker's claim.
    #[instrument(skip_all, fields(item = %item))]
    pub async fn requeue(&self, item: &ItemRef) -> Result<WorkItem> {
        for _ in 0..OPERATOR_RETRIES {
            let current = self.find(item).await?;
            if current.status.is_terminal() {
                return Err(LinkflowError::validation(format!(
                    "item {} is {}; only non-terminal items can be requeued",
                    current.id, current.status
                )));
            }
            if current.status.in_progress_stage().is_some() {
                return Err(LinkflowError::validation(format!(
                    "item {} is {}; wait for the worker or the stuck sweep",
                    current.id, current.status
                )));
            }

            let now = self.clock.now();
            if self
                .storage
                .set_next_eligible(current.id, current.revision, now, now)
                .await?
            {
                info!(item_id = %current.id, status = %current.status, "requeued");
                return self.find(&ItemRef::Id(current.id)).await;
            }
        }
        Err(LinkflowError::conflict(item.to_string()))
    }

    /// Return a dead item to the pending state of the stage that killed it,
    /// with a fresh attempt budget. The previous error is kept and annotated.
    #[instrument(skip_all, fields(item = %item))]
    pub async fn revive(&self, item: &ItemRef, note: Option<&str>) -> Result<WorkItem> {
        for _ in 0..OPERATOR_RETRIES {
            let current = self.find(item).await?;
            let stage = current.failed_stage.unwrap_or(Stage::Acquisition);
            let target = stage.pending();
            if current.status != Status::Dead {
                return Err(LinkflowError::illegal_transition(current.status, target));
            }

            let now = self.clock.now();
            let annotation = match note {
                Some(note) => format!("revived at {} ({note})", now.to_rfc3339()),
                None => format!("revived at {}", now.to_rfc3339()),
            };
            let mut update = ItemUpdate::from(&current);
            update.status = target;
            update.attempt_count = 0;
            update.next_eligible_at = now;
            update.last_error = Some(match &current.last_error {
                Some(previous) => format!("{previous} | {annotation}"),
                None => annotation.clone(),
            });
            let step = Step::new(target, Outcome::Revived, Some(stage)).detail(annotation);

            if let Some(revived) = self.apply_steps(&current, &[step], update, None, now).await? {
                info!(item_id = %revived.id, to = %revived.status, "revived");
                return Ok(revived);
            }
        }
        Err(LinkflowError::conflict(item.to_string()))
    }

    /// Give a parked `unknown` item its real classification so the next
    /// routing pass picks it up. Allowed once, only from `unknown`.
    #[instrument(skip_all, fields(item = %item, classification = %classification))]
    pub async fn reclassify(
        &self,
        item: &ItemRef,
        classification: Classification,
    ) -> Result<WorkItem> {
        if !classification.is_concrete() {
            return Err(LinkflowError::validation(
                "reclassification target must be job or post",
            ));
        }

        for _ in 0..OPERATOR_RETRIES {
            let current = self.find(item).await?;
            if current.status != Status::Classified
                || current.classification != Classification::Unknown
            {
                return Err(LinkflowError::validation(format!(
                    "item {} is {} ({}); only unknown items waiting in classified can be reclassified",
                    current.id, current.status, current.classification
                )));
            }

            let now = self.clock.now();
            let mut update = ItemUpdate::from(&current);
            update.classification = classification;
            let record = TransitionRecord {
                item_id: current.id,
                from: current.status,
                to: current.status,
                stage: None,
                outcome: Outcome::Classified,
                detail: Some(format!("reclassified unknown -> {classification}")),
                at: now,
            };
            let write = ConditionalWrite {
                item_id: current.id,
                expected_status: current.status,
                expected_revision: current.revision,
                update,
                output: None,
                audit: std::slice::from_ref(&record),
                at: now,
            };
            if let Some(updated) = self.storage.apply(&write).await? {
                info!(item_id = %updated.id, "reclassified");
                return Ok(updated);
            }
        }
        Err(LinkflowError::conflict(item.to_string()))
    }

    /// Per-status counts and gate state.
    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            counts: self.storage.count_by_status().await?,
            gates: self.gates.gates().await?,
        })
    }

    /// An item with its audit trail, sightings and live outputs.
    pub async fn inspect(&self, item: &ItemRef) -> Result<ItemDetail> {
        let item = self.find(item).await?;
        let mut outputs = Vec::new();
        for stage in Stage::ALL {
            if let Some(output) = self.storage.get_output(stage, item.id).await? {
                outputs.push(output);
            }
        }
        Ok(ItemDetail {
            transitions: self.storage.list_transitions(item.id).await?,
            sightings: self.storage.list_sightings(item.id).await?,
            outputs,
            item,
        })
    }

    /// Drop `stage` outputs older than `older_than` for items that reached a
    /// terminal state.
    pub async fn prune(&self, stage: Stage, older_than: Duration) -> Result<u64> {
        let cutoff = clock::before(self.clock.now(), older_than);
        let removed = self.storage.prune_outputs(stage, cutoff).await?;
        info!(stage = %stage, removed, "pruned stage outputs");
        Ok(removed)
    }
}
