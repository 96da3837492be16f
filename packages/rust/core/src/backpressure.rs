//! Back-pressure gates.
//!
//! Each stage has a gate in front of its pending state. The gate is closed
//! while the stage's backlog (items waiting in its pending state) is at or
//! above the configured threshold. Closed gates defer work; nothing is
//! dropped. Decisions are re-read from the store on every call.

use std::sync::Arc;

use linkflow_shared::{PipelineConfig, Result, Stage};
use linkflow_storage::Storage;
use serde::Serialize;

/// Point-in-time view of one stage's gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateState {
    pub stage: Stage,
    pub backlog: u64,
    /// `None` disables the gate.
    pub threshold: Option<u64>,
}

impl GateState {
    pub fn is_open(&self) -> bool {
        self.threshold.is_none_or(|t| self.backlog < t)
    }

    /// How many more items may be admitted right now. `None` means unlimited.
    pub fn headroom(&self) -> Option<u64> {
        self.threshold.map(|t| t.saturating_sub(self.backlog))
    }
}

/// Reads backlog depth from the store and answers admission questions.
#[derive(Clone)]
pub struct BackpressureController {
    storage: Arc<Storage>,
    config: Arc<PipelineConfig>,
}

impl BackpressureController {
    pub fn new(storage: Arc<Storage>, config: Arc<PipelineConfig>) -> Self {
        Self { storage, config }
    }

    /// Current gate for `stage`.
    pub async fn gate(&self, stage: Stage) -> Result<GateState> {
        let threshold = self.config.stage(stage).backlog_threshold;
        let backlog = self.storage.count_status(stage.pending()).await?;
        Ok(GateState {
            stage,
            backlog,
            threshold,
        })
    }

    /// Whether items may currently advance into `stage`'s pending state.
    pub async fn admits(&self, stage: Stage) -> Result<bool> {
        Ok(self.gate(stage).await?.is_open())
    }

    /// Whether a worker of `stage` may claim. Finishing the claim would feed
    /// the downstream stage, so this follows the downstream gate.
    pub async fn may_claim(&self, stage: Stage) -> Result<bool> {
        match stage.downstream() {
            Some(next) => self.admits(next).await,
            None => Ok(true),
        }
    }

    /// Gates for every stage, in pipeline order.
    pub async fn gates(&self) -> Result<Vec<GateState>> {
        let mut gates = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            gates.push(self.gate(stage).await?);
        }
        Ok(gates)
    }
}
