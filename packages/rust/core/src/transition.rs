//! The pipeline state graph.
//!
//! Every status change the engine makes is checked against [`is_legal`]
//! before it is written. The graph:
//!
//! ```text
//! new -> classified -> queued
//! <stage pending>     -> <stage in progress>        claim
//! <stage in progress> -> <stage completed>          commit
//! <stage in progress> -> error(stage)               fail
//! <stage in progress> -> <stage pending>            stuck reclaim
//! error(stage)        -> <stage pending>            retry after backoff
//! error(stage)        -> dead                       attempts exhausted
//! dead                -> <stage pending>            operator revival
//! ```
//!
//! A stage's completed state is the next stage's pending state
//! (`acquired`, `normalized`), so the chain needs no extra "advance" edge.

use linkflow_shared::{LinkflowError, Result, Stage, Status};

/// Whether `from -> to` is an edge of the state graph.
pub fn is_legal(from: Status, to: Status) -> bool {
    match (from, to) {
        (Status::New, Status::Classified) | (Status::Classified, Status::Queued) => true,
        (Status::Error(_), Status::Dead) => true,
        (Status::Error(stage), to) => to == stage.pending(),
        (Status::Dead, to) => to.pending_stage().is_some(),
        (from, to) => Stage::ALL.into_iter().any(|stage| {
            let claim = from == stage.pending() && to == stage.in_progress();
            let settle = from == stage.in_progress()
                && (to == stage.completed() || to == Status::Error(stage) || to == stage.pending());
            claim || settle
        }),
    }
}

/// Reject any change that is not an edge of the graph.
pub fn validate(from: Status, to: Status) -> Result<()> {
    if is_legal(from, to) {
        Ok(())
    } else {
        Err(LinkflowError::illegal_transition(from, to))
    }
}

/// Every status reachable from `from` in one step.
pub fn successors(from: Status) -> Vec<Status> {
    Status::all()
        .into_iter()
        .filter(|&to| is_legal(from, to))
        .collect()
}
