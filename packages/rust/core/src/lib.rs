//! Stage-transition engine for the linkflow pipeline.
//!
//! This crate owns every state change a work item goes through: ingestion,
//! classification and routing, the claim/commit/fail worker contract, retry
//! and dead-letter policy, stuck-item recovery, and back-pressure between
//! stages. The item store's conditional update is the only concurrency
//! primitive; nothing here holds a lock across processing.

pub mod backpressure;
pub mod classify;
pub mod clock;
pub mod engine;
pub mod ingest;
pub mod observe;
pub mod retry;
pub mod sweeper;
pub mod transition;
pub mod worker;

pub use backpressure::{BackpressureController, GateState};
pub use classify::{Classifier, UrlPatternClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    AdvanceReport, ClassifyReport, Engine, ItemDetail, RouteReport, StatusReport, queue_name,
};
pub use observe::{
    FanoutObserver, NoopObserver, RecordingObserver, TracingObserver, TransitionEvent,
    TransitionObserver,
};
pub use retry::{DeadReason, RetryDecision, backoff_delay};
pub use sweeper::{SweepReport, Sweeper};
pub use worker::{StageFailure, StageHandler, WorkOutcome, WorkerLoop, WorkerStats};
