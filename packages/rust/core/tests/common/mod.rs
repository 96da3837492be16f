#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use linkflow_core::{Engine, ManualClock, RecordingObserver};
use linkflow_shared::{PipelineConfig, Stage, StagePolicy};
use linkflow_storage::Storage;
use uuid::Uuid;

pub struct TestPipeline {
    pub engine: Arc<Engine>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingObserver>,
    pub db_path: PathBuf,
}

pub fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("lf_it_{}.db", Uuid::now_v7()))
}

pub async fn pipeline(config: PipelineConfig) -> TestPipeline {
    let db_path = temp_db();
    let storage = Arc::new(Storage::open(&db_path).await.expect("open test db"));
    let clock = Arc::new(ManualClock::default());
    pipeline_on(storage, clock, config, db_path)
}

/// A second engine over an existing store, sharing its clock.
pub fn pipeline_on(
    storage: Arc<Storage>,
    clock: Arc<ManualClock>,
    config: PipelineConfig,
    db_path: PathBuf,
) -> TestPipeline {
    let events = Arc::new(RecordingObserver::new());
    let engine = Engine::new(storage, config)
        .expect("engine")
        .with_clock(clock.clone())
        .with_observer(events.clone());
    TestPipeline {
        engine: Arc::new(engine),
        clock,
        events,
        db_path,
    }
}

/// Default config with one stage's backlog threshold replaced.
pub fn with_threshold(stage: Stage, threshold: Option<u64>) -> PipelineConfig {
    let config = PipelineConfig::default();
    let policy = StagePolicy {
        backlog_threshold: threshold,
        ..config.stage(stage).clone()
    };
    config.with_stage(stage, policy)
}

pub fn job_link(n: usize) -> String {
    format!("https://www.linkedin.com/jobs/view/{n}")
}
