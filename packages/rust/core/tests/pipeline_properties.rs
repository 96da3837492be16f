//! End-to-end behavior of the engine against a real store.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{job_link, pipeline, pipeline_on, with_threshold};
use linkflow_core::{Clock, StageFailure, Sweeper};
use linkflow_shared::{
    Classification, ItemRef, Outcome, PipelineConfig, Provenance, Stage, Status,
};

#[tokio::test]
async fn repeated_submission_creates_one_item() {
    let p = pipeline(PipelineConfig::default()).await;
    let link = job_link(1);

    let first = p.engine.submit(&link, &Provenance::default()).await.unwrap();
    assert!(first.inserted);
    for n in 0..5 {
        let provenance = Provenance {
            source: Some("sheet:August".into()),
            locator: Some(format!("row {n}")),
            ..Default::default()
        };
        let again = p.engine.submit(&link.to_uppercase(), &provenance).await.unwrap();
        assert!(!again.inserted);
        assert_eq!(again.id, first.id);
    }

    let status = p.engine.status().await.unwrap();
    assert_eq!(status.count(Status::New), 1);

    let detail = p.engine.inspect(&ItemRef::Id(first.id)).await.unwrap();
    assert_eq!(detail.sightings.len(), 6);
    assert_eq!(detail.item.provenance.locator.as_deref(), Some("row 4"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_for_one_item_have_one_winner() {
    let p = pipeline(PipelineConfig::default()).await;
    p.engine.submit(&job_link(1), &Provenance::default()).await.unwrap();
    p.engine.advance(10).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = p.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.claim(Stage::Acquisition, None).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(p.events.count(Outcome::Claimed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_an_item() {
    let p = pipeline(PipelineConfig::default()).await;
    for n in 0..20 {
        p.engine.submit(&job_link(n), &Provenance::default()).await.unwrap();
    }
    p.engine.advance(50).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let engine = p.engine.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(item) = engine.claim(Stage::Acquisition, None).await.unwrap() {
                mine.push(item.id);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "item {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn abandoned_claim_is_recovered() {
    let p = pipeline(PipelineConfig::default()).await;
    let sweeper = Sweeper::new(p.engine.clone());
    p.engine.submit(&job_link(1), &Provenance::default()).await.unwrap();
    p.engine.advance(10).await.unwrap();

    // Claimed for normalization, then the worker vanishes.
    let raw = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
    p.engine.commit(&raw, serde_json::json!({"raw": 1})).await.unwrap().unwrap();
    let claimed = p.engine.claim(Stage::Normalization, None).await.unwrap().unwrap();
    assert!(p.engine.claim(Stage::Normalization, None).await.unwrap().is_none());

    let budget = p.engine.config().stage(Stage::Normalization).task_budget;
    let interval = p.engine.config().sweep_interval;
    p.clock.advance(budget + interval);
    assert_eq!(sweeper.sweep_once().await.unwrap().reclaimed, 1);

    let again = p.engine.claim(Stage::Normalization, None).await.unwrap().unwrap();
    assert_eq!(again.id, claimed.id);
    assert_eq!(again.attempt_count, 1);
}

#[tokio::test]
async fn max_attempts_failures_end_in_dead() {
    let p = pipeline(PipelineConfig::default()).await;
    let sweeper = Sweeper::new(p.engine.clone());
    p.engine.submit(&job_link(1), &Provenance::default()).await.unwrap();
    p.engine.advance(10).await.unwrap();

    let policy = p.engine.config().stage(Stage::Acquisition).clone();
    let mut last = None;
    for attempt in 1..=policy.max_attempts {
        let item = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
        let failed = p
            .engine
            .fail(&item, &StageFailure::transient(format!("429 #{attempt}")))
            .await
            .unwrap()
            .unwrap();
        if attempt < policy.max_attempts {
            assert_eq!(failed.status, Status::Error(Stage::Acquisition));
        }
        p.clock.advance(policy.max_delay);
        sweeper.sweep_once().await.unwrap();
        last = Some(failed);
    }

    let dead = last.unwrap();
    assert_eq!(dead.status, Status::Dead);
    assert_eq!(dead.attempt_count, policy.max_attempts);
    assert!(p.engine.claim(Stage::Acquisition, None).await.unwrap().is_none());
    assert_eq!(p.events.count(Outcome::DeadLettered), 1);
}

#[tokio::test]
async fn retry_delays_never_shrink() {
    let p = pipeline(PipelineConfig::default()).await;
    let sweeper = Sweeper::new(p.engine.clone());
    p.engine.submit(&job_link(1), &Provenance::default()).await.unwrap();
    p.engine.advance(10).await.unwrap();

    let policy = p.engine.config().stage(Stage::Acquisition).clone();
    let mut delays = Vec::new();
    for attempt in 1..policy.max_attempts {
        let item = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
        let failed_at = p.clock.now();
        let failed = p
            .engine
            .fail(&item, &StageFailure::validation(format!("bad payload {attempt}")))
            .await
            .unwrap()
            .unwrap();
        delays.push((failed.next_eligible_at - failed_at).to_std().unwrap());
        p.clock.advance(policy.max_delay);
        sweeper.sweep_once().await.unwrap();
    }

    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
    assert!(delays.iter().all(|d| *d <= policy.max_delay));
    assert_eq!(delays[0], policy.base_delay);
}

#[tokio::test]
async fn full_backlog_admits_nothing() {
    // An unthrottled engine builds up a backlog of five queued items.
    let loader = pipeline(with_threshold(Stage::Acquisition, None)).await;
    for n in 0..5 {
        loader.engine.submit(&job_link(n), &Provenance::default()).await.unwrap();
    }
    assert_eq!(loader.engine.advance(10).await.unwrap().route.routed, 5);

    // A throttled engine over the same store must not add to it.
    let gated = pipeline_on(
        loader.engine.storage().clone(),
        loader.clock.clone(),
        with_threshold(Stage::Acquisition, Some(3)),
        loader.db_path.clone(),
    );
    for n in 5..10 {
        gated.engine.submit(&job_link(n), &Provenance::default()).await.unwrap();
    }
    let report = gated.engine.advance(10).await.unwrap();
    assert_eq!(report.classify.job, 5);
    assert_eq!(report.route.routed, 0);
    assert!(report.route.deferred);
    assert_eq!(gated.events.count(Outcome::Routed), 0);

    // Drain below the threshold: exactly the headroom is admitted.
    for _ in 0..3 {
        gated.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
    }
    let report = gated.engine.route_pending(10).await.unwrap();
    assert_eq!(report.routed, 1);
    let status = gated.engine.status().await.unwrap();
    assert_eq!(status.count(Status::Queued), 3);
    assert_eq!(status.count(Status::Classified), 4);
}

#[tokio::test]
async fn downstream_backlog_pauses_upstream_claims() {
    let p = pipeline(with_threshold(Stage::Normalization, Some(1))).await;
    for n in 0..3 {
        p.engine.submit(&job_link(n), &Provenance::default()).await.unwrap();
    }
    p.engine.advance(10).await.unwrap();

    let first = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
    p.engine.commit(&first, serde_json::json!({})).await.unwrap().unwrap();

    // One item waits for normalization: the gate is closed.
    assert!(p.engine.claim(Stage::Acquisition, None).await.unwrap().is_none());
    let gate = p.engine.gates().gate(Stage::Normalization).await.unwrap();
    assert!(!gate.is_open());

    p.engine.claim(Stage::Normalization, None).await.unwrap().unwrap();
    assert!(p.engine.claim(Stage::Acquisition, None).await.unwrap().is_some());
}

#[tokio::test]
async fn k1_scenario() {
    let p = pipeline(PipelineConfig::default()).await;
    let sweeper = Sweeper::new(p.engine.clone());
    let k1 = "https://www.linkedin.com/jobs/view/k1";

    let a = p.engine.submit(k1, &Provenance::default()).await.unwrap();
    let b = p.engine.submit(k1, &Provenance::default()).await.unwrap();
    assert_eq!(a.id, b.id);
    assert!(!b.inserted);
    assert_eq!(p.engine.status().await.unwrap().count(Status::New), 1);

    p.engine.advance(10).await.unwrap();
    let item = p
        .engine
        .claim(Stage::Acquisition, Some(Classification::Job))
        .await
        .unwrap()
        .unwrap();
    p.engine
        .commit(&item, serde_json::json!({"raw_ref": "raw/k1"}))
        .await
        .unwrap()
        .unwrap();

    let policy = p.engine.config().stage(Stage::Normalization).clone();
    assert_eq!(policy.max_attempts, 3);
    let mut last = None;
    for attempt in 1..=3 {
        let claimed = p.engine.claim(Stage::Normalization, None).await.unwrap().unwrap();
        last = p
            .engine
            .fail(&claimed, &StageFailure::transient(format!("parser timeout {attempt}")))
            .await
            .unwrap();
        p.clock.advance(policy.max_delay);
        sweeper.sweep_once().await.unwrap();
    }

    let dead = last.unwrap();
    assert_eq!(dead.status, Status::Dead);
    assert_eq!(dead.attempt_count, 3);
    assert_eq!(dead.last_error.as_deref(), Some("transient: parser timeout 3"));

    let revived = p
        .engine
        .revive(&ItemRef::Key(k1.into()), Some("parser fixed"))
        .await
        .unwrap();
    assert_eq!(revived.status, Status::Acquired);
    assert_eq!(revived.attempt_count, 0);
    let note = revived.last_error.unwrap();
    assert!(note.starts_with("transient: parser timeout 3 | revived at"));
    assert!(note.ends_with("(parser fixed)"));

    // The raw output survived the whole detour.
    let detail = p.engine.inspect(&ItemRef::Id(a.id)).await.unwrap();
    assert_eq!(detail.outputs.len(), 1);
    assert_eq!(detail.outputs[0].payload["raw_ref"], "raw/k1");
}

#[tokio::test]
async fn every_transition_is_observed_and_audited() {
    let p = pipeline(PipelineConfig::default()).await;
    let id = p.engine.submit(&job_link(9), &Provenance::default()).await.unwrap().id;
    p.engine.advance(10).await.unwrap();

    for stage in Stage::ALL {
        let item = p.engine.claim(stage, None).await.unwrap().unwrap();
        p.clock.advance(Duration::from_secs(3));
        p.engine.commit(&item, serde_json::json!({ "stage": stage.as_str() })).await.unwrap().unwrap();
    }

    let events = p.events.for_item(id);
    let audit = p.engine.inspect(&ItemRef::Id(id)).await.unwrap().transitions;
    assert_eq!(events.len(), audit.len());
    for (event, record) in events.iter().zip(&audit) {
        assert_eq!((event.from, event.to, event.outcome), (record.from, record.to, record.outcome));
    }
    assert_eq!(events.last().unwrap().to, Status::Extracted);
    assert!(
        events
            .iter()
            .filter(|e| e.outcome == Outcome::Committed)
            .all(|e| e.duration == Duration::from_secs(3))
    );
}

#[tokio::test]
async fn prune_keeps_outputs_of_live_items() {
    let p = pipeline(PipelineConfig::default()).await;
    for n in 0..2 {
        p.engine.submit(&job_link(n), &Provenance::default()).await.unwrap();
    }
    p.engine.advance(10).await.unwrap();

    // Item one runs to completion, item two stops after acquisition.
    let first = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
    p.engine.commit(&first, serde_json::json!({})).await.unwrap().unwrap();
    let second = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
    p.engine.commit(&second, serde_json::json!({})).await.unwrap().unwrap();
    for stage in [Stage::Normalization, Stage::Extraction] {
        let item = p.engine.claim(stage, None).await.unwrap().unwrap();
        assert_eq!(item.id, first.id);
        p.engine.commit(&item, serde_json::json!({})).await.unwrap().unwrap();
    }

    p.clock.advance(Duration::from_secs(31 * 24 * 3600));
    let removed = p
        .engine
        .prune(Stage::Acquisition, Duration::from_secs(30 * 24 * 3600))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    let kept = p.engine.inspect(&ItemRef::Id(second.id)).await.unwrap();
    assert_eq!(kept.outputs.len(), 1);
}

#[tokio::test]
async fn requeue_pulls_retry_forward() {
    let p = pipeline(PipelineConfig::default()).await;
    let sweeper = Sweeper::new(p.engine.clone());
    let link = job_link(3);
    p.engine.submit(&link, &Provenance::default()).await.unwrap();
    p.engine.advance(10).await.unwrap();

    let item = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
    p.engine.fail(&item, &StageFailure::transient("503")).await.unwrap().unwrap();
    assert_eq!(sweeper.sweep_once().await.unwrap().retried, 0);

    let requeued = p.engine.requeue(&ItemRef::Key(link)).await.unwrap();
    assert_eq!(requeued.next_eligible_at, p.clock.now());
    assert_eq!(sweeper.sweep_once().await.unwrap().retried, 1);
    assert!(p.engine.claim(Stage::Acquisition, None).await.unwrap().is_some());
}

#[tokio::test]
async fn pipeline_cap_spans_stages() {
    let mut config = PipelineConfig::default();
    config.pipeline_max_attempts = Some(2);
    let p = pipeline(config).await;
    let sweeper = Sweeper::new(p.engine.clone());
    p.engine.submit(&job_link(4), &Provenance::default()).await.unwrap();
    p.engine.advance(10).await.unwrap();

    let item = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
    p.engine.fail(&item, &StageFailure::transient("first")).await.unwrap().unwrap();
    p.clock.advance(Duration::from_secs(3600));
    sweeper.sweep_once().await.unwrap();
    let item = p.engine.claim(Stage::Acquisition, None).await.unwrap().unwrap();
    p.engine.commit(&item, serde_json::json!({})).await.unwrap().unwrap();

    // Fresh stage budget, but the pipeline-wide cap is already at one.
    let item = p.engine.claim(Stage::Normalization, None).await.unwrap().unwrap();
    assert_eq!(item.attempt_count, 0);
    let dead = p
        .engine
        .fail(&item, &StageFailure::transient("second"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.status, Status::Dead);
    assert_eq!(dead.total_attempts, 2);
}
