mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::{fast_config, raw, FlakyStore, Reply, ScriptedEnricher, StaticSource};
use dailyhot_core::{RawItem, RawTimestamp};
use dailyhot_storage::{DigestQuery, HotItemStore, MemoryHotItemStore};
use dailyhot_sync::{
    collect_once, CategoryFilter, CollectSummary, HotPipeline, JobRun, SkipReason, SyncConfig,
    ENRICH_JOB,
};

fn source() -> StaticSource {
    StaticSource::default()
        .with_list(
            "36kr",
            vec![
                raw("Chip export rules", Some("https://36kr.com/p/1")),
                raw("Battery startup raises", Some("https://36kr.com/p/2")),
            ],
        )
        .with_list("weibo", vec![raw("Typhoon warning", Some("https://weibo.com/3"))])
}

fn pipeline(store: Arc<dyn HotItemStore>, enricher: Arc<ScriptedEnricher>) -> HotPipeline {
    let mut config = SyncConfig::from_lookup(|_| None);
    config.enrichment = fast_config(50);
    HotPipeline::new(config, store, Arc::new(source()), enricher)
}

#[tokio::test]
async fn collecting_twice_refreshes_rows_instead_of_duplicating() {
    let store = MemoryHotItemStore::new();
    let filter = CategoryFilter::default();

    let first = collect_once(&source(), &store, &filter).await;
    assert_eq!(first.categories, 2);
    assert_eq!(first.fetched, 3);
    assert_eq!(first.inserted, 3);

    let second = collect_once(&source(), &store, &filter).await;
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 3);
    assert_eq!(store.len().await, 3);
}

#[tokio::test]
async fn excluded_categories_are_not_fetched() {
    let store = MemoryHotItemStore::new();
    let filter = CategoryFilter {
        include: Vec::new(),
        exclude: vec!["weibo".into()],
    };

    let summary = collect_once(&source(), &store, &filter).await;

    assert_eq!(summary.skipped_categories, 1);
    assert_eq!(summary.categories, 1);
    assert!(store.find("weibo", "Typhoon warning").await.unwrap().is_none());
    assert!(store.find("36kr", "Chip export rules").await.unwrap().is_some());
}

#[tokio::test]
async fn absent_list_moves_on_to_the_next_category() {
    let store = MemoryHotItemStore::new();
    let source = StaticSource::default()
        .with_missing("weread")
        .with_list("zhihu", vec![raw("Why is the sky blue", Some("https://zhihu.com/q/1"))]);

    let summary = collect_once(&source, &store, &CategoryFilter::default()).await;

    assert_eq!(
        summary,
        CollectSummary {
            categories: 2,
            skipped_categories: 0,
            empty_categories: 1,
            fetched: 1,
            inserted: 1,
            updated: 0,
            failed: 0,
        }
    );
}

#[tokio::test]
async fn one_bad_row_does_not_abort_the_batch() {
    let store = FlakyStore::new();
    store.fail_upsert_of("Battery startup raises");
    let source = source().with_list("hupu", vec![RawItem::default()]);

    let summary = collect_once(&source, store.as_ref(), &CategoryFilter::default()).await;

    assert_eq!(summary.failed, 2, "injected failure and the untitled row");
    assert_eq!(summary.inserted, 2);
    assert!(store.find("weibo", "Typhoon warning").await.unwrap().is_some());
}

#[tokio::test]
async fn collected_then_enriched_rows_reach_the_digest() {
    let store = Arc::new(MemoryHotItemStore::new());
    let mut item = raw("Launch day", Some("https://ithome.com/9"));
    item.timestamp = Some(RawTimestamp::Integer(1_700_000_000_000));
    let source = StaticSource::default().with_list("ithome", vec![item]);

    collect_once(&source, store.as_ref(), &CategoryFilter::default()).await;
    let enricher = Arc::new(ScriptedEnricher::new(Reply::Summary));
    let mut config = SyncConfig::from_lookup(|_| None);
    config.enrichment = fast_config(50);
    let pipeline = HotPipeline::new(config, store.clone(), Arc::new(source), enricher);

    let summary = pipeline.enrich_once().await.unwrap();
    assert_eq!(summary.success, 1);

    let digest = store.digest_candidates(&DigestQuery::default()).await.unwrap();
    assert_eq!(digest.len(), 1);
    assert_eq!(
        digest[0].publish_time,
        Some(Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap())
    );
    assert_eq!(digest[0].ai_summary.as_deref(), Some("summary of https://ithome.com/9"));
}

#[tokio::test]
async fn run_once_collects_then_enriches() {
    let store = Arc::new(MemoryHotItemStore::new());
    let enricher = Arc::new(ScriptedEnricher::new(Reply::Summary));

    let run = pipeline(store.clone(), enricher.clone()).run_once().await;

    assert_eq!(run.collect.map(|c| c.inserted), Some(3));
    assert_eq!(run.enrich.map(|e| e.success), Some(3));
    assert_eq!(enricher.call_count(), 3);
}

#[tokio::test]
async fn trigger_is_coalesced_while_the_job_runs_in_process() {
    let store = Arc::new(MemoryHotItemStore::new());
    let pipeline = pipeline(store, Arc::new(ScriptedEnricher::new(Reply::Summary)));

    let _running = pipeline.enrich_gate().try_enter().unwrap();

    assert_eq!(
        pipeline.enrich_job().await,
        JobRun::Skipped(SkipReason::AlreadyRunning)
    );
    assert!(matches!(pipeline.collect_job().await, JobRun::Completed(_)));
}

#[tokio::test]
async fn overlapping_scheduled_runs_do_not_overlap() {
    let store = Arc::new(MemoryHotItemStore::new());
    let enricher = Arc::new(ScriptedEnricher::slow(Reply::Summary, Duration::from_millis(200)));
    let pipeline = Arc::new(pipeline(store, enricher.clone()));
    pipeline.collect_once().await;

    let first = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.enrich_job().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        pipeline.enrich_job().await,
        JobRun::Skipped(SkipReason::AlreadyRunning)
    );
    let finished = first.await.unwrap();
    assert_eq!(finished.completed().map(|s| s.success), Some(3));
    assert_eq!(enricher.call_count(), 3);
}

#[tokio::test]
async fn job_held_by_another_worker_is_skipped() {
    let store = Arc::new(MemoryHotItemStore::new());
    store.hold_job(ENRICH_JOB).await;
    let enricher = Arc::new(ScriptedEnricher::new(Reply::Summary));
    let pipeline = pipeline(store.clone(), enricher.clone());

    assert_eq!(
        pipeline.enrich_job().await,
        JobRun::Skipped(SkipReason::HeldElsewhere)
    );

    store.release_job(ENRICH_JOB).await;
    assert!(matches!(pipeline.enrich_job().await, JobRun::Completed(_)));
}

#[tokio::test]
async fn no_new_runs_after_drain() {
    let store = Arc::new(MemoryHotItemStore::new());
    let pipeline = pipeline(store.clone(), Arc::new(ScriptedEnricher::new(Reply::Summary)));

    pipeline.drain().await;

    assert_eq!(
        pipeline.collect_job().await,
        JobRun::Skipped(SkipReason::ShuttingDown)
    );
    assert!(store.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_startup_run_finishes_the_row_in_flight() {
    let store = Arc::new(MemoryHotItemStore::new());
    let enricher = Arc::new(ScriptedEnricher::slow(Reply::Summary, Duration::from_millis(300)));
    let mut config = SyncConfig::from_lookup(|_| None);
    config.enrichment = fast_config(50);
    config.run_on_start = true;
    let pipeline = Arc::new(HotPipeline::new(
        config,
        store.clone(),
        Arc::new(source()),
        enricher.clone(),
    ));

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stop.send(());
    });
    pipeline
        .serve_until(async move {
            let _ = stopped.await;
        })
        .await
        .unwrap();

    assert_eq!(store.len().await, 3, "startup collect completed");
    assert_eq!(enricher.call_count(), 1);
    let enriched = store.snapshot().await.iter().filter(|i| i.is_enriched()).count();
    assert_eq!(enriched, 1, "the row in flight was committed");
}

#[tokio::test]
async fn job_failures_are_reported_not_raised() {
    let store = FlakyStore::new();
    store.fail_pages();
    let pipeline = pipeline(store, Arc::new(ScriptedEnricher::new(Reply::Summary)));

    match pipeline.enrich_job().await {
        JobRun::Failed(message) => assert!(message.contains("loading enrichment page")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(pipeline.enrich_gate().try_enter().is_some(), "gate released after failure");
}
