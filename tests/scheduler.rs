//! Fetch scheduling: concurrency bounds and failure isolation.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{raw, MockClassifier, SlowConnector, TestDb};
use sift::config::{ClassificationConfig, DedupConfig, SchedulerConfig};
use sift::connector::ConnectorRegistry;
use sift::pipeline::Pipeline;
use sift::scheduler::Scheduler;
use sift::store::Store;

fn scheduler_config(limits: &[(&str, usize)], training_mode: bool) -> SchedulerConfig {
    SchedulerConfig {
        tick_secs: 1,
        fetch_timeout_secs: 1,
        default_concurrency: 4,
        concurrency: limits
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect::<HashMap<_, _>>(),
        training_mode,
    }
}

fn scheduler(
    db: &TestDb,
    backend: &Arc<MockClassifier>,
    connectors: &[Arc<SlowConnector>],
    config: SchedulerConfig,
) -> Scheduler {
    let mut registry = ConnectorRegistry::new();
    for c in connectors {
        registry.register(c.clone());
    }
    let pipeline = Arc::new(Pipeline::new(
        db.dyn_store(),
        backend.clone(),
        DedupConfig::default(),
        ClassificationConfig::default(),
    ));
    Scheduler::new(db.dyn_store(), registry, pipeline, config)
}

#[tokio::test]
async fn test_per_type_concurrency_bound() {
    let db = TestDb::new().await;
    let backend = MockClassifier::new();
    let browser = Arc::new(SlowConnector::new("browser", Duration::from_millis(100)));
    let rss = Arc::new(SlowConnector::new("rss", Duration::from_millis(100)));
    for i in 0..6 {
        db.channel("portal", &format!("b{}", i), "browser").await;
    }
    for i in 0..4 {
        db.channel("feeds", &format!("r{}", i), "rss").await;
    }

    let s = scheduler(
        &db,
        &backend,
        &[browser.clone(), rss.clone()],
        scheduler_config(&[("browser", 2), ("rss", 10)], false),
    );
    let report = s.run_cycle().await.unwrap();

    assert_eq!(report.due, 10);
    assert_eq!(report.succeeded, 10);
    assert_eq!(browser.peak(), 2);
    // A different type is not held back by the browser bound.
    assert_eq!(rss.peak(), 4);
}

#[tokio::test]
async fn test_failed_channel_does_not_affect_siblings() {
    let db = TestDb::new().await;
    let backend = MockClassifier::new();
    let mut connector = SlowConnector::new("rss", Duration::from_millis(5));
    connector.items = vec![raw("1", "Post", "Body")];
    connector.fail_channel = Some("broken".to_string());
    let connector = Arc::new(connector);

    let broken = db.channel("feeds", "broken", "rss").await;
    let healthy = db.channel("feeds", "healthy", "rss").await;
    let s = scheduler(
        &db,
        &backend,
        &[connector],
        scheduler_config(&[], false),
    );

    let report = s.run_cycle().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.inserted, 1);

    let channels = db.store.list_channels().await.unwrap();
    let broken = channels.iter().find(|c| c.id == broken.id).unwrap();
    let healthy = channels.iter().find(|c| c.id == healthy.id).unwrap();
    assert!(broken.last_error.as_deref().unwrap().contains("403"));
    assert!(broken.last_fetched_at.is_some());
    assert_eq!(healthy.last_error, None);
    assert!(healthy.last_fetched_at.is_some());
    assert_eq!(db.store.list_items(healthy.id).await.unwrap().len(), 1);

    // Both were attempted, so neither is due again this hour.
    assert_eq!(s.run_cycle().await.unwrap().due, 0);
}

#[tokio::test]
async fn test_unknown_type_and_timeout_are_recorded() {
    let db = TestDb::new().await;
    let backend = MockClassifier::new();
    let slow = Arc::new(SlowConnector::new("scrape", Duration::from_secs(3)));
    let orphan = db.channel("misc", "orphan", "carrier-pigeon").await;
    let stuck = db.channel("misc", "stuck", "scrape").await;

    let s = scheduler(&db, &backend, &[slow], scheduler_config(&[], false));
    let report = s.run_cycle().await.unwrap();
    assert_eq!(report.failed, 2);

    let channels = db.store.list_channels().await.unwrap();
    let error_of = |id: i64| {
        channels
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.last_error.clone())
            .unwrap()
    };
    assert!(error_of(orphan.id).contains("unknown connector type"));
    assert!(error_of(stuck.id).contains("timed out"));
}

#[tokio::test]
async fn test_success_clears_previous_error() {
    let db = TestDb::new().await;
    let backend = MockClassifier::new();
    let channel = db.channel("feeds", "flaky", "rss").await;
    db.store
        .record_fetch(channel.id, 0, Some("HTTP 500"))
        .await
        .unwrap();

    let connector = Arc::new(SlowConnector::new("rss", Duration::from_millis(1)));
    let s = scheduler(&db, &backend, &[connector], scheduler_config(&[], false));
    s.run_cycle().await.unwrap();

    let channel = db.store.list_channels().await.unwrap().remove(0);
    assert_eq!(channel.last_error, None);
}

#[tokio::test]
async fn test_training_mode_is_forwarded() {
    let db = TestDb::new().await;
    let backend = MockClassifier::new();
    let mut connector = SlowConnector::new("rss", Duration::from_millis(1));
    connector.items = vec![raw("1", "Post", "Body"), raw("2", "Other", "Text")];
    let channel = db.channel("feeds", "main", "rss").await;

    let s = scheduler(
        &db,
        &backend,
        &[Arc::new(connector)],
        scheduler_config(&[], true),
    );
    let report = s.run_cycle().await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(backend.classify_calls(), 0);
    let items = db.store.list_items(channel.id).await.unwrap();
    assert!(items.iter().all(|i| !i.fast_classified));
}

#[tokio::test]
async fn test_pipeline_runs_outside_the_fetch_bound() {
    let db = TestDb::new().await;
    let backend = MockClassifier::new();
    *backend.classify_delay.lock().unwrap() = Duration::from_millis(400);
    let mut browser = SlowConnector::new("browser", Duration::from_millis(10));
    browser.items = vec![raw("1", "Post", "Body")];
    let browser = Arc::new(browser);
    for i in 0..2 {
        db.channel("portal", &format!("b{}", i), "browser").await;
    }

    let s = scheduler(
        &db,
        &backend,
        &[browser.clone()],
        scheduler_config(&[("browser", 1)], false),
    );
    let started = std::time::Instant::now();
    let report = s.run_cycle().await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(browser.peak(), 1);
    // Both classifications overlap once each fetch hands back its permit.
    assert!(started.elapsed() < Duration::from_millis(750));
}
