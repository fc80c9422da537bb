//! Storage contracts: config sync, uniqueness, queue depths.

mod common;

use chrono::Utc;

use common::TestDb;
use sift::config::Config;
use sift::models::{FastClassification, NewItem};
use sift::rules::RuleType;
use sift::store::{sync_sources, Store};

const CONFIG: &str = r#"
[db]
path = "unused.sqlite"

[[sources]]
name = "agency"

[[sources.channels]]
name = "press"
url = "https://agency.example.org/press.xml"
connector = "rss"
interval_secs = 600
options = { max_items = 20 }

[[sources.channels]]
name = "archive"
url = "https://agency.example.org/archive.xml"
connector = "rss"
enabled = false

[[sources]]
name = "retired"
enabled = false

[[sources.channels]]
name = "old"
url = "https://retired.example.org/feed.xml"
connector = "rss"

[[rules]]
name = "second"
type = "regex"
pattern = "tender"

[[rules]]
name = "first"
type = "keyword"
terms = ["grid"]
"#;

fn new_item(channel_id: i64, external_id: &str, hash: &str) -> NewItem {
    NewItem {
        id: uuid::Uuid::new_v4().to_string(),
        channel_id,
        external_id: external_id.to_string(),
        title: "Title".to_string(),
        content: "Content".to_string(),
        url: "https://example.org".to_string(),
        author: None,
        published_at: None,
        fetched_at: Utc::now().timestamp(),
        content_hash: hash.to_string(),
        metadata_json: "{}".to_string(),
        similar_to_id: None,
        duplicate_checked: false,
        classification: None,
    }
}

#[tokio::test]
async fn test_sync_sources_is_idempotent() {
    let db = TestDb::new().await;
    let config: Config = toml::from_str(CONFIG).unwrap();

    let report = sync_sources(db.store.as_ref(), &config).await.unwrap();
    assert_eq!((report.sources, report.channels, report.rules), (2, 3, 2));
    sync_sources(db.store.as_ref(), &config).await.unwrap();

    let channels = db.store.list_channels().await.unwrap();
    assert_eq!(channels.len(), 3);
    let press = channels.iter().find(|c| c.name == "press").unwrap();
    assert_eq!(press.interval_secs, 600);
    assert_eq!(press.options["max_items"], 20);
    assert_eq!(press.source_name, "agency");

    // Disabled channels and channels of disabled sources are never due.
    let due = db.store.due_channels(Utc::now().timestamp()).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].name, "press");

    // Rules keep file order.
    let rules = db.store.rules().await.unwrap();
    assert_eq!(rules[0].name, "second");
    assert!(matches!(rules[0].rule_type, RuleType::Regex { .. }));
    assert_eq!(rules[1].name, "first");
}

#[tokio::test]
async fn test_channel_due_after_interval() {
    let db = TestDb::new().await;
    let channel = db.channel("agency", "press", "rss").await;
    let now = Utc::now().timestamp();

    db.store.record_fetch(channel.id, now, None).await.unwrap();
    assert!(db.store.due_channels(now + 3599).await.unwrap().is_empty());
    assert_eq!(db.store.due_channels(now + 3600).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_uniqueness_is_enforced_at_insert() {
    let db = TestDb::new().await;
    let channel = db.channel("agency", "press", "rss").await;

    assert!(db.store.insert_item(&new_item(channel.id, "a", "h1")).await.unwrap());
    assert!(!db.store.insert_item(&new_item(channel.id, "a", "h2")).await.unwrap());
    assert!(!db.store.insert_item(&new_item(channel.id, "b", "h1")).await.unwrap());
    assert_eq!(db.store.count_items().await.unwrap(), 1);
    assert!(db.store.item_exists(channel.id, "a").await.unwrap());
    assert!(db.store.content_hash_exists(channel.id, "h1").await.unwrap());
}

#[tokio::test]
async fn test_queue_depths_follow_markers() {
    let db = TestDb::new().await;
    let channel = db.channel("agency", "press", "rss").await;
    let a = new_item(channel.id, "a", "h1");
    let b = new_item(channel.id, "b", "h2");
    db.store.insert_item(&a).await.unwrap();
    db.store.insert_item(&b).await.unwrap();
    db.age_item(&b.id, 30 * 86_400).await;

    let depths = db.store.queue_depths(None).await.unwrap();
    assert_eq!(depths.unclassified, 2);
    assert_eq!(depths.unchecked, 2);
    assert_eq!(depths.unindexed, 2);
    assert_eq!(depths.pending_deep_analysis, 0);

    let week_ago = Utc::now().timestamp() - 7 * 86_400;
    assert_eq!(db.store.queue_depths(Some(week_ago)).await.unwrap().unchecked, 1);

    let mut uncertain = FastClassification::sentinel();
    uncertain.confidence = 0.5;
    assert!(db
        .store
        .apply_fast_classification(&a.id, &uncertain)
        .await
        .unwrap());
    db.store.mark_indexed(&[a.id.clone()]).await.unwrap();

    let depths = db.store.queue_depths(None).await.unwrap();
    assert_eq!(depths.unclassified, 1);
    assert_eq!(depths.unindexed, 1);
    assert_eq!(depths.pending_deep_analysis, 1);
}

#[tokio::test]
async fn test_mark_duplicate_checked_is_conditional() {
    let db = TestDb::new().await;
    let channel = db.channel("agency", "press", "rss").await;
    let primary = new_item(channel.id, "p", "h1");
    let other = new_item(channel.id, "o", "h2");
    db.store.insert_item(&primary).await.unwrap();
    db.store.insert_item(&other).await.unwrap();

    assert!(db
        .store
        .mark_duplicate_checked(&other.id, Some(&primary.id))
        .await
        .unwrap());
    // A second verdict does not overwrite the first.
    assert!(!db.store.mark_duplicate_checked(&other.id, None).await.unwrap());

    let stored = db.store.get_item(&other.id).await.unwrap().unwrap();
    assert_eq!(stored.similar_to_id.as_deref(), Some(primary.id.as_str()));
    assert_eq!(
        db.store.resolve_primary(&other.id).await.unwrap().as_deref(),
        Some(primary.id.as_str())
    );
    assert_eq!(db.store.resolve_primary("missing").await.unwrap(), None);
}
