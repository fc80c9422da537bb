//! Per-channel ingestion pipeline.
//!
//! Runs each raw item through normalize → exact dedup → semantic dedup →
//! fast classification → rules → persist → index, in the order the
//! connector returned them. Backend failures never block persistence: the
//! item is stored with whatever markers were reached, and the classifier
//! worker completes the rest later.
//!
//! Every attempted step appends one [`ProcessingLogEntry`], including
//! skipped and failed ones.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classification::{route, ClassificationBackend, ClassificationResult};
use crate::config::{ClassificationConfig, DedupConfig};
use crate::dedup::{check_duplicate, DedupCheck};
use crate::models::{
    Channel, FastClassification, NewItem, Priority, ProcessingLogEntry, RawItem, StepType,
};
use crate::normalize::normalize;
use crate::rules::{evaluate_rules, Rule, RuleInput, RuleOutcome};
use crate::store::Store;

/// Counters for one `process` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub received: usize,
    pub inserted: usize,
    pub exact_duplicates: usize,
    pub semantic_duplicates: usize,
    pub classified: usize,
    /// Items stored without a dedup check or classification.
    pub deferred: usize,
    pub failed: usize,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    backend: Arc<dyn ClassificationBackend>,
    dedup: DedupConfig,
    classification: ClassificationConfig,
}

/// Append a log entry; a failed write is logged and otherwise ignored.
pub(crate) async fn record(store: &dyn Store, entry: ProcessingLogEntry) {
    if let Err(e) = store.append_log(&entry).await {
        warn!(step = entry.step_type.as_str(), error = %e, "failed to append processing log");
    }
}

/// Route a backend result through the bands and then the rules.
pub fn classify_with_rules(
    result: &ClassificationResult,
    rules: &[Rule],
    title: &str,
    content: &str,
    config: &ClassificationConfig,
) -> (FastClassification, RuleOutcome) {
    let mut classification = route(result, config);
    let outcome = evaluate_rules(
        rules,
        &RuleInput {
            title,
            content,
            category_confidences: &result.category_confidences,
        },
    );
    outcome.apply(&mut classification);
    (classification, outcome)
}

/// Log entry for the rules step, or `None` when nothing matched.
pub(crate) fn rules_entry(
    item_id: &str,
    channel_id: i64,
    before: Priority,
    classification: &FastClassification,
    outcome: &RuleOutcome,
) -> Option<ProcessingLogEntry> {
    if outcome.is_empty() {
        return None;
    }
    Some(
        ProcessingLogEntry::begin(StepType::Rules, Some(item_id), Some(channel_id))
            .model(&outcome.matched.join(","))
            .priorities(Some(before), Some(classification.priority))
            .finish(),
    )
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn ClassificationBackend>,
        dedup: DedupConfig,
        classification: ClassificationConfig,
    ) -> Self {
        Self {
            store,
            backend,
            dedup,
            classification,
        }
    }

    /// Process one channel's fetch result. Returns the per-step counters;
    /// `report.inserted` is the new-item count.
    ///
    /// With `training_mode` set, items are stored without any backend call
    /// and stay in the backlog queues.
    pub async fn process(
        &self,
        raw_items: Vec<RawItem>,
        channel: &Channel,
        training_mode: bool,
    ) -> Result<PipelineReport> {
        let mut report = PipelineReport {
            received: raw_items.len(),
            ..Default::default()
        };
        if raw_items.is_empty() {
            return Ok(report);
        }

        // One probe per batch; a dead backend is not retried item by item.
        let mut backend_up = !training_mode && self.backend.is_available().await;
        if !training_mode && !backend_up {
            warn!(
                channel = channel.id,
                items = raw_items.len(),
                "classification backend unavailable, deferring to backlog"
            );
        }

        let rules = if backend_up {
            self.store.rules().await.unwrap_or_else(|e| {
                warn!(error = %e, "failed to load rules, continuing without");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        for raw in raw_items {
            match self
                .process_one(raw, channel, training_mode, &mut backend_up, &rules, &mut report)
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(channel = channel.id, error = %e, "item failed in pipeline");
                }
            }
        }

        info!(
            channel = channel.id,
            received = report.received,
            inserted = report.inserted,
            exact_duplicates = report.exact_duplicates,
            semantic_duplicates = report.semantic_duplicates,
            classified = report.classified,
            deferred = report.deferred,
            failed = report.failed,
            "pipeline finished"
        );
        Ok(report)
    }

    async fn process_one(
        &self,
        raw: RawItem,
        channel: &Channel,
        training_mode: bool,
        backend_up: &mut bool,
        rules: &[Rule],
        report: &mut PipelineReport,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let backend_name = self.backend.name().to_string();

        // 1. Normalize
        let normalized = normalize(&raw.title, &raw.content, &raw.url);
        let external_id = match raw.external_id.trim() {
            "" => normalized.content_hash.clone(),
            id => id.to_string(),
        };
        let item_id = Uuid::new_v4().to_string();

        // 2. Exact dedup
        let exact = ProcessingLogEntry::begin(StepType::ExactDedup, None, Some(channel.id));
        if store.item_exists(channel.id, &external_id).await? {
            report.exact_duplicates += 1;
            record(store, exact.skipped("external_id already stored").finish()).await;
            return Ok(());
        }
        if store
            .content_hash_exists(channel.id, &normalized.content_hash)
            .await?
        {
            report.exact_duplicates += 1;
            record(store, exact.skipped("content_hash already stored").finish()).await;
            return Ok(());
        }
        let mut pending = vec![exact.item(&item_id).finish()];

        // 3. Semantic dedup
        let dedup_log =
            ProcessingLogEntry::begin(StepType::SemanticDedup, Some(&item_id), Some(channel.id))
                .model(&backend_name);
        let mut similar_to_id = None;
        let mut duplicate_checked = false;
        if training_mode {
            pending.push(dedup_log.skipped("training mode").finish());
        } else if !*backend_up {
            pending.push(dedup_log.skipped("classification backend unavailable").finish());
        } else {
            match check_duplicate(
                store,
                self.backend.as_ref(),
                &normalized.title,
                &normalized.content,
                self.dedup.similarity_threshold,
                None,
            )
            .await
            {
                Ok(DedupCheck::Unique) => {
                    duplicate_checked = true;
                    pending.push(dedup_log.finish());
                }
                Ok(DedupCheck::Duplicate { primary_id, score }) => {
                    debug!(item = %item_id, primary = %primary_id, score, "semantic duplicate");
                    duplicate_checked = true;
                    similar_to_id = Some(primary_id);
                    report.semantic_duplicates += 1;
                    pending.push(dedup_log.confidence(score).finish());
                }
                Ok(DedupCheck::Deferred(e)) => {
                    if e.is_unavailable() {
                        *backend_up = false;
                    }
                    pending.push(dedup_log.error(e.to_string()).finish());
                }
                Err(e) => {
                    pending.push(dedup_log.error(e.to_string()).finish());
                }
            }
        }

        // 4. Fast classification, then rules
        let classify_log =
            ProcessingLogEntry::begin(StepType::FastClassify, Some(&item_id), Some(channel.id))
                .model(&backend_name);
        let mut classification = None;
        if training_mode {
            pending.push(classify_log.skipped("training mode").finish());
        } else if !*backend_up {
            pending.push(classify_log.skipped("classification backend unavailable").finish());
        } else {
            match self
                .backend
                .classify(&normalized.title, &normalized.content, &channel.source_name)
                .await
            {
                Ok(result) => {
                    let (fast, outcome) = classify_with_rules(
                        &result,
                        rules,
                        &normalized.title,
                        &normalized.content,
                        &self.classification,
                    );
                    pending.push(
                        classify_log
                            .confidence(result.confidence)
                            .priorities(None, Some(result.priority))
                            .finish(),
                    );
                    pending.extend(rules_entry(
                        &item_id,
                        channel.id,
                        result.priority,
                        &fast,
                        &outcome,
                    ));
                    classification = Some(fast);
                }
                Err(e) => {
                    if e.is_unavailable() {
                        *backend_up = false;
                    }
                    pending.push(classify_log.error(e.to_string()).finish());
                }
            }
        }

        // 5. Persist
        let persist_log =
            ProcessingLogEntry::begin(StepType::Persist, Some(&item_id), Some(channel.id));
        let classified = classification.is_some();
        let new_item = NewItem {
            id: item_id.clone(),
            channel_id: channel.id,
            external_id,
            title: normalized.title,
            content: normalized.content,
            url: normalized.url,
            author: raw.author.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
            published_at: raw.published_at.map(|d| d.timestamp()),
            fetched_at: Utc::now().timestamp(),
            content_hash: normalized.content_hash,
            metadata_json: if raw.metadata.is_null() {
                "{}".to_string()
            } else {
                raw.metadata.to_string()
            },
            similar_to_id,
            duplicate_checked,
            classification,
        };

        let inserted = match store.insert_item(&new_item).await {
            Ok(inserted) => inserted,
            Err(e) => {
                record(store, persist_log.error(e.to_string()).finish()).await;
                return Err(e);
            }
        };
        if !inserted {
            // Lost a race with a concurrent insert of the same identity.
            report.exact_duplicates += 1;
            let entry = ProcessingLogEntry::begin(StepType::ExactDedup, None, Some(channel.id))
                .skipped("uniqueness constraint at insert")
                .finish();
            record(store, entry).await;
            return Ok(());
        }

        report.inserted += 1;
        if classified {
            report.classified += 1;
        }
        if !classified || !duplicate_checked {
            report.deferred += 1;
        }
        pending.push(persist_log.finish());
        for entry in pending {
            record(store, entry).await;
        }

        // 6. Index, best effort
        if !training_mode && *backend_up {
            let index_log =
                ProcessingLogEntry::begin(StepType::Index, Some(&item_id), Some(channel.id))
                    .model(&backend_name);
            match self
                .backend
                .index(&item_id, &new_item.title, &new_item.content)
                .await
            {
                Ok(()) => {
                    store.mark_indexed(std::slice::from_ref(&item_id)).await?;
                    record(store, index_log.finish()).await;
                }
                Err(e) => {
                    if e.is_unavailable() {
                        *backend_up = false;
                    }
                    record(store, index_log.error(e.to_string()).finish()).await;
                }
            }
        }

        Ok(())
    }
}
