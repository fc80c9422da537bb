//! Backlog catch-up for the fast classification stage.
//!
//! Three queues, strictly prioritized and re-evaluated on every pass:
//!
//! 1. classify items with `fast_classified` unset
//! 2. duplicate-check items with `duplicate_checked` unset and no link,
//!    within the recency window
//! 3. index items with `indexed` unset
//!
//! A pass works on the first non-empty queue only. Marker state is read
//! fresh from storage every pass and every marker write is conditional,
//! so running the worker twice over the same item is harmless.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classification::{ClassificationBackend, IndexEntry};
use crate::config::{ClassificationConfig, ClassifierWorkerConfig, DedupConfig};
use crate::dedup::{check_duplicate, DedupCheck};
use crate::error::BackendError;
use crate::models::{FastClassification, Item, ProcessingLogEntry, StepType};
use crate::pipeline::{classify_with_rules, record, rules_entry};
use crate::status::StatusHandle;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Classify,
    DuplicateCheck,
    Index,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Queue that had work, `None` when all three were empty.
    pub queue: Option<Queue>,
    pub processed: usize,
    pub errors: usize,
    /// The pass stopped early because the backend is offline.
    pub backend_unavailable: bool,
}

pub struct ClassifierWorker {
    store: Arc<dyn Store>,
    backend: Arc<dyn ClassificationBackend>,
    config: ClassifierWorkerConfig,
    dedup: DedupConfig,
    classification: ClassificationConfig,
}

impl ClassifierWorker {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn ClassificationBackend>,
        config: ClassifierWorkerConfig,
        dedup: DedupConfig,
        classification: ClassificationConfig,
    ) -> Self {
        Self {
            store,
            backend,
            config,
            dedup,
            classification,
        }
    }

    /// Lower bound on `fetched_at` for the duplicate-check queue.
    fn recency_cutoff(&self) -> Option<i64> {
        match self.config.recency_days {
            0 => None,
            days => Some(Utc::now().timestamp() - days * 86_400),
        }
    }

    /// Process one batch from the highest-priority non-empty queue.
    pub async fn run_once(&self) -> Result<PassReport> {
        let limit = self.config.batch_size;

        let batch = self.store.unclassified_items(limit).await?;
        if !batch.is_empty() {
            return self.with_backend(Queue::Classify, self.classify_batch(batch)).await;
        }

        let healed = self.store.clear_dangling_links().await?;
        if healed > 0 {
            info!(count = healed, "cleared similar_to links to missing items");
        }
        let batch = self
            .store
            .unchecked_items(self.recency_cutoff(), limit)
            .await?;
        if !batch.is_empty() {
            return self
                .with_backend(Queue::DuplicateCheck, self.dedup_batch(batch))
                .await;
        }

        let batch = self.store.unindexed_items(limit).await?;
        if !batch.is_empty() {
            return self.with_backend(Queue::Index, self.index_batch(batch)).await;
        }

        Ok(PassReport::default())
    }

    /// Probe the backend before starting a batch that needs it.
    async fn with_backend(
        &self,
        queue: Queue,
        work: impl std::future::Future<Output = Result<PassReport>>,
    ) -> Result<PassReport> {
        if !self.backend.is_available().await {
            debug!(?queue, "classification backend unavailable, backlog waits");
            return Ok(PassReport {
                queue: Some(queue),
                backend_unavailable: true,
                ..Default::default()
            });
        }
        let mut report = work.await?;
        report.queue = Some(queue);
        Ok(report)
    }

    /// Run passes until a pass finds nothing to do. Used by one-shot CLI runs.
    pub async fn drain(&self) -> Result<PassReport> {
        let mut total = PassReport::default();
        loop {
            let pass = self.run_once().await?;
            total.processed += pass.processed;
            total.errors += pass.errors;
            total.backend_unavailable |= pass.backend_unavailable;
            if pass.processed == 0 {
                return Ok(total);
            }
        }
    }

    async fn source_names(&self) -> HashMap<i64, String> {
        match self.store.list_channels().await {
            Ok(channels) => channels
                .into_iter()
                .map(|c| (c.id, c.source_name))
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to load channels for source names");
                HashMap::new()
            }
        }
    }

    async fn classify_batch(&self, batch: Vec<Item>) -> Result<PassReport> {
        let store = self.store.as_ref();
        let rules = store.rules().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to load rules, continuing without");
            Vec::new()
        });
        let sources = self.source_names().await;
        let mut report = PassReport::default();

        for item in batch {
            let source = sources.get(&item.channel_id).map(String::as_str).unwrap_or("");
            let log = ProcessingLogEntry::begin(
                StepType::FastClassify,
                Some(&item.id),
                Some(item.channel_id),
            )
            .model(self.backend.name());

            match self.backend.classify(&item.title, &item.content, source).await {
                Ok(result) => {
                    let (fast, outcome) = classify_with_rules(
                        &result,
                        &rules,
                        &item.title,
                        &item.content,
                        &self.classification,
                    );
                    if store.apply_fast_classification(&item.id, &fast).await? {
                        record(
                            store,
                            log.confidence(result.confidence)
                                .priorities(item.priority, Some(result.priority))
                                .finish(),
                        )
                        .await;
                        if let Some(entry) =
                            rules_entry(&item.id, item.channel_id, result.priority, &fast, &outcome)
                        {
                            record(store, entry).await;
                        }
                    }
                    report.processed += 1;
                }
                Err(e) if e.is_unavailable() => {
                    record(store, log.error(e.to_string()).finish()).await;
                    report.errors += 1;
                    report.backend_unavailable = true;
                    break;
                }
                Err(e) => {
                    // An answer we cannot use is terminal: hand the item to deep analysis.
                    warn!(item = %item.id, error = %e, "unusable classification, recording sentinel");
                    store
                        .apply_fast_classification(&item.id, &FastClassification::sentinel())
                        .await?;
                    record(store, log.error(e.to_string()).finish()).await;
                    report.processed += 1;
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    async fn dedup_batch(&self, batch: Vec<Item>) -> Result<PassReport> {
        let store = self.store.as_ref();
        let mut report = PassReport::default();

        for item in batch {
            let log = ProcessingLogEntry::begin(
                StepType::SemanticDedup,
                Some(&item.id),
                Some(item.channel_id),
            )
            .model(self.backend.name());

            let check = check_duplicate(
                store,
                self.backend.as_ref(),
                &item.title,
                &item.content,
                self.dedup.similarity_threshold,
                Some(&item.id),
            )
            .await?;

            match check {
                DedupCheck::Unique => {
                    store.mark_duplicate_checked(&item.id, None).await?;
                    record(store, log.finish()).await;
                    report.processed += 1;
                }
                DedupCheck::Duplicate { primary_id, score } => {
                    debug!(item = %item.id, primary = %primary_id, score, "backlog duplicate");
                    store
                        .mark_duplicate_checked(&item.id, Some(&primary_id))
                        .await?;
                    record(store, log.confidence(score).finish()).await;
                    report.processed += 1;
                }
                DedupCheck::Deferred(e) if e.is_unavailable() => {
                    record(store, log.error(e.to_string()).finish()).await;
                    report.errors += 1;
                    report.backend_unavailable = true;
                    break;
                }
                DedupCheck::Deferred(e) => {
                    // Checked, with no link: a bad answer is not retried forever.
                    store.mark_duplicate_checked(&item.id, None).await?;
                    record(store, log.error(e.to_string()).finish()).await;
                    report.processed += 1;
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    async fn index_batch(&self, batch: Vec<Item>) -> Result<PassReport> {
        let store = self.store.as_ref();
        let mut report = PassReport::default();
        let entries: Vec<IndexEntry> = batch
            .iter()
            .map(|item| IndexEntry {
                id: item.id.clone(),
                title: item.title.clone(),
                content: item.content.clone(),
            })
            .collect();

        match self.backend.index_batch(&entries).await {
            Ok(()) => {
                let ids: Vec<String> = entries.into_iter().map(|e| e.id).collect();
                store.mark_indexed(&ids).await?;
                for item in &batch {
                    let entry =
                        ProcessingLogEntry::begin(StepType::Index, Some(&item.id), Some(item.channel_id))
                            .model(self.backend.name())
                            .finish();
                    record(store, entry).await;
                }
                report.processed = batch.len();
            }
            Err(e) if e.is_unavailable() => {
                for item in &batch {
                    let entry =
                        ProcessingLogEntry::begin(StepType::Index, Some(&item.id), Some(item.channel_id))
                            .model(self.backend.name())
                            .error(e.to_string())
                            .finish();
                    record(store, entry).await;
                }
                report.errors = batch.len();
                report.backend_unavailable = true;
            }
            Err(e) => {
                warn!(error = %e, "batch index rejected, indexing items one by one");
                self.index_individually(&batch, &mut report).await?;
            }
        }

        Ok(report)
    }

    async fn index_individually(&self, batch: &[Item], report: &mut PassReport) -> Result<()> {
        let store = self.store.as_ref();
        for item in batch {
            let log = ProcessingLogEntry::begin(StepType::Index, Some(&item.id), Some(item.channel_id))
                .model(self.backend.name());
            let outcome: Result<(), BackendError> =
                self.backend.index(&item.id, &item.title, &item.content).await;
            match outcome {
                Ok(()) => {
                    store.mark_indexed(std::slice::from_ref(&item.id)).await?;
                    record(store, log.finish()).await;
                    report.processed += 1;
                }
                Err(e) if e.is_unavailable() => {
                    record(store, log.error(e.to_string()).finish()).await;
                    report.errors += 1;
                    report.backend_unavailable = true;
                    break;
                }
                Err(e) => {
                    // The index will never accept this item; stop offering it.
                    store.mark_indexed(std::slice::from_ref(&item.id)).await?;
                    record(store, log.error(e.to_string()).finish()).await;
                    report.processed += 1;
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Perpetual loop: work while any queue has items, otherwise sleep.
    pub async fn run(self: Arc<Self>, status: StatusHandle, cancel: CancellationToken) {
        status.started().await;
        info!(
            batch_size = self.config.batch_size,
            recency_days = self.config.recency_days,
            "classifier worker started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(pass) => {
                    status.processed(pass.processed as u64).await;
                    if pass.backend_unavailable {
                        status.error("classification backend unavailable").await;
                    }
                    pass.processed == 0
                }
                Err(e) => {
                    error!(error = %e, "classifier pass failed");
                    status.error(e.to_string()).await;
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_interval()) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
        status.stopped().await;
        info!("classifier worker stopped");
    }
}
