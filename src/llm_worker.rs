//! Deep analysis of items the fast classifier was unsure about.
//!
//! Eligible items have `fast_classified` and `needs_deep_analysis` set.
//! Items fetched within the fresh window are drained first, newest first;
//! older backlog is only touched when no fresh work remains.
//!
//! Each item gets up to `max_retries` attempts with linearly increasing
//! backoff. Failed attempts are counted on the item, so the budget holds
//! across passes cut short by an unreachable host. When every attempt
//! fails, a sentinel result is stored so the item leaves the queue; it is
//! never retried automatically.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LlmConfig;
use crate::error::BackendError;
use crate::inference::{build_prompt, parse_analysis, InferenceBackend, DEFAULT_SYSTEM_PROMPT};
use crate::models::{DeepAnalysis, Item, ProcessingLogEntry, StepType};
use crate::pipeline::record;
use crate::power::PowerController;
use crate::status::StatusHandle;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisReport {
    /// Whether the batch came from the fresh window.
    pub fresh: bool,
    pub analyzed: usize,
    /// Items closed with the sentinel result.
    pub failed: usize,
    /// The backend could not be reached; remaining items stay queued.
    pub unavailable: bool,
}

impl AnalysisReport {
    pub fn processed(&self) -> usize {
        self.analyzed + self.failed
    }
}

/// Whether a generate error leaves the item queued without spending an
/// attempt. A timed-out generation may be the prompt's fault, so it counts.
fn defers(err: &BackendError) -> bool {
    err.is_unavailable() && !matches!(err, BackendError::Timeout)
}

enum ItemOutcome {
    Analyzed,
    Sentinel,
    Unavailable,
}

pub struct LlmWorker {
    store: Arc<dyn Store>,
    backend: Arc<dyn InferenceBackend>,
    power: Arc<PowerController>,
    config: LlmConfig,
}

impl LlmWorker {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn InferenceBackend>,
        power: Arc<PowerController>,
        config: LlmConfig,
    ) -> Self {
        Self {
            store,
            backend,
            power,
            config,
        }
    }

    /// Next batch: fresh items if any, else backlog.
    async fn next_batch(&self) -> Result<(bool, Vec<Item>)> {
        let fresh_since = Utc::now().timestamp() - self.config.fresh_window_hours * 3600;
        let limit = self.config.batch_size;
        let fresh = self
            .store
            .deep_analysis_candidates(fresh_since, true, limit)
            .await?;
        if !fresh.is_empty() {
            return Ok((true, fresh));
        }
        let backlog = self
            .store
            .deep_analysis_candidates(fresh_since, false, limit)
            .await?;
        Ok((false, backlog))
    }

    /// Analyze one batch.
    pub async fn run_once(&self) -> Result<AnalysisReport> {
        let (fresh, batch) = self.next_batch().await?;
        let mut report = AnalysisReport {
            fresh,
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        if let Err(e) = self.power.ensure_available().await {
            warn!(error = %e, pending = batch.len(), "deep analysis unavailable this cycle");
            report.unavailable = true;
            return Ok(report);
        }

        let sources: HashMap<i64, String> = self
            .store
            .list_channels()
            .await?
            .into_iter()
            .map(|c| (c.id, c.source_name))
            .collect();

        for item in batch {
            let source = sources.get(&item.channel_id).map(String::as_str).unwrap_or("");
            match self.analyze_item(&item, source).await? {
                ItemOutcome::Analyzed => report.analyzed += 1,
                ItemOutcome::Sentinel => report.failed += 1,
                ItemOutcome::Unavailable => {
                    report.unavailable = true;
                    break;
                }
            }
        }

        info!(
            fresh = report.fresh,
            analyzed = report.analyzed,
            failed = report.failed,
            "deep analysis batch finished"
        );
        Ok(report)
    }

    async fn analyze_item(&self, item: &Item, source: &str) -> Result<ItemOutcome> {
        let store = self.store.as_ref();
        let prompt = build_prompt(item, source);
        let system = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let max_retries = i64::from(self.config.max_retries);
        // Failures are persisted, so an interrupted pass resumes the budget
        // instead of starting it over.
        let mut failures = item.analysis_attempts;
        let mut last_error = String::from("retry budget exhausted");

        while failures < max_retries {
            let attempt = failures + 1;
            let log = ProcessingLogEntry::begin(
                StepType::DeepAnalysis,
                Some(&item.id),
                Some(item.channel_id),
            )
            .model(self.backend.name());

            let parsed = {
                let _call = self.power.begin_call();
                let reply = self.backend.generate(&prompt, Some(system)).await;
                self.power.record_activity().await;
                reply.and_then(|text| parse_analysis(&text))
            };

            match parsed {
                Ok(analysis) => {
                    store.apply_deep_analysis(&item.id, &analysis).await?;
                    record(
                        store,
                        log.priorities(item.priority, Some(analysis.priority))
                            .finish(),
                    )
                    .await;
                    debug!(item = %item.id, attempt, "deep analysis stored");
                    return Ok(ItemOutcome::Analyzed);
                }
                Err(e) if defers(&e) => {
                    // The host is away or still loading; not this item's fault.
                    record(store, log.skipped(e.to_string()).finish()).await;
                    return Ok(ItemOutcome::Unavailable);
                }
                Err(e) => {
                    warn!(item = %item.id, attempt, error = %e, "deep analysis attempt failed");
                    last_error = e.to_string();
                    record(store, log.error(last_error.clone()).finish()).await;
                    failures = store.record_analysis_failure(&item.id).await?;
                }
            }

            if failures < max_retries {
                tokio::time::sleep(self.config.backoff_for(failures as u32)).await;
            }
        }

        warn!(item = %item.id, error = %last_error, "deep analysis gave up, storing sentinel");
        store
            .apply_deep_analysis(&item.id, &DeepAnalysis::sentinel(&last_error))
            .await?;
        Ok(ItemOutcome::Sentinel)
    }

    /// Run batches until one finds nothing to process. Used by one-shot CLI runs.
    pub async fn drain(&self) -> Result<AnalysisReport> {
        let mut total = AnalysisReport::default();
        loop {
            let pass = self.run_once().await?;
            total.analyzed += pass.analyzed;
            total.failed += pass.failed;
            total.unavailable |= pass.unavailable;
            if pass.processed() == 0 {
                return Ok(total);
            }
        }
    }

    pub async fn run(self: Arc<Self>, status: StatusHandle, cancel: CancellationToken) {
        status.started().await;
        info!(model = self.backend.name(), "llm worker started");
        let idle = std::time::Duration::from_secs(self.config.idle_secs);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let was_idle = match self.run_once().await {
                Ok(pass) => {
                    status.processed(pass.processed() as u64).await;
                    if pass.unavailable {
                        status.error("inference backend unavailable").await;
                    }
                    pass.processed() == 0
                }
                Err(e) => {
                    error!(error = %e, "llm pass failed");
                    status.error(e.to_string()).await;
                    true
                }
            };

            if was_idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
        status.stopped().await;
        info!("llm worker stopped");
    }
}
