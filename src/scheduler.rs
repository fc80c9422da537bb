//! Fetch scheduler.
//!
//! Each cycle loads the channels that are due, and fetches all of them
//! concurrently. A counting semaphore per connector type caps how many
//! fetches of that type are in flight at once (the pipeline run that
//! follows is outside the bound); different types never wait
//! on each other. A channel's failure is recorded on the channel and never
//! affects its siblings.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::connector::ConnectorRegistry;
use crate::models::Channel;
use crate::pipeline::{Pipeline, PipelineReport};
use crate::status::StatusHandle;
use crate::store::Store;

/// What happened to one channel in a cycle.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    pub channel_id: i64,
    pub fetched: usize,
    pub report: Option<PipelineReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub inserted: usize,
    pub outcomes: Vec<ChannelOutcome>,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    connectors: ConnectorRegistry,
    pipeline: Arc<Pipeline>,
    config: SchedulerConfig,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        connectors: ConnectorRegistry,
        pipeline: Arc<Pipeline>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            connectors,
            pipeline,
            config,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// The semaphore bounding `connector_type`, created on first use.
    fn semaphore_for(&self, connector_type: &str) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(connector_type.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.limit_for(connector_type))))
            .clone()
    }

    /// Fetch every due channel once.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let now = Utc::now().timestamp();
        let due = self.store.due_channels(now).await?;
        let mut report = CycleReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            debug!("no channels due");
            return Ok(report);
        }
        info!(channels = due.len(), "starting fetch cycle");

        let mut tasks = JoinSet::new();
        for channel in due {
            let semaphore = self.semaphore_for(&channel.connector_type);
            let store = Arc::clone(&self.store);
            let pipeline = Arc::clone(&self.pipeline);
            let connectors = self.connectors.clone();
            let timeout = Duration::from_secs(self.config.fetch_timeout_secs);
            let training_mode = self.config.training_mode;

            tasks.spawn(async move {
                fetch_channel(
                    store.as_ref(),
                    &connectors,
                    &pipeline,
                    &semaphore,
                    channel,
                    timeout,
                    training_mode,
                )
                .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if outcome.error.is_some() {
                        report.failed += 1;
                    } else {
                        report.succeeded += 1;
                    }
                    report.inserted += outcome.report.map(|r| r.inserted).unwrap_or(0);
                    report.outcomes.push(outcome);
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "fetch task panicked");
                }
            }
        }

        info!(
            due = report.due,
            succeeded = report.succeeded,
            failed = report.failed,
            inserted = report.inserted,
            "fetch cycle finished"
        );
        Ok(report)
    }

    /// Run cycles every `tick_secs` until cancelled.
    pub async fn run(self: Arc<Self>, status: StatusHandle, cancel: CancellationToken) {
        status.started().await;
        let tick = Duration::from_secs(self.config.tick_secs.max(1));
        loop {
            match self.run_cycle().await {
                Ok(report) => {
                    status.processed(report.inserted as u64).await;
                    for outcome in report.outcomes.iter().filter(|o| o.error.is_some()) {
                        status
                            .error(format!(
                                "channel {}: {}",
                                outcome.channel_id,
                                outcome.error.as_deref().unwrap_or_default()
                            ))
                            .await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "fetch cycle failed");
                    status.error(e.to_string()).await;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }
        }
        status.stopped().await;
        info!("scheduler stopped");
    }
}

/// Fetch one channel, hand the result to the pipeline, record the attempt.
///
/// The type's permit covers the fetch only; pipeline time does not count
/// against the connector's bound.
async fn fetch_channel(
    store: &dyn Store,
    connectors: &ConnectorRegistry,
    pipeline: &Pipeline,
    semaphore: &Semaphore,
    channel: Channel,
    timeout: Duration,
    training_mode: bool,
) -> ChannelOutcome {
    let attempted_at = Utc::now().timestamp();
    let mut outcome = ChannelOutcome {
        channel_id: channel.id,
        fetched: 0,
        report: None,
        error: None,
    };

    let result: Result<PipelineReport> = async {
        let connector = connectors.get(&channel.connector_type).ok_or_else(|| {
            anyhow::anyhow!("unknown connector type '{}'", channel.connector_type)
        })?;
        let items = {
            let _permit = semaphore.acquire().await?;
            tokio::time::timeout(timeout, connector.fetch(&channel))
                .await
                .map_err(|_| anyhow::anyhow!("fetch timed out after {}s", timeout.as_secs()))??
        };
        outcome.fetched = items.len();
        pipeline.process(items, &channel, training_mode).await
    }
    .await;

    match result {
        Ok(report) => outcome.report = Some(report),
        Err(e) => {
            warn!(channel = channel.id, name = %channel.name, error = %e, "channel fetch failed");
            outcome.error = Some(format!("{:#}", e));
        }
    }

    if let Err(e) = store
        .record_fetch(channel.id, attempted_at, outcome.error.as_deref())
        .await
    {
        error!(channel = channel.id, error = %e, "failed to record fetch attempt");
    }
    outcome
}
