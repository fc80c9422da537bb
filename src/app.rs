//! Component wiring and the CLI command bodies.
//!
//! Every command builds the components it needs from [`Config`]; `run`
//! builds all of them and keeps them alive until interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classification::{ClassificationBackend, HttpClassificationBackend};
use crate::classifier_worker::ClassifierWorker;
use crate::config::Config;
use crate::connector::ConnectorRegistry;
use crate::db;
use crate::inference::{InferenceBackend, OllamaBackend};
use crate::llm_worker::LlmWorker;
use crate::migrate;
use crate::pipeline::Pipeline;
use crate::power::PowerController;
use crate::scheduler::Scheduler;
use crate::server::{self, AppState};
use crate::status::{StatusBoard, StatusHandle};
use crate::store::{self, SqliteStore, Store};

/// Everything a long-running process needs, built once from config.
pub struct App {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub connectors: ConnectorRegistry,
    pub classifier: Arc<dyn ClassificationBackend>,
    pub inference: Arc<dyn InferenceBackend>,
    pub power: Arc<PowerController>,
}

impl App {
    /// Connect, migrate, and construct the backends.
    pub async fn build(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

        let classifier: Arc<dyn ClassificationBackend> =
            Arc::new(HttpClassificationBackend::new(&config.classification)?);
        let inference: Arc<dyn InferenceBackend> = Arc::new(OllamaBackend::new(&config.llm)?);
        let power = Arc::new(
            PowerController::from_config(&config.power, Arc::clone(&inference))
                .context("invalid power configuration")?,
        );

        Ok(Self {
            connectors: ConnectorRegistry::with_builtins()?,
            config,
            store,
            classifier,
            inference,
            power,
        })
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::clone(&self.store),
            Arc::clone(&self.classifier),
            self.config.dedup.clone(),
            self.config.classification.clone(),
        ))
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            Arc::clone(&self.store),
            self.connectors.clone(),
            self.pipeline(),
            self.config.scheduler.clone(),
        ))
    }

    pub fn classifier_worker(&self) -> Arc<ClassifierWorker> {
        Arc::new(ClassifierWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.classifier),
            self.config.classifier_worker.clone(),
            self.config.dedup.clone(),
            self.config.classification.clone(),
        ))
    }

    pub fn llm_worker(&self) -> Arc<LlmWorker> {
        Arc::new(LlmWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.inference),
            Arc::clone(&self.power),
            self.config.llm.clone(),
        ))
    }

    fn app_state(&self, board: StatusBoard) -> AppState {
        AppState {
            store: Arc::clone(&self.store),
            board,
            power: self.config.power.enabled.then(|| Arc::clone(&self.power)),
            recency_days: self.config.classifier_worker.recency_days,
        }
    }
}

/// Copy configured sources, channels and rules into storage.
pub async fn run_sync_sources(config: Config) -> Result<()> {
    let app = App::build(config).await?;

    for source in &app.config.sources {
        for channel in &source.channels {
            let check = app
                .connectors
                .validate(&channel.connector, &channel.url, &channel.options);
            if !check.ok {
                warn!(
                    source = %source.name,
                    channel = %channel.name,
                    reason = %check.message,
                    "channel failed validation"
                );
                println!(
                    "warning: {}/{}: {}",
                    source.name, channel.name, check.message
                );
            }
        }
    }

    let report = store::sync_sources(app.store.as_ref(), &app.config).await?;
    println!(
        "Synced {} sources, {} channels, {} rules.",
        report.sources, report.channels, report.rules
    );
    Ok(())
}

/// List the connector types this build can fetch with.
pub fn run_connectors() -> Result<()> {
    let registry = ConnectorRegistry::with_builtins()?;
    println!("{:<12} DESCRIPTION", "TYPE");
    for kind in registry.types() {
        let description = registry
            .get(kind)
            .map(|c| c.description().to_string())
            .unwrap_or_default();
        println!("{:<12} {}", kind, description);
    }
    Ok(())
}

/// Fetch every due channel once.
pub async fn run_fetch(config: Config) -> Result<()> {
    let app = App::build(config).await?;
    let report = app.scheduler().run_cycle().await?;

    println!(
        "{:<8} {:>8} {:>9} {:>10} {:>9}  ERROR",
        "CHANNEL", "FETCHED", "INSERTED", "DUPLICATE", "DEFERRED"
    );
    for outcome in &report.outcomes {
        let (inserted, duplicates, deferred) = outcome
            .report
            .as_ref()
            .map(|r| {
                (
                    r.inserted,
                    r.exact_duplicates + r.semantic_duplicates,
                    r.deferred,
                )
            })
            .unwrap_or_default();
        println!(
            "{:<8} {:>8} {:>9} {:>10} {:>9}  {}",
            outcome.channel_id,
            outcome.fetched,
            inserted,
            duplicates,
            deferred,
            outcome.error.as_deref().unwrap_or("-")
        );
    }
    println!(
        "{} due, {} succeeded, {} failed, {} new items.",
        report.due, report.succeeded, report.failed, report.inserted
    );
    Ok(())
}

/// Drain the classifier backlog.
pub async fn run_classify(config: Config) -> Result<()> {
    let app = App::build(config).await?;
    let report = app.classifier_worker().drain().await?;
    println!(
        "Processed {} items ({} errors).",
        report.processed, report.errors
    );
    if report.backend_unavailable {
        println!("Classification backend unavailable; remaining items stay queued.");
    }
    Ok(())
}

/// Drain the deep analysis queue.
pub async fn run_analyze(config: Config) -> Result<()> {
    let app = App::build(config).await?;
    let report = app.llm_worker().drain().await?;
    println!(
        "Analyzed {} items, {} closed with a fallback result.",
        report.analyzed, report.failed
    );
    if report.unavailable {
        println!("Inference backend unavailable; remaining items stay queued.");
    }
    Ok(())
}

/// Print queue depths and channel health.
pub async fn run_status(config: Config) -> Result<()> {
    let app = App::build(config).await?;
    let report = server::status_report(&app.app_state(StatusBoard::new())).await?;

    let q = &report.queues;
    println!("Queues");
    println!("  {:<18} {}", "classify", q.unclassified);
    println!("  {:<18} {}", "duplicate check", q.unchecked);
    println!("  {:<18} {}", "index", q.unindexed);
    println!("  {:<18} {}", "deep analysis", q.pending_deep_analysis);
    println!();
    println!(
        "{:<6} {:<20} {:<20} {:<8} {:<8} LAST ERROR",
        "ID", "SOURCE", "CHANNEL", "TYPE", "ENABLED"
    );
    for c in &report.channels {
        println!(
            "{:<6} {:<20} {:<20} {:<8} {:<8} {}",
            c.id,
            c.source,
            c.name,
            c.connector_type,
            c.enabled,
            c.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Run the scheduler, both workers, the idle monitor and the status server
/// until ctrl-c.
pub async fn run_all(config: Config) -> Result<()> {
    let app = App::build(config).await?;
    let report = store::sync_sources(app.store.as_ref(), &app.config).await?;
    info!(
        sources = report.sources,
        channels = report.channels,
        rules = report.rules,
        "configuration synced"
    );

    let board = StatusBoard::new();
    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let scheduler = app.scheduler();
    let handle: StatusHandle = board.handle("scheduler");
    tasks.spawn(scheduler.run(handle, cancel.clone()));

    let classifier = app.classifier_worker();
    tasks.spawn(classifier.run(board.handle("classifier"), cancel.clone()));

    let llm = app.llm_worker();
    tasks.spawn(llm.run(board.handle("llm"), cancel.clone()));

    if app.config.power.enabled {
        let tick = Duration::from_secs(app.config.power.tick_secs.max(1));
        tasks.spawn(Arc::clone(&app.power).run_idle_monitor(tick, cancel.clone()));
    }

    let state = app.app_state(board);
    let bind = app.config.server.bind.clone();
    let server_cancel = cancel.clone();
    let mut server =
        tokio::spawn(async move { server::run_server(&bind, state, server_cancel).await });

    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown requested");
            None
        }
        finished = &mut server => Some(finished),
    };
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    match server_result {
        Some(finished) => finished??,
        None => server.await??,
    }
    println!("Stopped.");
    Ok(())
}
