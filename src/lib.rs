//! # Sift
//!
//! Feed ingestion with three-tier deduplication and two-stage classification.
//!
//! Channels are fetched on a schedule, normalized, checked against exact and
//! semantic duplicates, then scored by a fast classifier. Items the classifier
//! is unsure about are queued for deep analysis on a local inference host,
//! which is woken on demand and shut down again once idle.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────┐   ┌──────────┐
//! │ Scheduler │──▶│ Pipeline             │──▶│  SQLite  │
//! │ per-type  │   │ normalize → dedup →  │   │ items +  │
//! │ semaphores│   │ classify → persist   │   │ log      │
//! └───────────┘   └──────────────────────┘   └────┬─────┘
//!                                                 │
//!                  ┌──────────────────────────────┤
//!                  ▼                              ▼
//!          ┌──────────────────┐          ┌─────────────────┐
//!          │ Classifier worker│          │ LLM worker      │
//!          │ backlog queues   │          │ + power control │
//!          └──────────────────┘          └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`store`] | Storage trait and SQLite implementation |
//! | [`connector`] | Connector trait, registry, RSS/Atom connector |
//! | [`normalize`] | Text cleanup and content hashing |
//! | [`dedup`] | Semantic duplicate lookup |
//! | [`rules`] | Keyword, regex and category rules |
//! | [`classification`] | Fast classification backend |
//! | [`pipeline`] | Per-fetch processing |
//! | [`scheduler`] | Fetch scheduling |
//! | [`classifier_worker`] | Backlog catch-up |
//! | [`inference`] | Deep analysis backend |
//! | [`llm_worker`] | Deep analysis queue |
//! | [`power`] | Wake-on-LAN and idle shutdown |
//! | [`status`] | In-process worker status |
//! | [`server`] | Read-only HTTP status |
//! | [`app`] | Component wiring for the CLI |

pub mod app;
pub mod classification;
pub mod classifier_worker;
pub mod config;
pub mod connector;
pub mod db;
pub mod dedup;
pub mod error;
pub mod inference;
pub mod llm_worker;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod power;
pub mod rules;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod store;
