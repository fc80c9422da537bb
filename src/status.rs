//! In-process run status for the scheduler and worker loops.
//!
//! Status lives in process memory behind an `Arc<RwLock<_>>`, which is only
//! correct while a single sift instance runs against a database. Queue
//! depths are not kept here; they are always read from storage.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub started_at: Option<i64>,
    pub last_activity: Option<i64>,
    pub processed: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

/// Shared status board keyed by loop name (`scheduler`, `classifier`, `llm`).
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<BTreeMap<String, WorkerStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, name: &str) -> StatusHandle {
        StatusHandle {
            board: self.clone(),
            name: name.to_string(),
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, WorkerStatus> {
        self.inner.read().await.clone()
    }

    async fn update(&self, name: &str, f: impl FnOnce(&mut WorkerStatus)) {
        let mut map = self.inner.write().await;
        f(map.entry(name.to_string()).or_default());
    }
}

/// One loop's view of the board.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    board: StatusBoard,
    name: String,
}

impl StatusHandle {
    pub async fn started(&self) {
        self.board
            .update(&self.name, |s| {
                s.running = true;
                s.started_at = Some(Utc::now().timestamp());
            })
            .await;
    }

    pub async fn stopped(&self) {
        self.board.update(&self.name, |s| s.running = false).await;
    }

    pub async fn processed(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.board
            .update(&self.name, |s| {
                s.processed += count;
                s.last_activity = Some(Utc::now().timestamp());
            })
            .await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        let message = message.into();
        self.board
            .update(&self.name, |s| {
                s.errors += 1;
                s.last_error = Some(message);
            })
            .await;
    }
}
