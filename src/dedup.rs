//! Semantic duplicate lookup shared by the pipeline and the classifier worker.
//!
//! The similarity index may return ids that are themselves duplicates, that
//! were removed by retention, or (for the backlog worker) the item being
//! checked. Every match is resolved to its primary before it is used, which
//! keeps `similar_to_id` one hop deep.

use anyhow::Result;
use tracing::debug;

use crate::classification::ClassificationBackend;
use crate::error::BackendError;
use crate::store::Store;

#[derive(Debug)]
pub enum DedupCheck {
    /// No match at or above the threshold.
    Unique,
    /// Link to this primary item.
    Duplicate { primary_id: String, score: f64 },
    /// The backend could not answer; leave the item unchecked.
    Deferred(BackendError),
}

/// Find the primary `title`/`content` duplicates, if any.
///
/// `self_id` is the id of an already-stored item being re-checked; matches
/// that resolve to it are ignored. Storage errors propagate, backend errors
/// come back as [`DedupCheck::Deferred`].
pub async fn check_duplicate(
    store: &dyn Store,
    backend: &dyn ClassificationBackend,
    title: &str,
    content: &str,
    threshold: f64,
    self_id: Option<&str>,
) -> Result<DedupCheck> {
    let matches = match backend.find_duplicates(title, content, threshold).await {
        Ok(m) => m,
        Err(e) => return Ok(DedupCheck::Deferred(e)),
    };

    for candidate in matches {
        if candidate.score < threshold {
            // Sorted by descending score; nothing further can qualify.
            break;
        }
        if Some(candidate.id.as_str()) == self_id {
            continue;
        }
        let Some(primary_id) = store.resolve_primary(&candidate.id).await? else {
            debug!(candidate = %candidate.id, "similarity match no longer in storage");
            continue;
        };
        if Some(primary_id.as_str()) == self_id {
            continue;
        }
        return Ok(DedupCheck::Duplicate {
            primary_id,
            score: candidate.score,
        });
    }

    Ok(DedupCheck::Unique)
}
