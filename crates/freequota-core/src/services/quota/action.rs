//! Metered action helper
//!
//! Wraps one server-metered request in the charge / reconcile / undo dance:
//! block locally when exhausted, charge optimistically, then let the
//! server's answer decide the final count.

use std::future::Future;

use serde::{Deserialize, Serialize};

use super::provider::{QuotaError, QuotaSource};
use super::sync::QuotaSynchronizer;
use super::types::SyncOutcome;

/// What the action's response said about the count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "used")]
pub enum CountReport {
    /// The response carried the server's count (zero included)
    Authoritative(u32),
    /// The response had no usable count
    Unavailable,
}

/// Successful action result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse<T> {
    pub payload: T,
    pub count: CountReport,
}

impl<T> ActionResponse<T> {
    pub fn new(payload: T, count: CountReport) -> Self {
        Self { payload, count }
    }
}

#[derive(Debug)]
pub enum MeteredOutcome<T> {
    /// Exhausted locally; the action never ran
    Blocked,
    /// The action succeeded; `follow_up` is set when a sync ran afterwards
    Completed {
        payload: T,
        follow_up: Option<SyncOutcome>,
    },
    /// The server refused with a quota error
    Refused { used: Option<u32> },
    /// The action failed for another reason; the charge was rolled back
    Failed(QuotaError),
}

impl<T> MeteredOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, MeteredOutcome::Completed { .. })
    }
}

/// Run `action` as one metered unit against `sync`.
///
/// `follow_up` is only consulted when a successful response carried no
/// count.
pub async fn run_metered<T, F, Fut>(
    sync: &QuotaSynchronizer,
    follow_up: Option<&dyn QuotaSource>,
    action: F,
) -> MeteredOutcome<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ActionResponse<T>, QuotaError>>,
{
    if sync.is_exhausted() {
        log::info!(
            "[quota:sync] {} exhausted locally, action blocked",
            sync.resource_kind()
        );
        return MeteredOutcome::Blocked;
    }

    sync.increment_optimistic();

    match action().await {
        Ok(response) => {
            let follow_up = match response.count {
                CountReport::Authoritative(used) => {
                    sync.update_from_server(used);
                    None
                }
                CountReport::Unavailable => match follow_up {
                    Some(source) => Some(sync.sync_with(source).await),
                    None => None,
                },
            };
            MeteredOutcome::Completed {
                payload: response.payload,
                follow_up,
            }
        }
        Err(QuotaError::QuotaExceeded { used }) => {
            match used {
                Some(count) => {
                    sync.update_from_server(count);
                }
                None => sync.rollback(),
            }
            MeteredOutcome::Refused { used }
        }
        Err(e) => {
            log::warn!("[quota:sync] metered action failed, rolling back: {}", e);
            sync.rollback();
            MeteredOutcome::Failed(e)
        }
    }
}
