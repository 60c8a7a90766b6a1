//! Queue eligibility and promotion.
//!
//! There is no queue structure: the queue is the set of attempts whose status
//! is one of the `queued-*` variants, ordered by creation time. Promotion is a
//! guarded transition back to plain `queued`, so concurrent dequeuers never
//! promote the same attempt twice.

use board_core::status::ThreadStatus;
use board_core::types::{ChatId, ThreadId, UserId};
use board_notify::ChangeDispatcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lifecycle::{transition, LifecycleError, TransitionRequest};
use crate::persistence::PersistenceError;
use crate::store::{AttemptStore, QueueCandidate};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Per-user limits in force at scan time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backpressure {
    pub concurrency_limit_reached: bool,
    pub sandbox_rate_limit_reached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeuedAttempt {
    pub thread_id: ThreadId,
    pub chat_id: Option<ChatId>,
    /// Status the attempt held before it was promoted.
    pub previous_status: ThreadStatus,
}

/// Statuses whose attempts may be promoted under `backpressure`.
pub fn eligible_statuses(backpressure: Backpressure) -> Vec<ThreadStatus> {
    let mut statuses = vec![ThreadStatus::QueuedAgentRateLimit];
    if !backpressure.sandbox_rate_limit_reached {
        statuses.push(ThreadStatus::QueuedSandboxCreationRateLimit);
    }
    if !backpressure.concurrency_limit_reached {
        statuses.push(ThreadStatus::QueuedTasksConcurrency);
    }
    statuses
}

fn reattempt_due(candidate: &QueueCandidate, now: DateTime<Utc>) -> bool {
    if candidate.status != ThreadStatus::QueuedAgentRateLimit {
        return true;
    }
    // A missing backoff deadline means the attempt may go right away.
    candidate.reattempt_at.map_or(true, |at| at <= now)
}

/// Attempts of `user_id` that may be promoted now, oldest first. Read only.
pub fn eligible<S>(
    store: &S,
    user_id: &UserId,
    backpressure: Backpressure,
    now: DateTime<Utc>,
) -> Result<Vec<QueueCandidate>, QueueError>
where
    S: AttemptStore + ?Sized,
{
    let statuses = eligible_statuses(backpressure);
    let candidates = store
        .scan_queued(user_id, &statuses)?
        .into_iter()
        .filter(|candidate| reattempt_due(candidate, now))
        .collect();
    Ok(candidates)
}

/// Promote the first candidate this caller wins, trying them in order.
///
/// Candidates taken by a concurrent dequeuer are skipped. Returns `None` when
/// every candidate was lost or the list is empty.
pub fn dequeue_one<S>(
    store: &S,
    publisher: &ChangeDispatcher,
    user_id: &UserId,
    candidates: &[QueueCandidate],
    now: DateTime<Utc>,
) -> Result<Option<DequeuedAttempt>, QueueError>
where
    S: AttemptStore + ?Sized,
{
    for candidate in candidates {
        let request = TransitionRequest::new(
            user_id.clone(),
            candidate.thread_id().clone(),
            candidate.chat_id().cloned(),
            candidate.status,
            ThreadStatus::Queued,
        );
        let outcome = transition(store, publisher, &request, now)?;
        if outcome.applied {
            return Ok(Some(DequeuedAttempt {
                thread_id: request.thread_id,
                chat_id: request.chat_id,
                previous_status: candidate.status,
            }));
        }
        debug!(
            user = %user_id,
            thread = %candidate.thread_id(),
            "queue candidate taken by another worker"
        );
    }
    Ok(None)
}
