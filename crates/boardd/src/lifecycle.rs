//! Guarded status transitions for thread attempts.

use board_core::events::ThreadEvent;
use board_core::status::{combined_status, ThreadStatus};
use board_core::types::{ChatId, ThreadId, UserId};
use board_notify::ChangeDispatcher;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::persistence::PersistenceError;
use crate::store::{AttemptRef, AttemptStore, ReattemptUpdate, StatusUpdate};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub user_id: UserId,
    pub thread_id: ThreadId,
    /// `None` targets the legacy thread row.
    pub chat_id: Option<ChatId>,
    pub from: ThreadStatus,
    pub to: ThreadStatus,
    pub reattempt_at: Option<DateTime<Utc>>,
}

impl TransitionRequest {
    pub fn new(
        user_id: UserId,
        thread_id: ThreadId,
        chat_id: Option<ChatId>,
        from: ThreadStatus,
        to: ThreadStatus,
    ) -> Self {
        Self {
            user_id,
            thread_id,
            chat_id,
            from,
            to,
            reattempt_at: None,
        }
    }

    pub fn with_reattempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.reattempt_at = Some(at);
        self
    }

    fn status_update(&self, at: DateTime<Utc>) -> StatusUpdate {
        StatusUpdate {
            user_id: self.user_id.clone(),
            attempt: AttemptRef::new(self.thread_id.clone(), self.chat_id.clone()),
            from: self.from,
            to: self.to,
            reattempt: ReattemptUpdate::for_target(self.to, self.reattempt_at),
            at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub applied: bool,
    /// Thread status after the write, present only when it applied.
    pub combined_status: Option<ThreadStatus>,
}

impl TransitionOutcome {
    pub fn skipped() -> Self {
        Self {
            applied: false,
            combined_status: None,
        }
    }
}

/// Move an attempt from `request.from` to `request.to` if nobody else got
/// there first.
///
/// A lost race, an unknown attempt and an attempt owned by another user all
/// report `applied = false`. When the write lands, the thread's combined
/// status is recomputed and published to the owner.
pub fn transition<S>(
    store: &S,
    publisher: &ChangeDispatcher,
    request: &TransitionRequest,
    at: DateTime<Utc>,
) -> Result<TransitionOutcome, LifecycleError>
where
    S: AttemptStore + ?Sized,
{
    let update = request.status_update(at);
    if !store.compare_and_set_status(&update)? {
        debug!(
            user = %request.user_id,
            thread = %request.thread_id,
            chat = ?request.chat_id,
            from = %request.from,
            to = %request.to,
            "transition not applied"
        );
        return Ok(TransitionOutcome::skipped());
    }

    let combined = store
        .attempt_statuses_for_thread(&request.user_id, &request.thread_id)?
        .map(|statuses| combined_status(&statuses));

    info!(
        user = %request.user_id,
        thread = %request.thread_id,
        chat = ?request.chat_id,
        from = %request.from,
        to = %request.to,
        "thread attempt transitioned"
    );

    if let Some(combined) = combined {
        let event = ThreadEvent::status_changed(
            request.thread_id.clone(),
            request.chat_id.clone(),
            combined,
        );
        publisher.publish_logged(&request.user_id, &event);
    }

    Ok(TransitionOutcome {
        applied: true,
        combined_status: combined,
    })
}
