//! Storage seam used by the transition guard and the queue scanner.

use board_core::status::ThreadStatus;
use board_core::types::{ChatId, ThreadId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::PersistenceError;

/// Which row holds an attempt's status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptRef {
    /// The thread row itself, only valid while the thread has version 0.
    Legacy { thread_id: ThreadId },
    Chat {
        thread_id: ThreadId,
        chat_id: ChatId,
    },
}

impl AttemptRef {
    pub fn new(thread_id: ThreadId, chat_id: Option<ChatId>) -> Self {
        match chat_id {
            Some(chat_id) => Self::Chat { thread_id, chat_id },
            None => Self::Legacy { thread_id },
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        match self {
            Self::Legacy { thread_id } | Self::Chat { thread_id, .. } => thread_id,
        }
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Self::Legacy { .. } => None,
            Self::Chat { chat_id, .. } => Some(chat_id),
        }
    }
}

/// What to do with `reattempt_at` alongside a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReattemptUpdate {
    Keep,
    Clear,
    Set(DateTime<Utc>),
}

impl ReattemptUpdate {
    /// Non rate-limited targets always clear the field. Rate-limited targets
    /// write a supplied value and otherwise keep the stored one.
    pub fn for_target(to: ThreadStatus, supplied: Option<DateTime<Utc>>) -> Self {
        if !to.is_rate_limited() {
            return Self::Clear;
        }
        match supplied {
            Some(at) => Self::Set(at),
            None => Self::Keep,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub attempt: AttemptRef,
    pub from: ThreadStatus,
    pub to: ThreadStatus,
    pub reattempt: ReattemptUpdate,
    pub at: DateTime<Utc>,
}

/// A queued attempt as returned by [`AttemptStore::scan_queued`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCandidate {
    pub attempt: AttemptRef,
    pub status: ThreadStatus,
    pub reattempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueueCandidate {
    pub fn thread_id(&self) -> &ThreadId {
        self.attempt.thread_id()
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        self.attempt.chat_id()
    }
}

pub trait AttemptStore {
    /// Write `update.to` only if the attempt is owned by `update.user_id` and
    /// still has status `update.from`. Returns whether a row changed.
    fn compare_and_set_status(&self, update: &StatusUpdate) -> Result<bool, PersistenceError>;

    /// Queued attempts of `user_id` whose status is in `statuses`, oldest
    /// first. Archived and backlog threads are skipped.
    fn scan_queued(
        &self,
        user_id: &UserId,
        statuses: &[ThreadStatus],
    ) -> Result<Vec<QueueCandidate>, PersistenceError>;

    /// Statuses of every attempt of the thread, or `None` when the thread is
    /// gone or owned by someone else.
    fn attempt_statuses_for_thread(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
    ) -> Result<Option<Vec<ThreadStatus>>, PersistenceError>;
}
