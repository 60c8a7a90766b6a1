//! Threads, execution attempts and the identifiers that tie them together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{combined_status, ThreadStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ThreadId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChatId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Execution fields carried on the thread row itself. Only authoritative
/// while the thread is at version 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyExecution {
    pub status: ThreadStatus,
    pub error_message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub reattempt_at: Option<DateTime<Utc>>,
}

impl LegacyExecution {
    pub fn new(status: ThreadStatus) -> Self {
        Self {
            status,
            error_message: None,
            scheduled_at: None,
            reattempt_at: None,
        }
    }
}

/// One user-facing work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub user_id: UserId,
    pub repo_full_name: String,
    pub pr_number: Option<u64>,
    pub automation_id: Option<String>,
    pub archived: bool,
    pub is_backlog: bool,
    /// 0 for a legacy single-attempt thread, >0 once chat rows exist.
    pub version: u32,
    pub legacy: LegacyExecution,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(
        id: ThreadId,
        user_id: UserId,
        repo_full_name: impl Into<String>,
        status: ThreadStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            repo_full_name: repo_full_name.into(),
            pr_number: None,
            automation_id: None,
            archived: false,
            is_backlog: false,
            version: 0,
            legacy: LegacyExecution::new(status),
            created_at: at,
            updated_at: at,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.version == 0
    }

    /// Uniform attempt list for this thread.
    ///
    /// Legacy threads expose their own row as the single attempt and ignore
    /// `chats`; versioned threads expose only their chats.
    pub fn attempts<'a>(&'a self, chats: &'a [ThreadChat]) -> Vec<Attempt<'a>> {
        if self.is_legacy() {
            vec![Attempt::Legacy(self)]
        } else {
            chats
                .iter()
                .filter(|chat| chat.thread_id == self.id)
                .map(Attempt::Chat)
                .collect()
        }
    }

    pub fn combined_status(&self, chats: &[ThreadChat]) -> ThreadStatus {
        resolve_combined_status(&self.attempts(chats))
    }
}

/// One execution session of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadChat {
    pub id: ChatId,
    pub user_id: UserId,
    pub thread_id: ThreadId,
    pub status: ThreadStatus,
    pub error_message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub reattempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadChat {
    pub fn new(
        id: ChatId,
        thread: &Thread,
        status: ThreadStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id: thread.user_id.clone(),
            thread_id: thread.id.clone(),
            status,
            error_message: None,
            scheduled_at: None,
            reattempt_at: None,
            created_at: at,
            updated_at: at,
        }
    }
}

/// An execution attempt regardless of which row stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt<'a> {
    Legacy(&'a Thread),
    Chat(&'a ThreadChat),
}

impl Attempt<'_> {
    pub fn status(&self) -> ThreadStatus {
        match self {
            Attempt::Legacy(thread) => thread.legacy.status,
            Attempt::Chat(chat) => chat.status,
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        match self {
            Attempt::Legacy(thread) => &thread.id,
            Attempt::Chat(chat) => &chat.thread_id,
        }
    }

    /// `None` for the implicit attempt of a legacy thread.
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Attempt::Legacy(_) => None,
            Attempt::Chat(chat) => Some(&chat.id),
        }
    }

    pub fn reattempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Attempt::Legacy(thread) => thread.legacy.reattempt_at,
            Attempt::Chat(chat) => chat.reattempt_at,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Attempt::Legacy(thread) => thread.created_at,
            Attempt::Chat(chat) => chat.created_at,
        }
    }
}

pub fn resolve_combined_status(attempts: &[Attempt<'_>]) -> ThreadStatus {
    let statuses = attempts.iter().map(Attempt::status).collect::<Vec<_>>();
    combined_status(&statuses)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksStatus {
    Pending,
    Passing,
    Failing,
}

/// What the board knows about the pull request attached to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    pub state: PullRequestState,
    pub checks: Option<ChecksStatus>,
}

impl PullRequestSnapshot {
    pub fn is_open(&self) -> bool {
        self.state == PullRequestState::Open
    }

    pub fn is_merged(&self) -> bool {
        self.state == PullRequestState::Merged
    }

    pub fn checks_failing(&self) -> bool {
        self.checks == Some(ChecksStatus::Failing)
    }
}
