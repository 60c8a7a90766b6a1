//! Closed status vocabulary for thread execution attempts.
//!
//! Every attempt (a legacy thread row or a thread chat) carries exactly one
//! [`ThreadStatus`]. A thread with several attempts is summarised by
//! [`combined_status`], a max-by-priority reduction over [`STATUS_PRIORITY`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadStatus {
    /// Created but never submitted.
    Draft,
    /// Deferred start at a schedule time.
    Scheduled,
    /// Ready for a worker to pick up.
    Queued,
    /// Waiting for a free per-user concurrency slot.
    QueuedTasksConcurrency,
    /// Waiting for the sandbox creation rate limit to reopen.
    QueuedSandboxCreationRateLimit,
    /// Backing off after the agent provider rate limited us.
    QueuedAgentRateLimit,
    /// Blocked on something outside the queue.
    QueuedBlocked,
    Booting,
    Working,
    Stopping,
    Checkpointing,
    WorkingDone,
    WorkingError,
    WorkingStopped,
    Complete,
    Error,
    Stopped,
}

/// Most urgent first. The position of a status in this table is its rank.
pub const STATUS_PRIORITY: [ThreadStatus; 17] = [
    ThreadStatus::WorkingError,
    ThreadStatus::Error,
    ThreadStatus::Working,
    ThreadStatus::Booting,
    ThreadStatus::Stopping,
    ThreadStatus::Checkpointing,
    ThreadStatus::WorkingDone,
    ThreadStatus::Complete,
    ThreadStatus::Stopped,
    ThreadStatus::WorkingStopped,
    ThreadStatus::Queued,
    ThreadStatus::QueuedTasksConcurrency,
    ThreadStatus::QueuedSandboxCreationRateLimit,
    ThreadStatus::QueuedAgentRateLimit,
    ThreadStatus::QueuedBlocked,
    ThreadStatus::Scheduled,
    ThreadStatus::Draft,
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid thread status '{value}'")]
pub struct StatusParseError {
    pub value: String,
}

impl ThreadStatus {
    pub const ALL: [ThreadStatus; 17] = [
        ThreadStatus::Draft,
        ThreadStatus::Scheduled,
        ThreadStatus::Queued,
        ThreadStatus::QueuedTasksConcurrency,
        ThreadStatus::QueuedSandboxCreationRateLimit,
        ThreadStatus::QueuedAgentRateLimit,
        ThreadStatus::QueuedBlocked,
        ThreadStatus::Booting,
        ThreadStatus::Working,
        ThreadStatus::Stopping,
        ThreadStatus::Checkpointing,
        ThreadStatus::WorkingDone,
        ThreadStatus::WorkingError,
        ThreadStatus::WorkingStopped,
        ThreadStatus::Complete,
        ThreadStatus::Error,
        ThreadStatus::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Draft => "draft",
            ThreadStatus::Scheduled => "scheduled",
            ThreadStatus::Queued => "queued",
            ThreadStatus::QueuedTasksConcurrency => "queued-tasks-concurrency",
            ThreadStatus::QueuedSandboxCreationRateLimit => "queued-sandbox-creation-rate-limit",
            ThreadStatus::QueuedAgentRateLimit => "queued-agent-rate-limit",
            ThreadStatus::QueuedBlocked => "queued-blocked",
            ThreadStatus::Booting => "booting",
            ThreadStatus::Working => "working",
            ThreadStatus::Stopping => "stopping",
            ThreadStatus::Checkpointing => "checkpointing",
            ThreadStatus::WorkingDone => "working-done",
            ThreadStatus::WorkingError => "working-error",
            ThreadStatus::WorkingStopped => "working-stopped",
            ThreadStatus::Complete => "complete",
            ThreadStatus::Error => "error",
            ThreadStatus::Stopped => "stopped",
        }
    }

    /// Position in [`STATUS_PRIORITY`]; lower is more urgent.
    pub fn priority_rank(self) -> usize {
        STATUS_PRIORITY
            .iter()
            .position(|status| *status == self)
            .unwrap_or(STATUS_PRIORITY.len())
    }

    /// Statuses whose reattempt-after timestamp is meaningful.
    pub fn is_rate_limited(self) -> bool {
        matches!(
            self,
            ThreadStatus::QueuedSandboxCreationRateLimit | ThreadStatus::QueuedAgentRateLimit
        )
    }

    pub fn is_queued(self) -> bool {
        matches!(
            self,
            ThreadStatus::Queued
                | ThreadStatus::QueuedTasksConcurrency
                | ThreadStatus::QueuedSandboxCreationRateLimit
                | ThreadStatus::QueuedAgentRateLimit
                | ThreadStatus::QueuedBlocked
        )
    }

    /// Attempts that hold a sandbox and count against the concurrency cap.
    pub fn occupies_slot(self) -> bool {
        matches!(
            self,
            ThreadStatus::Booting
                | ThreadStatus::Working
                | ThreadStatus::Stopping
                | ThreadStatus::Checkpointing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ThreadStatus::Complete | ThreadStatus::Error | ThreadStatus::Stopped
        )
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = StatusParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim();
        ThreadStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == needle)
            .ok_or_else(|| StatusParseError {
                value: value.to_string(),
            })
    }
}

/// Reduce the statuses of all attempts of one thread to a single status.
///
/// An empty list means the thread has no attempt yet and reads as `queued`.
pub fn combined_status(statuses: &[ThreadStatus]) -> ThreadStatus {
    let Some(first) = statuses.first() else {
        return ThreadStatus::Queued;
    };

    STATUS_PRIORITY
        .iter()
        .copied()
        .find(|candidate| statuses.contains(candidate))
        .unwrap_or(*first)
}
