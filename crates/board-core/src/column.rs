//! Board column projection.

use serde::{Deserialize, Serialize};

use crate::status::ThreadStatus;
use crate::types::PullRequestSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardColumn {
    Backlog,
    InProgress,
    InReview,
    Done,
    Cancelled,
}

impl BoardColumn {
    pub const ALL: [BoardColumn; 5] = [
        BoardColumn::Backlog,
        BoardColumn::InProgress,
        BoardColumn::InReview,
        BoardColumn::Done,
        BoardColumn::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BoardColumn::Backlog => "backlog",
            BoardColumn::InProgress => "in_progress",
            BoardColumn::InReview => "in_review",
            BoardColumn::Done => "done",
            BoardColumn::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BoardColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a thread's combined status and pull request state to a column.
///
/// The backlog flag wins over everything. A complete thread stays in review
/// while its pull request is open or its checks are failing, unless it merged.
pub fn project_column(
    status: ThreadStatus,
    is_backlog: bool,
    pr: Option<&PullRequestSnapshot>,
) -> BoardColumn {
    if is_backlog {
        return BoardColumn::Backlog;
    }

    match status {
        ThreadStatus::Error | ThreadStatus::WorkingError => BoardColumn::Cancelled,
        ThreadStatus::Stopped | ThreadStatus::WorkingStopped => BoardColumn::Cancelled,
        ThreadStatus::Draft
        | ThreadStatus::Scheduled
        | ThreadStatus::Queued
        | ThreadStatus::QueuedTasksConcurrency
        | ThreadStatus::QueuedSandboxCreationRateLimit
        | ThreadStatus::QueuedAgentRateLimit
        | ThreadStatus::QueuedBlocked => BoardColumn::Backlog,
        ThreadStatus::Booting
        | ThreadStatus::Working
        | ThreadStatus::Stopping
        | ThreadStatus::Checkpointing
        | ThreadStatus::WorkingDone => BoardColumn::InProgress,
        ThreadStatus::Complete => match pr {
            Some(pr) if pr.is_merged() => BoardColumn::Done,
            Some(pr) if pr.is_open() || pr.checks_failing() => BoardColumn::InReview,
            _ => BoardColumn::Done,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChecksStatus, PullRequestState};

    fn pr(state: PullRequestState, checks: Option<ChecksStatus>) -> PullRequestSnapshot {
        PullRequestSnapshot { state, checks }
    }

    #[test]
    fn backlog_flag_overrides_active_status() {
        assert_eq!(
            project_column(ThreadStatus::Working, true, None),
            BoardColumn::Backlog
        );
        let open = pr(PullRequestState::Open, None);
        assert_eq!(
            project_column(ThreadStatus::Complete, true, Some(&open)),
            BoardColumn::Backlog
        );
    }

    #[test]
    fn complete_without_pull_request_is_done() {
        assert_eq!(
            project_column(ThreadStatus::Complete, false, None),
            BoardColumn::Done
        );
    }

    #[test]
    fn complete_with_open_pull_request_is_in_review() {
        let open = pr(PullRequestState::Open, Some(ChecksStatus::Passing));
        assert_eq!(
            project_column(ThreadStatus::Complete, false, Some(&open)),
            BoardColumn::InReview
        );
    }

    #[test]
    fn merged_pull_request_is_done_even_with_failing_checks() {
        let merged = pr(PullRequestState::Merged, Some(ChecksStatus::Failing));
        assert_eq!(
            project_column(ThreadStatus::Complete, false, Some(&merged)),
            BoardColumn::Done
        );
    }

    #[test]
    fn closed_pull_request_with_failing_checks_stays_in_review() {
        let closed = pr(PullRequestState::Closed, Some(ChecksStatus::Failing));
        assert_eq!(
            project_column(ThreadStatus::Complete, false, Some(&closed)),
            BoardColumn::InReview
        );

        let passing = pr(PullRequestState::Closed, Some(ChecksStatus::Passing));
        assert_eq!(
            project_column(ThreadStatus::Complete, false, Some(&passing)),
            BoardColumn::Done
        );
    }

    #[test]
    fn failures_and_stops_are_cancelled() {
        for status in [
            ThreadStatus::Error,
            ThreadStatus::WorkingError,
            ThreadStatus::Stopped,
            ThreadStatus::WorkingStopped,
        ] {
            assert_eq!(project_column(status, false, None), BoardColumn::Cancelled);
        }
    }

    #[test]
    fn queued_family_lands_in_backlog_and_active_in_progress() {
        for status in ThreadStatus::ALL {
            let column = project_column(status, false, None);
            if status.is_queued() || matches!(status, ThreadStatus::Draft | ThreadStatus::Scheduled)
            {
                assert_eq!(column, BoardColumn::Backlog, "{status}");
            }
            if status.occupies_slot() || status == ThreadStatus::WorkingDone {
                assert_eq!(column, BoardColumn::InProgress, "{status}");
            }
        }
    }

    #[test]
    fn projection_is_total_over_documented_domains() {
        let states = [
            None,
            Some(PullRequestState::Open),
            Some(PullRequestState::Closed),
            Some(PullRequestState::Merged),
        ];
        let checks = [
            None,
            Some(ChecksStatus::Pending),
            Some(ChecksStatus::Passing),
            Some(ChecksStatus::Failing),
        ];
        for status in ThreadStatus::ALL {
            for is_backlog in [false, true] {
                for state in states {
                    for check in checks {
                        let snapshot = state.map(|state| pr(state, check));
                        let column = project_column(status, is_backlog, snapshot.as_ref());
                        assert!(BoardColumn::ALL.contains(&column));
                    }
                }
            }
        }
    }

    #[test]
    fn columns_serialize_in_snake_case() {
        assert_eq!(
            serde_json::to_string(&BoardColumn::InProgress).expect("serialize column"),
            "\"in_progress\""
        );
        assert_eq!(BoardColumn::InReview.to_string(), "in_review");
    }
}
