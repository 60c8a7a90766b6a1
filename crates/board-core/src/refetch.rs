//! Decide whether a view's cached thread list is stale after a broadcast.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::events::ThreadEvent;
use crate::types::ThreadId;

/// Filters of the list a view currently shows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewFilter {
    pub archived: bool,
    #[serde(default)]
    pub automation_id: Option<String>,
}

impl ViewFilter {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn archived() -> Self {
        Self {
            archived: true,
            automation_id: None,
        }
    }

    pub fn with_automation(mut self, automation_id: impl Into<String>) -> Self {
        self.automation_id = Some(automation_id.into());
        self
    }
}

/// Returns true when `event` may change what the view shows.
///
/// Known threads refetch on everything except a pure message append. Unknown
/// threads refetch only when they could be entering the visible set.
pub fn should_refetch(
    thread_id: &ThreadId,
    event: &ThreadEvent,
    known: &HashSet<ThreadId>,
    filter: &ViewFilter,
) -> bool {
    if known.contains(thread_id) {
        return !event.is_message_only();
    }

    if let Some(wanted) = filter.automation_id.as_deref() {
        if event.thread_automation_id.as_deref() != Some(wanted) {
            return false;
        }
    }

    if event.is_thread_archived == Some(filter.archived) {
        return true;
    }
    if event.is_thread_created == Some(true) {
        return true;
    }
    event.is_thread_backlog.is_some()
}
