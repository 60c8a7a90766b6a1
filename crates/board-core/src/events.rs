//! Change notification payloads broadcast to a user's open views.

use serde::{Deserialize, Serialize};

use crate::status::ThreadStatus;
use crate::types::{ChatId, ThreadId};

/// One mutation of a thread, as delivered to views over the per-user channel.
///
/// Every field except `thread_id` is optional; absent fields mean "unchanged".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEvent {
    pub thread_id: ThreadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_chat_id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_status_updated: Option<ThreadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_thread_archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_thread_backlog: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_thread_created: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_thread_deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_updated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_automation_id: Option<String>,
}

impl ThreadEvent {
    pub fn for_thread(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            ..Self::default()
        }
    }

    pub fn status_changed(
        thread_id: ThreadId,
        chat_id: Option<ChatId>,
        combined: ThreadStatus,
    ) -> Self {
        Self {
            thread_chat_id: chat_id,
            thread_status_updated: Some(combined),
            ..Self::for_thread(thread_id)
        }
    }

    pub fn created(thread_id: ThreadId, archived: bool, automation_id: Option<String>) -> Self {
        Self {
            is_thread_created: Some(true),
            is_thread_archived: Some(archived),
            thread_automation_id: automation_id,
            ..Self::for_thread(thread_id)
        }
    }

    pub fn archived(thread_id: ThreadId, archived: bool, automation_id: Option<String>) -> Self {
        Self {
            is_thread_archived: Some(archived),
            thread_automation_id: automation_id,
            ..Self::for_thread(thread_id)
        }
    }

    pub fn backlog(thread_id: ThreadId, is_backlog: bool, automation_id: Option<String>) -> Self {
        Self {
            is_thread_backlog: Some(is_backlog),
            thread_automation_id: automation_id,
            ..Self::for_thread(thread_id)
        }
    }

    pub fn deleted(thread_id: ThreadId) -> Self {
        Self {
            is_thread_deleted: Some(true),
            ..Self::for_thread(thread_id)
        }
    }

    pub fn messages(thread_id: ThreadId, chat_id: Option<ChatId>) -> Self {
        Self {
            thread_chat_id: chat_id,
            messages_updated: Some(true),
            ..Self::for_thread(thread_id)
        }
    }

    /// A chat content append that does not move the thread's status.
    pub fn is_message_only(&self) -> bool {
        self.messages_updated == Some(true) && self.thread_status_updated.is_none()
    }
}
