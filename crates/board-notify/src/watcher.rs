//! Client-side half of the change channel: one watcher per open list view.

use std::collections::HashSet;

use board_core::events::ThreadEvent;
use board_core::refetch::{should_refetch, ViewFilter};
use board_core::types::{ThreadId, UserId};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::error::NotifyError;
use crate::hub::BroadcastHub;
use crate::types::ChangeEnvelope;

/// Why a view has to reload its list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefetchReason {
    Event(ThreadEvent),
    /// The view fell behind and missed this many events.
    Lagged(u64),
}

pub struct ViewWatcher {
    user_id: UserId,
    known: HashSet<ThreadId>,
    filter: ViewFilter,
    rx: broadcast::Receiver<ChangeEnvelope>,
}

impl ViewWatcher {
    pub fn subscribe(hub: &BroadcastHub, user_id: UserId, filter: ViewFilter) -> Self {
        let rx = hub.subscribe(&user_id);
        Self {
            user_id,
            known: HashSet::new(),
            filter,
            rx,
        }
    }

    pub fn filter(&self) -> &ViewFilter {
        &self.filter
    }

    pub fn known(&self) -> &HashSet<ThreadId> {
        &self.known
    }

    /// Replace the set of threads the view currently materializes, typically
    /// right after a refetch.
    pub fn replace_known(&mut self, ids: impl IntoIterator<Item = ThreadId>) {
        self.known = ids.into_iter().collect();
    }

    pub fn observe(&self, event: &ThreadEvent) -> bool {
        should_refetch(&event.thread_id, event, &self.known, &self.filter)
    }

    /// Drain everything already queued without waiting.
    pub fn drain(&mut self) -> Result<Option<RefetchReason>, NotifyError> {
        let mut reason = None;
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if reason.is_none() && self.observe(&envelope.event) {
                        reason = Some(RefetchReason::Event(envelope.event));
                    }
                }
                Err(TryRecvError::Lagged(missed)) => {
                    reason = Some(RefetchReason::Lagged(missed));
                }
                Err(TryRecvError::Empty) => return Ok(reason),
                Err(TryRecvError::Closed) => {
                    return match reason {
                        Some(reason) => Ok(Some(reason)),
                        None => Err(self.closed()),
                    }
                }
            }
        }
    }

    /// Wait until an event arrives that requires a refetch.
    pub async fn next_refetch(&mut self) -> Result<RefetchReason, NotifyError> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if self.observe(&envelope.event) {
                        return Ok(RefetchReason::Event(envelope.event));
                    }
                }
                Err(RecvError::Lagged(missed)) => return Ok(RefetchReason::Lagged(missed)),
                Err(RecvError::Closed) => return Err(self.closed()),
            }
        }
    }

    fn closed(&self) -> NotifyError {
        NotifyError::ChannelClosed {
            user: self.user_id.to_string(),
        }
    }
}
