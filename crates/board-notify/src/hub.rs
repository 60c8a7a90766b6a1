//! Per-user in-process broadcast channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use board_core::events::ThreadEvent;
use board_core::types::UserId;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::ChangeEnvelope;

#[derive(Debug)]
struct HubInner {
    capacity: usize,
    channels: Mutex<HashMap<UserId, broadcast::Sender<ChangeEnvelope>>>,
}

/// Routes thread events to the open views of the user that owns them.
///
/// Delivery is best effort: events for a user with no subscribers are
/// dropped, and slow subscribers observe a lag instead of blocking publishers.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<UserId, broadcast::Sender<ChangeEnvelope>>> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, user_id: &UserId) -> broadcast::Receiver<ChangeEnvelope> {
        let mut channels = self.channels();
        channels
            .entry(user_id.clone())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    /// Send `event` to `user_id`'s views. Returns the number of receivers.
    pub fn send(&self, user_id: &UserId, event: ThreadEvent) -> usize {
        let mut channels = self.channels();
        let Some(sender) = channels.get(user_id) else {
            return 0;
        };

        match sender.send(ChangeEnvelope::new(user_id.clone(), event)) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(user = %user_id, "dropping change channel without subscribers");
                channels.remove(user_id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, user_id: &UserId) -> usize {
        self.channels()
            .get(user_id)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}
