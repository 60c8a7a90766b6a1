use std::sync::Arc;

use board_core::config::{NotifyConfig, PublisherKind};
use board_core::events::ThreadEvent;
use board_core::types::UserId;
use tracing::{info, warn};

use crate::error::NotifyError;
use crate::hub::BroadcastHub;

/// Delivery side of the change notification channel.
pub trait ChangePublisher: Send + Sync {
    fn kind(&self) -> PublisherKind;
    fn publish(&self, user_id: &UserId, event: &ThreadEvent) -> Result<(), NotifyError>;
}

/// Writes one structured log line per change.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

impl ChangePublisher for LogPublisher {
    fn kind(&self) -> PublisherKind {
        PublisherKind::Log
    }

    fn publish(&self, user_id: &UserId, event: &ThreadEvent) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(event).map_err(|e| NotifyError::PublishFailed {
            message: format!("failed to encode thread event: {e}"),
        })?;
        info!(
            user = %user_id,
            thread = %event.thread_id,
            payload = %payload,
            "thread changed"
        );
        Ok(())
    }
}

impl ChangePublisher for BroadcastHub {
    fn kind(&self) -> PublisherKind {
        PublisherKind::Broadcast
    }

    fn publish(&self, user_id: &UserId, event: &ThreadEvent) -> Result<(), NotifyError> {
        self.send(user_id, event.clone());
        Ok(())
    }
}

/// Fans a change out to every enabled publisher.
#[derive(Clone, Default)]
pub struct ChangeDispatcher {
    publishers: Vec<Arc<dyn ChangePublisher>>,
}

impl std::fmt::Debug for ChangeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds = self.kinds();
        f.debug_struct("ChangeDispatcher")
            .field("publishers", &kinds)
            .finish()
    }
}

impl ChangeDispatcher {
    pub fn new(publishers: Vec<Arc<dyn ChangePublisher>>) -> Self {
        Self { publishers }
    }

    /// Build the publishers named in `config`, sharing `hub` for broadcast.
    pub fn from_config(config: &NotifyConfig, hub: &BroadcastHub) -> Self {
        let mut publishers: Vec<Arc<dyn ChangePublisher>> = Vec::new();
        for kind in &config.enabled_sinks {
            if publishers.iter().any(|existing| existing.kind() == *kind) {
                continue;
            }
            match kind {
                PublisherKind::Broadcast => publishers.push(Arc::new(hub.clone())),
                PublisherKind::Log => publishers.push(Arc::new(LogPublisher)),
            }
        }
        Self { publishers }
    }

    pub fn kinds(&self) -> Vec<PublisherKind> {
        self.publishers.iter().map(|p| p.kind()).collect()
    }

    pub fn dispatch(
        &self,
        user_id: &UserId,
        event: &ThreadEvent,
    ) -> Vec<(PublisherKind, Result<(), NotifyError>)> {
        self.publishers
            .iter()
            .map(|publisher| (publisher.kind(), publisher.publish(user_id, event)))
            .collect()
    }

    /// Dispatch and log failures. Returns how many publishers accepted the event.
    ///
    /// Callers publish after their write committed, so a failed delivery must
    /// not be reported as a failed mutation.
    pub fn publish_logged(&self, user_id: &UserId, event: &ThreadEvent) -> usize {
        let mut delivered = 0;
        for (kind, result) in self.dispatch(user_id, event) {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    user = %user_id,
                    thread = %event.thread_id,
                    publisher = ?kind,
                    error = %err,
                    "failed to publish thread change"
                ),
            }
        }
        delivered
    }
}
