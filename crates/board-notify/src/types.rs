use board_core::events::ThreadEvent;
use board_core::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A thread event stamped with its publish time and the user it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub at: DateTime<Utc>,
    pub user_id: UserId,
    pub event: ThreadEvent,
}

impl ChangeEnvelope {
    pub fn new(user_id: UserId, event: ThreadEvent) -> Self {
        Self {
            at: Utc::now(),
            user_id,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use board_core::events::ThreadEvent;
    use board_core::status::ThreadStatus;
    use board_core::types::{ThreadId, UserId};

    use super::ChangeEnvelope;

    #[test]
    fn envelope_nests_event_in_its_wire_shape() {
        let envelope = ChangeEnvelope::new(
            UserId::new("U1"),
            ThreadEvent::status_changed(ThreadId::new("T1"), None, ThreadStatus::Booting),
        );
        let json = serde_json::to_value(&envelope).expect("serialize envelope");
        assert_eq!(json["user_id"], "U1");
        assert_eq!(json["event"]["threadId"], "T1");
        assert_eq!(json["event"]["threadStatusUpdated"], "booting");

        let decoded: ChangeEnvelope = serde_json::from_value(json).expect("deserialize envelope");
        assert_eq!(decoded, envelope);
    }
}
