use serde::{Deserialize, Serialize};

use crate::models::{FileAttachment, Message, MessageId, Presence, Reaction};

/// Row-level operation reported by the backend change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One changed row, tagged by source table. Delete payloads are only
/// trusted for their key fields; the rest of the row may be stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row")]
#[serde(rename_all = "snake_case")]
pub enum ChangeRow {
    Messages(Message),
    MessageReactions(Reaction),
    MessageFiles(FileAttachment),
    Presence(Presence),
}

/// Raw change delivered on a scope's feed. At-least-once, unordered
/// across entities; per-entity changes arrive in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub op: ChangeOp,
    pub row: ChangeRow,
}

/// Normalized domain events the feed adapter hands to the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    MessageDeleted { id: MessageId },
    ReactionAdded(Reaction),
    ReactionRemoved(Reaction),
    FileAttached(FileAttachment),
    PresenceChanged(Presence),
}

impl FeedEvent {
    /// The message this event refers to, if it is message-scoped.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::MessageInserted(m) | Self::MessageUpdated(m) => Some(m.id),
            Self::MessageDeleted { id } => Some(*id),
            Self::ReactionAdded(r) | Self::ReactionRemoved(r) => Some(r.message_id),
            Self::FileAttached(f) => Some(f.message_id),
            Self::PresenceChanged(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_event_wire_shape() {
        let event = FeedEvent::ReactionAdded(Reaction {
            message_id: 42,
            emoji: "👍".into(),
            user_id: Uuid::nil(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ReactionAdded");
        assert_eq!(json["data"]["message_id"], 42);
    }

    #[test]
    fn test_message_id_extraction() {
        let event = FeedEvent::MessageDeleted { id: 9 };
        assert_eq!(event.message_id(), Some(9));

        let presence = FeedEvent::PresenceChanged(Presence {
            user_id: Uuid::nil(),
            username: "u".into(),
            online: true,
        });
        assert_eq!(presence.message_id(), None);
    }
}
