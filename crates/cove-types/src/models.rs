use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend-assigned message id. Provisional (unconfirmed) local messages
/// use negative ids that are never reused.
pub type MessageId = i64;
pub type ChannelId = i64;
pub type FileId = i64;
pub type UserId = Uuid;

/// The conversation whose events are currently subscribed to: a channel
/// or a direct-message peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ConversationScope {
    Channel(ChannelId),
    Direct(UserId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub body: String,
    pub author_id: UserId,
    pub author_username: String,
    /// Set on channel messages; mutually exclusive with `receiver_id`.
    pub channel_id: Option<ChannelId>,
    /// Set on direct messages; mutually exclusive with `channel_id`.
    pub receiver_id: Option<UserId>,
    /// Thread reference: the message this one replies to, if any.
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
    /// Client-generated correlation nonce, echoed back on the committed
    /// row so the sender can replace its provisional copy.
    #[serde(default)]
    pub nonce: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_provisional(&self) -> bool {
        self.id < 0
    }

    /// The scope this message belongs to, seen from `viewer`'s side of
    /// the conversation. `None` if the row is malformed (both or neither
    /// scope column set).
    pub fn scope_for(&self, viewer: UserId) -> Option<ConversationScope> {
        match (self.channel_id, self.receiver_id) {
            (Some(channel), None) => Some(ConversationScope::Channel(channel)),
            (None, Some(receiver)) => {
                let peer = if self.author_id == viewer {
                    receiver
                } else {
                    self.author_id
                };
                Some(ConversationScope::Direct(peer))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: FileId,
    pub message_id: MessageId,
    pub name: String,
    pub url: String,
}

/// One user's reaction to one message. Identity is the full triple:
/// a user may react with a given emoji to a given message at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub emoji: String,
    pub user_id: UserId,
}

/// A user came online or went offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    pub username: String,
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(author: UserId, channel: Option<ChannelId>, receiver: Option<UserId>) -> Message {
        Message {
            id: 1,
            body: "hey".into(),
            author_id: author,
            author_username: "author".into(),
            channel_id: channel,
            receiver_id: receiver,
            parent_id: None,
            files: vec![],
            nonce: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_channel_scope() {
        let viewer = Uuid::new_v4();
        let msg = message(Uuid::new_v4(), Some(7), None);
        assert_eq!(msg.scope_for(viewer), Some(ConversationScope::Channel(7)));
    }

    #[test]
    fn test_direct_scope_is_the_peer_from_either_side() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();

        // I sent it: the scope peer is the receiver
        let outgoing = message(me, None, Some(peer));
        assert_eq!(outgoing.scope_for(me), Some(ConversationScope::Direct(peer)));

        // They sent it: the scope peer is the author
        let incoming = message(peer, None, Some(me));
        assert_eq!(incoming.scope_for(me), Some(ConversationScope::Direct(peer)));
    }

    #[test]
    fn test_malformed_scope_columns() {
        let viewer = Uuid::new_v4();
        assert_eq!(message(viewer, Some(1), Some(viewer)).scope_for(viewer), None);
        assert_eq!(message(viewer, None, None).scope_for(viewer), None);
    }
}
