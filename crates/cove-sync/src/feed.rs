//! Event feed adapter: keeps one live subscription per active scope,
//! normalizes raw table changes into [`FeedEvent`]s, and reconnects
//! with exponential backoff when the transport drops. While
//! disconnected it never fabricates events; missed events are healed by
//! the reconciler's upsert semantics.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cove_types::events::{ChangeOp, ChangeRow, FeedEvent, TableChange};
use cove_types::models::ConversationScope;

use crate::backend::{ChatBackend, ScopeFeed};
use crate::coordinator::CoordinatorInner;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// First reconnect delay after a transport drop.
    pub initial_backoff: Duration,
    /// Backoff ceiling; doubling stops here.
    pub max_backoff: Duration,
    /// Most recent messages fetched when a scope activates.
    pub seed_limit: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(15),
            seed_limit: 100,
        }
    }
}

/// Map one raw table change onto its normalized event. Changes with no
/// domain counterpart (file deletes, reaction updates) are dropped.
pub fn normalize(change: TableChange) -> Option<FeedEvent> {
    match (change.op, change.row) {
        (ChangeOp::Insert, ChangeRow::Messages(m)) => Some(FeedEvent::MessageInserted(m)),
        (ChangeOp::Update, ChangeRow::Messages(m)) => Some(FeedEvent::MessageUpdated(m)),
        (ChangeOp::Delete, ChangeRow::Messages(m)) => Some(FeedEvent::MessageDeleted { id: m.id }),
        (ChangeOp::Insert, ChangeRow::MessageReactions(r)) => Some(FeedEvent::ReactionAdded(r)),
        (ChangeOp::Delete, ChangeRow::MessageReactions(r)) => Some(FeedEvent::ReactionRemoved(r)),
        (ChangeOp::Insert, ChangeRow::MessageFiles(f)) => Some(FeedEvent::FileAttached(f)),
        (_, ChangeRow::Presence(p)) => Some(FeedEvent::PresenceChanged(p)),
        (op, row) => {
            debug!(?op, ?row, "feed change with no normalized form dropped");
            None
        }
    }
}

/// Subscription loop for one scope activation. Runs until cancelled by
/// the next scope switch; every applied event carries `epoch` so the
/// coordinator can discard late arrivals for a dead scope.
pub(crate) async fn run_feed<B: ChatBackend>(
    inner: Arc<CoordinatorInner<B>>,
    scope: ConversationScope,
    epoch: u64,
    cancel: CancellationToken,
    mut initial: Option<ScopeFeed>,
) {
    let mut delay = inner.config.initial_backoff;
    loop {
        let subscribed = match initial.take() {
            Some(feed) => Ok(feed),
            None => inner.backend.subscribe(scope),
        };
        match subscribed {
            Ok(mut feed) => {
                inner.set_connected(epoch, true);
                delay = inner.config.initial_backoff;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(?scope, epoch, "feed cancelled");
                            return;
                        }
                        change = feed.changes.recv() => match change {
                            Some(change) => {
                                if let Some(event) = normalize(change) {
                                    inner.apply(epoch, event).await;
                                }
                            }
                            None => break,
                        }
                    }
                }

                inner.set_connected(epoch, false);
                warn!(?scope, "feed transport dropped; reconnecting in {:?}", delay);
            }
            Err(err) => {
                inner.set_connected(epoch, false);
                warn!(?scope, "feed subscribe failed: {}; retrying in {:?}", err, delay);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(inner.config.max_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cove_types::models::{FileAttachment, Message, Presence, Reaction};
    use uuid::Uuid;

    fn message(id: i64) -> Message {
        Message {
            id,
            body: "hi".into(),
            author_id: Uuid::nil(),
            author_username: "alice".into(),
            channel_id: Some(1),
            receiver_id: None,
            parent_id: None,
            files: vec![],
            nonce: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_message_changes_normalize() {
        let insert = TableChange { op: ChangeOp::Insert, row: ChangeRow::Messages(message(1)) };
        assert!(matches!(normalize(insert), Some(FeedEvent::MessageInserted(m)) if m.id == 1));

        let delete = TableChange { op: ChangeOp::Delete, row: ChangeRow::Messages(message(1)) };
        assert!(matches!(normalize(delete), Some(FeedEvent::MessageDeleted { id: 1 })));
    }

    #[test]
    fn test_reaction_changes_normalize() {
        let row = Reaction { message_id: 1, emoji: "👍".into(), user_id: Uuid::nil() };

        let add = TableChange { op: ChangeOp::Insert, row: ChangeRow::MessageReactions(row.clone()) };
        assert!(matches!(normalize(add), Some(FeedEvent::ReactionAdded(_))));

        // reaction rows are immutable; an update has no meaning
        let update = TableChange { op: ChangeOp::Update, row: ChangeRow::MessageReactions(row) };
        assert_eq!(normalize(update), None);
    }

    #[test]
    fn test_file_delete_is_dropped() {
        let row = FileAttachment { id: 1, message_id: 1, name: "a".into(), url: "u".into() };
        let change = TableChange { op: ChangeOp::Delete, row: ChangeRow::MessageFiles(row) };
        assert_eq!(normalize(change), None);
    }

    #[test]
    fn test_presence_normalizes_for_any_op() {
        let row = Presence { user_id: Uuid::nil(), username: "bob".into(), online: true };
        let change = TableChange { op: ChangeOp::Update, row: ChangeRow::Presence(row) };
        assert!(matches!(normalize(change), Some(FeedEvent::PresenceChanged(_))));
    }
}
