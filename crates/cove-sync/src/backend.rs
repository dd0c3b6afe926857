use std::future::Future;

use tokio::sync::mpsc;

use cove_types::api::NewMessage;
use cove_types::events::TableChange;
use cove_types::models::{ConversationScope, Message, MessageId};

use crate::error::BackendError;

/// Live change feed for one conversation scope, covering the `messages`,
/// `message_reactions` and `message_files` tables plus presence.
///
/// Dropping the receiver is the unsubscribe. `None` from `recv` means
/// the transport dropped; the feed adapter resubscribes with backoff.
/// Delivery is at-least-once and unordered across entities, but changes
/// to the same row arrive in commit order.
pub struct ScopeFeed {
    pub changes: mpsc::UnboundedReceiver<TableChange>,
}

/// Boundary to the hosted backend. Futures are `Send` so the
/// coordinator can drive writes from spawned tasks.
pub trait ChatBackend: Send + Sync + 'static {
    /// Seed for a newly activated scope: up to `limit` most recent
    /// messages, returned oldest first.
    fn fetch_initial_messages(
        &self,
        scope: ConversationScope,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Message>, BackendError>> + Send;

    /// Persist a message. The returned row carries the backend-assigned
    /// id and echoes the correlation nonce from `new`.
    fn insert_message(
        &self,
        scope: ConversationScope,
        new: NewMessage,
    ) -> impl Future<Output = Result<Message, BackendError>> + Send;

    fn insert_reaction(
        &self,
        message_id: MessageId,
        emoji: String,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn remove_reaction(
        &self,
        message_id: MessageId,
        emoji: String,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Open the live feed for `scope`.
    fn subscribe(&self, scope: ConversationScope) -> Result<ScopeFeed, BackendError>;
}
