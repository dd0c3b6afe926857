//! In-memory [`ChatBackend`] for exercising the sync engine.
//!
//! Behaves like one authenticated client session against the hosted
//! backend: writes commit into shared in-memory tables, committed rows
//! are re-emitted on every matching scope feed, and test knobs simulate
//! the failure modes the engine has to survive (severed transport,
//! rejected writes, a backend that does not echo the correlation
//! nonce, slow write confirmations).

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use cove_sync::backend::{ChatBackend, ScopeFeed};
use cove_sync::error::BackendError;
use cove_types::api::NewMessage;
use cove_types::events::{ChangeOp, ChangeRow, TableChange};
use cove_types::models::{
    ConversationScope, FileAttachment, Message, MessageId, Reaction, UserId,
};

struct Subscriber {
    scope: ConversationScope,
    tx: mpsc::UnboundedSender<TableChange>,
}

struct BackendState {
    next_message_id: MessageId,
    next_file_id: i64,
    messages: Vec<Message>,
    reactions: Vec<Reaction>,
    subscribers: Vec<Subscriber>,
    echo_nonce: bool,
    fail_next_write: Option<String>,
}

pub struct MemoryBackend {
    viewer: UserId,
    state: Mutex<BackendState>,
    /// Sleep between committing a write and returning its confirmation,
    /// so tests can force the feed event to win the race.
    write_delay: Mutex<Duration>,
}

impl MemoryBackend {
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            state: Mutex::new(BackendState {
                next_message_id: 1,
                next_file_id: 1,
                messages: Vec::new(),
                reactions: Vec::new(),
                subscribers: Vec::new(),
                echo_nonce: true,
                fail_next_write: None,
            }),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BackendState) -> T) -> Result<T, BackendError> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| BackendError::Transport("backend state lock poisoned".into()))?;
        Ok(f(&mut st))
    }

    /// Reject the next write with `reason`.
    pub fn fail_next_write(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let _ = self.with_state(|st| st.fail_next_write = Some(reason));
    }

    /// Control whether committed rows echo the client nonce. Off, the
    /// engine has to fall back to approximate matching.
    pub fn set_echo_nonce(&self, echo: bool) {
        let _ = self.with_state(|st| st.echo_nonce = echo);
    }

    /// Delay write confirmations; the feed event still goes out
    /// immediately on commit.
    pub fn set_write_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.write_delay.lock() {
            *slot = delay;
        }
    }

    /// Drop every open feed, simulating a transport failure. Clients
    /// see their receivers close and reconnect with backoff.
    pub fn sever_feeds(&self) {
        let _ = self.with_state(|st| st.subscribers.clear());
    }

    /// Deliver a raw change to every feed subscribed to `scope`, as if
    /// another client had written it. This is how tests simulate peers,
    /// out-of-order delivery and cross-scope leakage.
    pub fn inject(&self, scope: ConversationScope, change: TableChange) {
        let _ = self.with_state(|st| {
            st.subscribers
                .retain(|sub| !(sub.scope == scope && sub.tx.send(change.clone()).is_err()));
        });
    }

    fn take_write_failure(st: &mut BackendState) -> Option<BackendError> {
        st.fail_next_write.take().map(BackendError::Rejected)
    }

    fn publish(st: &mut BackendState, viewer: UserId, change: TableChange) {
        let scope = match &change.row {
            ChangeRow::Messages(m) => m.scope_for(viewer),
            ChangeRow::MessageReactions(r) => st
                .messages
                .iter()
                .find(|m| m.id == r.message_id)
                .and_then(|m| m.scope_for(viewer)),
            ChangeRow::MessageFiles(f) => st
                .messages
                .iter()
                .find(|m| m.id == f.message_id)
                .and_then(|m| m.scope_for(viewer)),
            ChangeRow::Presence(_) => None,
        };
        st.subscribers.retain(|sub| {
            let wants = match scope {
                Some(scope) => sub.scope == scope,
                // presence is global: every feed carries it
                None => matches!(change.row, ChangeRow::Presence(_)),
            };
            if !wants {
                return true;
            }
            sub.tx.send(change.clone()).is_ok()
        });
    }
}

impl ChatBackend for MemoryBackend {
    fn fetch_initial_messages(
        &self,
        scope: ConversationScope,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Message>, BackendError>> + Send {
        async move {
            self.with_state(|st| {
                let mut rows: Vec<Message> = st
                    .messages
                    .iter()
                    .filter(|m| m.scope_for(self.viewer) == Some(scope))
                    .cloned()
                    .collect();
                rows.sort_by_key(|m| (m.created_at, m.id));
                let skip = rows.len().saturating_sub(limit as usize);
                Ok(rows.split_off(skip))
            })?
        }
    }

    fn insert_message(
        &self,
        scope: ConversationScope,
        new: NewMessage,
    ) -> impl Future<Output = Result<Message, BackendError>> + Send {
        async move {
            let confirmed = self.with_state(|st| {
                if let Some(err) = Self::take_write_failure(st) {
                    return Err(err);
                }

                let id = st.next_message_id;
                st.next_message_id += 1;

                let (channel_id, receiver_id) = match scope {
                    ConversationScope::Channel(channel) => (Some(channel), None),
                    ConversationScope::Direct(peer) => (None, Some(peer)),
                };
                let files = new
                    .attachments
                    .iter()
                    .map(|draft| {
                        let file_id = st.next_file_id;
                        st.next_file_id += 1;
                        FileAttachment {
                            id: file_id,
                            message_id: id,
                            name: draft.name.clone(),
                            url: draft.url.clone(),
                        }
                    })
                    .collect();

                let row = Message {
                    id,
                    body: new.body.clone(),
                    author_id: self.viewer,
                    author_username: "viewer".into(),
                    channel_id,
                    receiver_id,
                    parent_id: new.parent_id,
                    files,
                    nonce: st.echo_nonce.then_some(new.nonce),
                    created_at: Utc::now(),
                };
                st.messages.push(row.clone());

                debug!(id, "message committed");
                Self::publish(
                    st,
                    self.viewer,
                    TableChange { op: ChangeOp::Insert, row: ChangeRow::Messages(row.clone()) },
                );
                Ok(row)
            })??;

            let delay = self.write_delay.lock().map(|d| *d).unwrap_or(Duration::ZERO);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(confirmed)
        }
    }

    fn insert_reaction(
        &self,
        message_id: MessageId,
        emoji: String,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        async move {
            self.with_state(|st| {
                if let Some(err) = Self::take_write_failure(st) {
                    return Err(err);
                }
                if !st.messages.iter().any(|m| m.id == message_id) {
                    return Err(BackendError::Rejected(format!("no such message: {message_id}")));
                }

                let row = Reaction { message_id, emoji, user_id: self.viewer };
                if st.reactions.contains(&row) {
                    // unique (message, emoji, user): duplicate insert is a no-op
                    return Ok(());
                }
                st.reactions.push(row.clone());
                Self::publish(
                    st,
                    self.viewer,
                    TableChange { op: ChangeOp::Insert, row: ChangeRow::MessageReactions(row) },
                );
                Ok(())
            })?
        }
    }

    fn remove_reaction(
        &self,
        message_id: MessageId,
        emoji: String,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        async move {
            self.with_state(|st| {
                if let Some(err) = Self::take_write_failure(st) {
                    return Err(err);
                }

                let row = Reaction { message_id, emoji, user_id: self.viewer };
                let Some(pos) = st.reactions.iter().position(|r| *r == row) else {
                    return Ok(());
                };
                st.reactions.remove(pos);
                Self::publish(
                    st,
                    self.viewer,
                    TableChange { op: ChangeOp::Delete, row: ChangeRow::MessageReactions(row) },
                );
                Ok(())
            })?
        }
    }

    fn subscribe(&self, scope: ConversationScope) -> Result<ScopeFeed, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|st| st.subscribers.push(Subscriber { scope, tx }))?;
        Ok(ScopeFeed { changes: rx })
    }
}
