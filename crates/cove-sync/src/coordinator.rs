//! View state coordinator: owns the active conversation scope, swaps
//! feed subscriptions when it changes, and translates UI intents into
//! backend writes paired with optimistic local updates.
//!
//! All scope state lives behind one async `RwLock`; entry points
//! re-read it after every suspension point instead of caching
//! references. Scope switches bump an epoch counter, and everything
//! that can resume late (feed events, write confirmations, seed
//! fetches, connectivity changes) is guarded by an epoch check so it
//! can never land in the wrong scope's state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use cove_types::api::{NewFile, NewMessage};
use cove_types::events::FeedEvent;
use cove_types::models::{
    ConversationScope, FileAttachment, Message, MessageId, Reaction, UserId,
};

use crate::backend::ChatBackend;
use crate::error::SyncError;
use crate::feed::{self, FeedConfig};
use crate::presence::PresenceRoster;
use crate::reactions::{self, ReactionSummary};
use crate::reconciler::{MessageTree, ThreadNode};

/// Fallback window for matching a confirmed message to its provisional
/// entry when the backend did not echo the correlation nonce.
const APPROX_MATCH_WINDOW_SECS: i64 = 10;

/// Subscription lifecycle of the active scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Inactive,
    /// Feed spawned, seed fetch in flight.
    Subscribing,
    Active,
}

struct ScopeState {
    scope: Option<ConversationScope>,
    phase: SyncPhase,
    tree: MessageTree,
    roster: PresenceRoster,
    /// Correlation nonce -> provisional id, for sends awaiting their
    /// authoritative event.
    pending_sends: HashMap<Uuid, MessageId>,
}

impl ScopeState {
    fn inactive() -> Self {
        Self {
            scope: None,
            phase: SyncPhase::Inactive,
            tree: MessageTree::new(),
            roster: PresenceRoster::new(),
            pending_sends: HashMap::new(),
        }
    }

    fn subscribing(scope: ConversationScope) -> Self {
        Self {
            scope: Some(scope),
            phase: SyncPhase::Subscribing,
            ..Self::inactive()
        }
    }
}

pub(crate) struct CoordinatorInner<B> {
    pub(crate) backend: Arc<B>,
    pub(crate) config: FeedConfig,
    viewer: UserId,
    viewer_name: String,
    state: RwLock<ScopeState>,
    /// Bumped on every scope switch; stale epochs are discarded.
    epoch: AtomicU64,
    connected: AtomicBool,
    /// Counts downward; provisional ids are never reused, even across
    /// scope switches.
    provisional_seq: AtomicI64,
    feed_cancel: Mutex<Option<CancellationToken>>,
    revision: watch::Sender<u64>,
}

/// Handle to the sync engine. Cheap to clone; all clones share state.
pub struct Coordinator<B: ChatBackend> {
    inner: Arc<CoordinatorInner<B>>,
}

impl<B: ChatBackend> Clone for Coordinator<B> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<B: ChatBackend> Coordinator<B> {
    pub fn new(backend: Arc<B>, viewer: UserId, viewer_name: impl Into<String>) -> Self {
        Self::with_config(backend, viewer, viewer_name, FeedConfig::default())
    }

    pub fn with_config(
        backend: Arc<B>,
        viewer: UserId,
        viewer_name: impl Into<String>,
        config: FeedConfig,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(CoordinatorInner {
                backend,
                config,
                viewer,
                viewer_name: viewer_name.into(),
                state: RwLock::new(ScopeState::inactive()),
                epoch: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                provisional_seq: AtomicI64::new(0),
                feed_cancel: Mutex::new(None),
                revision,
            }),
        }
    }

    pub fn viewer(&self) -> UserId {
        self.inner.viewer
    }

    /// Revision counter that ticks on every state change. The
    /// presentation layer watches this and re-reads `view()` /
    /// `summarize()` when it moves.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Transport liveness of the active feed, for a non-blocking
    /// "reconnecting" indicator.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub async fn phase(&self) -> SyncPhase {
        self.inner.state.read().await.phase
    }

    pub async fn scope(&self) -> Option<ConversationScope> {
        self.inner.state.read().await.scope
    }

    /// Make `scope` the active conversation: tear down the previous
    /// feed, discard the previous scope's state, spawn a fresh feed
    /// subscription and seed the tree from history. A seed fetch
    /// failure leaves the scope in `Subscribing`; the caller may retry,
    /// and live updates still self-heal the gap meanwhile.
    pub async fn set_active_scope(&self, scope: ConversationScope) -> Result<(), SyncError> {
        let inner = &self.inner;
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // old feed torn down before the new one goes live
        let cancel = CancellationToken::new();
        {
            let mut slot = inner.feed_cancel.lock().await;
            if let Some(old) = slot.take() {
                old.cancel();
            }
            *slot = Some(cancel.clone());
        }

        {
            let mut st = inner.state.write().await;
            *st = ScopeState::subscribing(scope);
        }
        inner.connected.store(false, Ordering::SeqCst);
        inner.bump();

        info!(?scope, epoch, "activating conversation scope");

        // The first subscribe happens inline so the swap is atomic from
        // this coordinator's perspective: once we return, the new feed
        // handle is established and buffering events. The spawned task
        // pumps it and owns every later reconnect.
        let initial = match inner.backend.subscribe(scope) {
            Ok(feed) => Some(feed),
            Err(err) => {
                warn!(?scope, "initial subscribe failed: {}; will retry with backoff", err);
                None
            }
        };
        tokio::spawn(feed::run_feed(inner.clone(), scope, epoch, cancel, initial));

        // Seed from history. Live events racing ahead of the fetch are
        // harmless: inserts are idempotent by id.
        let seed = inner
            .backend
            .fetch_initial_messages(scope, inner.config.seed_limit)
            .await?;

        let mut st = inner.state.write().await;
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            debug!(?scope, "scope changed during seed fetch; seed discarded");
            return Ok(());
        }
        for message in seed {
            if message.scope_for(inner.viewer) == Some(scope) {
                st.tree.apply_insert(message);
            } else {
                warn!(id = message.id, "cross-scope row in seed dropped");
            }
        }
        st.phase = SyncPhase::Active;
        drop(st);
        inner.bump();
        Ok(())
    }

    /// Tear down the active scope and its subscription.
    pub async fn deactivate(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = inner.feed_cancel.lock().await.take() {
            old.cancel();
        }
        {
            let mut st = inner.state.write().await;
            *st = ScopeState::inactive();
        }
        inner.connected.store(false, Ordering::SeqCst);
        inner.bump();
    }

    /// Send a message into the active scope. A provisional copy with a
    /// negative id shows up in the view immediately and is replaced --
    /// not merged -- when the backend-assigned row arrives, matched by
    /// the correlation nonce. Returns the backend-assigned id.
    pub async fn send(
        &self,
        body: impl Into<String>,
        attachments: Vec<NewFile>,
        parent_id: Option<MessageId>,
    ) -> Result<MessageId, SyncError> {
        let inner = &self.inner;
        let body = body.into();
        let nonce = Uuid::new_v4();
        let provisional_id = inner.next_provisional_id();
        let epoch = inner.epoch.load(Ordering::SeqCst);

        let scope = {
            let mut st = inner.state.write().await;
            let Some(scope) = st.scope else {
                return Err(SyncError::NoActiveScope);
            };
            let provisional =
                inner.provisional_message(scope, provisional_id, &body, &attachments, parent_id, nonce);
            st.pending_sends.insert(nonce, provisional_id);
            st.tree.apply_insert(provisional);
            scope
        };
        inner.bump();

        let new = NewMessage { body, parent_id, attachments, nonce };
        let result = inner.backend.insert_message(scope, new).await;

        // we suspended; the scope may have moved underneath us
        let mut st = inner.state.write().await;
        let still_current = inner.epoch.load(Ordering::SeqCst) == epoch;
        match result {
            Ok(confirmed) => {
                let confirmed_id = confirmed.id;
                if still_current {
                    // the feed may have reconciled this nonce already
                    if st.pending_sends.remove(&nonce).is_some() {
                        st.tree.apply_delete(provisional_id);
                    }
                    st.tree.apply_insert(confirmed);
                    drop(st);
                    inner.bump();
                } else {
                    debug!(confirmed_id, "send confirmed after scope change; dropped");
                }
                Ok(confirmed_id)
            }
            Err(err) => {
                if still_current {
                    st.pending_sends.remove(&nonce);
                    st.tree.apply_delete(provisional_id);
                    drop(st);
                    inner.bump();
                    warn!(provisional_id, "send rejected; provisional rolled back: {}", err);
                }
                Err(err.into())
            }
        }
    }

    /// React to a message with `emoji`. Reacting twice with the same
    /// emoji is a no-op, not an error. The optimistic reaction is
    /// rolled back if the backend refuses the write.
    pub async fn react(
        &self,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<(), SyncError> {
        let inner = &self.inner;
        let emoji = emoji.into();
        let epoch = inner.epoch.load(Ordering::SeqCst);

        {
            let mut st = inner.state.write().await;
            if st.scope.is_none() {
                return Err(SyncError::NoActiveScope);
            }
            let already = st
                .tree
                .reaction_set(message_id)
                .is_some_and(|set| set.contains(&(emoji.clone(), inner.viewer)));
            if already {
                return Ok(());
            }
            st.tree.add_reaction(Reaction {
                message_id,
                emoji: emoji.clone(),
                user_id: inner.viewer,
            });
        }
        inner.bump();

        if let Err(err) = inner.backend.insert_reaction(message_id, emoji.clone()).await {
            let mut st = inner.state.write().await;
            if inner.epoch.load(Ordering::SeqCst) == epoch {
                st.tree.remove_reaction(Reaction { message_id, emoji, user_id: inner.viewer });
                drop(st);
                inner.bump();
                warn!(message_id, "reaction rejected; rolled back: {}", err);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Withdraw the viewer's reaction. Removing an absent reaction is a
    /// no-op.
    pub async fn unreact(
        &self,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<(), SyncError> {
        let inner = &self.inner;
        let emoji = emoji.into();
        let epoch = inner.epoch.load(Ordering::SeqCst);

        {
            let mut st = inner.state.write().await;
            if st.scope.is_none() {
                return Err(SyncError::NoActiveScope);
            }
            let present = st
                .tree
                .reaction_set(message_id)
                .is_some_and(|set| set.contains(&(emoji.clone(), inner.viewer)));
            if !present {
                return Ok(());
            }
            st.tree.remove_reaction(Reaction {
                message_id,
                emoji: emoji.clone(),
                user_id: inner.viewer,
            });
        }
        inner.bump();

        if let Err(err) = inner.backend.remove_reaction(message_id, emoji.clone()).await {
            let mut st = inner.state.write().await;
            if inner.epoch.load(Ordering::SeqCst) == epoch {
                st.tree.add_reaction(Reaction { message_id, emoji, user_id: inner.viewer });
                drop(st);
                inner.bump();
                warn!(message_id, "reaction removal rejected; restored: {}", err);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Threaded read-only projection of the active scope.
    pub async fn view(&self) -> Vec<ThreadNode> {
        self.inner.state.read().await.tree.view()
    }

    /// Reaction summary for one message, grouped by emoji with the
    /// viewer's own participation flagged.
    pub async fn summarize(&self, message_id: MessageId) -> ReactionSummary {
        let st = self.inner.state.read().await;
        match st.tree.reaction_set(message_id) {
            Some(set) => reactions::summarize(set, self.inner.viewer),
            None => ReactionSummary::new(),
        }
    }

    pub async fn online_users(&self) -> Vec<(UserId, String)> {
        self.inner.state.read().await.roster.online_users()
    }
}

impl<B: ChatBackend> CoordinatorInner<B> {
    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn next_provisional_id(&self) -> MessageId {
        self.provisional_seq.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn provisional_message(
        &self,
        scope: ConversationScope,
        id: MessageId,
        body: &str,
        attachments: &[NewFile],
        parent_id: Option<MessageId>,
        nonce: Uuid,
    ) -> Message {
        let (channel_id, receiver_id) = match scope {
            ConversationScope::Channel(channel) => (Some(channel), None),
            ConversationScope::Direct(peer) => (None, Some(peer)),
        };
        let files = attachments
            .iter()
            .map(|draft| FileAttachment {
                id: self.next_provisional_id(),
                message_id: id,
                name: draft.name.clone(),
                url: draft.url.clone(),
            })
            .collect();
        Message {
            id,
            body: body.to_string(),
            author_id: self.viewer,
            author_username: self.viewer_name.clone(),
            channel_id,
            receiver_id,
            parent_id,
            files,
            nonce: Some(nonce),
            created_at: Utc::now(),
        }
    }

    /// Fold one normalized feed event into scope state. Events carry
    /// the epoch of the subscription that produced them; anything from
    /// a dead epoch is discarded before touching state.
    pub(crate) async fn apply(&self, epoch: u64, event: FeedEvent) {
        let mut st = self.state.write().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            trace!(epoch, "stale feed event dropped");
            return;
        }

        match event {
            FeedEvent::MessageInserted(message) => {
                let Some(scope) = st.scope else { return };
                if message.scope_for(self.viewer) != Some(scope) {
                    warn!(id = message.id, "cross-scope message on feed dropped");
                    return;
                }
                self.reconcile_provisional(&mut st, &message);
                st.tree.apply_insert(message);
            }
            FeedEvent::MessageUpdated(message) => {
                let Some(scope) = st.scope else { return };
                if message.scope_for(self.viewer) != Some(scope) {
                    warn!(id = message.id, "cross-scope message on feed dropped");
                    return;
                }
                st.tree.apply_update(message);
            }
            FeedEvent::MessageDeleted { id } => st.tree.apply_delete(id),
            FeedEvent::ReactionAdded(reaction) => st.tree.add_reaction(reaction),
            FeedEvent::ReactionRemoved(reaction) => st.tree.remove_reaction(reaction),
            FeedEvent::FileAttached(file) => st.tree.attach_file(file),
            FeedEvent::PresenceChanged(update) => st.roster.apply(update),
        }

        drop(st);
        self.bump();
    }

    /// If `incoming` confirms one of our optimistic sends, drop the
    /// provisional entry so the authoritative row replaces it instead
    /// of coexisting with it.
    fn reconcile_provisional(&self, st: &mut ScopeState, incoming: &Message) {
        if let Some(nonce) = incoming.nonce {
            if let Some(provisional_id) = st.pending_sends.remove(&nonce) {
                st.tree.apply_delete(provisional_id);
            }
            return;
        }

        // No echoed nonce: fall back to approximate field matching.
        if incoming.author_id != self.viewer || st.pending_sends.is_empty() {
            return;
        }
        let window = chrono::Duration::seconds(APPROX_MATCH_WINDOW_SECS);
        if let Some(provisional_id) = st.tree.match_provisional(incoming, window) {
            warn!(
                id = incoming.id,
                provisional_id,
                "optimistic send matched by approximate fields; backend did not echo nonce"
            );
            st.pending_sends.retain(|_, pid| *pid != provisional_id);
            st.tree.apply_delete(provisional_id);
        }
    }

    /// Feed transport liveness, guarded by epoch like everything else.
    pub(crate) fn set_connected(&self, epoch: u64, up: bool) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.connected.store(up, Ordering::SeqCst);
        self.bump();
    }
}
