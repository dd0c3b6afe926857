//! Message tree reconciler: folds the normalized event stream into the
//! canonical in-memory message collection for the active scope.
//!
//! Messages live in an arena keyed by id; parent/child links are stored
//! as id references so relinking on out-of-order arrival is cheap map
//! work and reply nesting can be unbounded without owning recursion.
//! Duplicate delivery is expected from an at-least-once feed, so every
//! operation is an idempotent upsert keyed by the backend-assigned id.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use cove_types::models::{FileAttachment, Message, MessageId, Reaction, UserId};

/// Reaction identity within one message: (emoji, reactor).
pub type ReactionKey = (String, UserId);

/// One node of the threaded view: a message and its direct replies,
/// both ordered by `(created_at, id)` ascending. `message` is `None`
/// for a deleted parent kept as a placeholder so its replies stay
/// grouped under the original thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadNode {
    pub id: MessageId,
    pub message: Option<Message>,
    pub replies: Vec<ThreadNode>,
}

struct Entry {
    message: Message,
    /// Confirmed remote delete; the entry survives only to anchor its
    /// replies and is pruned once the last reply goes away.
    deleted: bool,
}

/// Side-channel events that arrived before their message. Drained when
/// the message insert lands, discarded when the scope switches.
#[derive(Default)]
struct Pending {
    reactions: HashSet<ReactionKey>,
    files: Vec<FileAttachment>,
}

#[derive(Default)]
pub struct MessageTree {
    entries: HashMap<MessageId, Entry>,
    /// Direct reply ids per parent, `(created_at, id)` ascending.
    children: HashMap<MessageId, Vec<MessageId>>,
    /// Parentless message ids, `(created_at, id)` ascending.
    roots: Vec<MessageId>,
    /// Reaction sets keyed by message id.
    reactions: HashMap<MessageId, HashSet<ReactionKey>>,
    pending: HashMap<MessageId, Pending>,
}

impl MessageTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.get(&id).is_some_and(|e| !e.deleted)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.entries
            .get(&id)
            .filter(|e| !e.deleted)
            .map(|e| &e.message)
    }

    /// The current reaction set for a message, if any reactions exist.
    pub fn reaction_set(&self, id: MessageId) -> Option<&HashSet<ReactionKey>> {
        self.reactions.get(&id)
    }

    /// Insert a message. A duplicate id is a no-op: at-least-once
    /// delivery makes redelivery routine. Buffered reactions and files
    /// waiting on this id are drained into the new entry.
    pub fn apply_insert(&mut self, message: Message) {
        let id = message.id;
        if self.entries.contains_key(&id) {
            debug!(id, "duplicate message insert ignored");
            return;
        }

        let mut entry = Entry { message, deleted: false };
        if let Some(pending) = self.pending.remove(&id) {
            for file in pending.files {
                push_file(&mut entry.message.files, file);
            }
            if !pending.reactions.is_empty() {
                self.reactions.entry(id).or_default().extend(pending.reactions);
            }
        }

        self.entries.insert(id, entry);
        self.link(id);
    }

    /// Replace an existing message's fields by id. An unknown id is
    /// treated as an insert, which heals the gap left by events missed
    /// across a reconnect. Attachments travel on their own feed, so the
    /// locally accumulated file list is merged rather than overwritten.
    pub fn apply_update(&mut self, message: Message) {
        let id = message.id;
        let Some(entry) = self.entries.get_mut(&id) else {
            debug!(id, "update for unknown message treated as insert");
            self.apply_insert(message);
            return;
        };
        if entry.deleted {
            // per-entity commit order makes the delete authoritative
            debug!(id, "update for deleted message dropped");
            return;
        }

        let old_parent = entry.message.parent_id;
        let relink = old_parent != message.parent_id
            || entry.message.created_at != message.created_at;

        let local_files = std::mem::take(&mut entry.message.files);
        entry.message = message;
        for file in local_files {
            push_file(&mut entry.message.files, file);
        }

        if relink {
            self.unlink(id, old_parent);
            self.link(id);
        }
    }

    /// Remove a message. If it still has replies, the entry stays as a
    /// placeholder so the thread keeps its grouping; otherwise it is
    /// dropped entirely and any newly childless placeholder above it is
    /// pruned. Unknown ids are a no-op.
    pub fn apply_delete(&mut self, id: MessageId) {
        if !self.entries.contains_key(&id) {
            debug!(id, "delete for unknown message ignored");
            return;
        }

        self.reactions.remove(&id);
        self.pending.remove(&id);

        let has_replies = self.children.get(&id).is_some_and(|c| !c.is_empty());
        if has_replies {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.deleted = true;
                entry.message.body.clear();
                entry.message.files.clear();
                entry.message.nonce = None;
            }
            return;
        }

        let parent = self.entries.get(&id).and_then(|e| e.message.parent_id);
        self.entries.remove(&id);
        self.children.remove(&id);
        self.unlink(id, parent);
        self.prune_placeholder(parent);
    }

    /// Append an attachment to its message. A file for an unseen
    /// message is buffered until the insert arrives.
    pub fn attach_file(&mut self, file: FileAttachment) {
        match self.entries.get_mut(&file.message_id) {
            Some(entry) if entry.deleted => {
                debug!(message_id = file.message_id, "file for deleted message dropped");
            }
            Some(entry) => push_file(&mut entry.message.files, file),
            None => {
                debug!(message_id = file.message_id, "file before its message; buffering");
                let pending = self.pending.entry(file.message_id).or_default();
                push_file(&mut pending.files, file);
            }
        }
    }

    /// Record a reaction. Duplicates are a no-op; a reaction for an
    /// unseen message is buffered until the insert arrives.
    pub fn add_reaction(&mut self, reaction: Reaction) {
        let key = (reaction.emoji, reaction.user_id);
        match self.entries.get(&reaction.message_id) {
            Some(entry) if entry.deleted => {
                debug!(message_id = reaction.message_id, "reaction for deleted message dropped");
            }
            Some(_) => {
                let set = self.reactions.entry(reaction.message_id).or_default();
                if !set.insert(key) {
                    debug!(message_id = reaction.message_id, "duplicate reaction ignored");
                }
            }
            None => {
                debug!(message_id = reaction.message_id, "reaction before its message; buffering");
                self.pending
                    .entry(reaction.message_id)
                    .or_default()
                    .reactions
                    .insert(key);
            }
        }
    }

    pub fn remove_reaction(&mut self, reaction: Reaction) {
        let key = (reaction.emoji, reaction.user_id);
        if let Some(set) = self.reactions.get_mut(&reaction.message_id) {
            set.remove(&key);
            if set.is_empty() {
                self.reactions.remove(&reaction.message_id);
            }
        } else if let Some(pending) = self.pending.get_mut(&reaction.message_id) {
            pending.reactions.remove(&key);
        } else {
            debug!(message_id = reaction.message_id, "reaction removal for unknown message ignored");
        }
    }

    /// Best-effort match of a confirmed message against a provisional
    /// entry when the backend did not echo the correlation nonce. Known
    /// limitation: two identical bodies sent inside the window are
    /// ambiguous; the nonce path should be preferred wherever possible.
    pub fn match_provisional(
        &self,
        incoming: &Message,
        window: chrono::Duration,
    ) -> Option<MessageId> {
        self.entries
            .values()
            .find(|e| {
                !e.deleted
                    && e.message.is_provisional()
                    && e.message.author_id == incoming.author_id
                    && e.message.body == incoming.body
                    && (incoming.created_at - e.message.created_at).abs() <= window
            })
            .map(|e| e.message.id)
    }

    /// The threaded projection: roots ascending, each node's replies
    /// ascending. Pure and restartable; repeated calls without
    /// intervening mutation return equal results.
    pub fn view(&self) -> Vec<ThreadNode> {
        self.roots.iter().filter_map(|&id| self.node(id)).collect()
    }

    /// Flat projection: every live message, `(created_at, id)` ascending.
    pub fn flat_view(&self) -> Vec<&Message> {
        let mut out: Vec<&Message> = self
            .entries
            .values()
            .filter(|e| !e.deleted)
            .map(|e| &e.message)
            .collect();
        out.sort_by_key(|m| (m.created_at, m.id));
        out
    }

    fn node(&self, id: MessageId) -> Option<ThreadNode> {
        let entry = self.entries.get(&id)?;
        let replies = self
            .children
            .get(&id)
            .map(|kids| kids.iter().filter_map(|&k| self.node(k)).collect())
            .unwrap_or_default();
        Some(ThreadNode {
            id,
            message: (!entry.deleted).then(|| entry.message.clone()),
            replies,
        })
    }

    /// Place `id` among its siblings, keeping `(created_at, id)` order.
    /// A reply whose parent has not arrived yet still gets linked into
    /// the parent's (future) child list; it surfaces in `view()` once
    /// the parent insert lands.
    fn link(&mut self, id: MessageId) {
        let Some(entry) = self.entries.get(&id) else { return };
        let parent = entry.message.parent_id;
        let key = (entry.message.created_at, id);

        let entries = &self.entries;
        let key_of = |sibling: MessageId| -> (DateTime<Utc>, MessageId) {
            entries
                .get(&sibling)
                .map(|e| (e.message.created_at, sibling))
                .unwrap_or((DateTime::<Utc>::MAX_UTC, sibling))
        };

        let siblings = match parent {
            Some(p) => self.children.entry(p).or_default(),
            None => &mut self.roots,
        };
        if siblings.contains(&id) {
            return;
        }
        let pos = siblings.partition_point(|&s| key_of(s) <= key);
        siblings.insert(pos, id);
    }

    fn unlink(&mut self, id: MessageId, parent: Option<MessageId>) {
        let siblings = match parent {
            Some(p) => match self.children.get_mut(&p) {
                Some(v) => v,
                None => return,
            },
            None => &mut self.roots,
        };
        if let Some(pos) = siblings.iter().position(|&s| s == id) {
            siblings.remove(pos);
        }
    }

    /// Walk up from `start`, removing placeholders left with no replies.
    fn prune_placeholder(&mut self, start: Option<MessageId>) {
        let mut cursor = start;
        while let Some(id) = cursor {
            let childless = self.children.get(&id).is_none_or(|c| c.is_empty());
            let Some(entry) = self.entries.get(&id) else { return };
            if !entry.deleted || !childless {
                return;
            }
            let parent = entry.message.parent_id;
            self.entries.remove(&id);
            self.children.remove(&id);
            self.unlink(id, parent);
            cursor = parent;
        }
    }
}

fn push_file(files: &mut Vec<FileAttachment>, file: FileAttachment) {
    if files.iter().any(|f| f.id == file.id) {
        return;
    }
    files.push(file);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: MessageId, parent: Option<MessageId>, secs: i64) -> Message {
        Message {
            id,
            body: format!("message {id}"),
            author_id: Uuid::nil(),
            author_username: "alice".into(),
            channel_id: Some(1),
            receiver_id: None,
            parent_id: parent,
            files: vec![],
            nonce: None,
            created_at: at(secs),
        }
    }

    fn file(id: i64, message_id: MessageId) -> FileAttachment {
        FileAttachment {
            id,
            message_id,
            name: format!("file{id}.png"),
            url: format!("https://files.example/{id}"),
        }
    }

    fn reaction(message_id: MessageId, emoji: &str, user: UserId) -> Reaction {
        Reaction { message_id, emoji: emoji.into(), user_id: user }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut tree = MessageTree::new();
        tree.apply_insert(msg(1, None, 0));
        let once = tree.view();

        tree.apply_insert(msg(1, None, 0));
        assert_eq!(tree.view(), once);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_siblings_sorted_by_timestamp() {
        let mut tree = MessageTree::new();
        tree.apply_insert(msg(3, None, 30));
        tree.apply_insert(msg(1, None, 10));
        tree.apply_insert(msg(2, None, 20));

        let roots: Vec<MessageId> = tree.view().iter().map(|n| n.id).collect();
        assert_eq!(roots, vec![1, 2, 3]);

        tree.apply_insert(msg(12, Some(2), 50));
        tree.apply_insert(msg(11, Some(2), 40));
        let replies: Vec<MessageId> = tree.view()[1].replies.iter().map(|n| n.id).collect();
        assert_eq!(replies, vec![11, 12]);
    }

    #[test]
    fn test_equal_timestamps_break_ties_by_id() {
        let mut tree = MessageTree::new();
        tree.apply_insert(msg(5, None, 0));
        tree.apply_insert(msg(2, None, 0));
        let roots: Vec<MessageId> = tree.view().iter().map(|n| n.id).collect();
        assert_eq!(roots, vec![2, 5]);
    }

    #[test]
    fn test_reply_before_parent_heals_on_update() {
        let mut tree = MessageTree::new();
        // insert(id=1) was dropped; the reply arrives first
        tree.apply_insert(msg(2, Some(1), 20));
        assert!(tree.view().is_empty());

        // the parent is redelivered as an update after reconnect
        tree.apply_update(msg(1, None, 10));
        let view = tree.view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, 1);
        assert_eq!(view[0].replies.len(), 1);
        assert_eq!(view[0].replies[0].id, 2);
    }

    #[test]
    fn test_update_replaces_fields() {
        let mut tree = MessageTree::new();
        tree.apply_insert(msg(1, None, 0));
        tree.attach_file(file(7, 1));

        let mut edit = msg(1, None, 0);
        edit.body = "edited".into();
        tree.apply_update(edit);

        let m = tree.get(1).unwrap();
        assert_eq!(m.body, "edited");
        // attachments accumulated from the side channel survive updates
        assert_eq!(m.files.len(), 1);
    }

    #[test]
    fn test_update_after_delete_is_dropped() {
        let mut tree = MessageTree::new();
        tree.apply_insert(msg(1, None, 0));
        tree.apply_insert(msg(2, Some(1), 10));
        tree.apply_delete(1);

        tree.apply_update(msg(1, None, 0));
        assert!(!tree.contains(1));
        // the placeholder still anchors the reply
        assert_eq!(tree.view()[0].message, None);
    }

    #[test]
    fn test_delete_leaf_removes_entirely() {
        let mut tree = MessageTree::new();
        tree.apply_insert(msg(1, None, 0));
        tree.apply_delete(1);
        assert!(tree.view().is_empty());
        assert!(!tree.contains(1));

        // unknown id: no-op
        tree.apply_delete(99);
    }

    #[test]
    fn test_delete_parent_keeps_replies_grouped() {
        let mut tree = MessageTree::new();
        tree.apply_insert(msg(1, None, 0));
        tree.apply_insert(msg(2, Some(1), 10));
        tree.apply_delete(1);

        let view = tree.view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, 1);
        assert!(view[0].message.is_none());
        assert_eq!(view[0].replies[0].id, 2);

        // deleting the last reply prunes the placeholder too
        tree.apply_delete(2);
        assert!(tree.view().is_empty());
    }

    #[test]
    fn test_file_before_message_is_buffered() {
        let mut tree = MessageTree::new();
        tree.attach_file(file(7, 1));
        assert!(tree.view().is_empty());

        tree.apply_insert(msg(1, None, 0));
        assert_eq!(tree.get(1).unwrap().files.len(), 1);

        // redelivery of the same file is deduplicated
        tree.attach_file(file(7, 1));
        assert_eq!(tree.get(1).unwrap().files.len(), 1);
    }

    #[test]
    fn test_reaction_before_message_is_buffered() {
        let mut tree = MessageTree::new();
        let u1 = Uuid::new_v4();
        tree.add_reaction(reaction(1, "👍", u1));

        tree.apply_insert(msg(1, None, 0));
        assert_eq!(tree.reaction_set(1).unwrap().len(), 1);
    }

    #[test]
    fn test_buffered_reaction_cancelled_by_removal() {
        let mut tree = MessageTree::new();
        let u1 = Uuid::new_v4();
        tree.add_reaction(reaction(1, "👍", u1));
        tree.remove_reaction(reaction(1, "👍", u1));

        tree.apply_insert(msg(1, None, 0));
        assert!(tree.reaction_set(1).is_none_or(|s| s.is_empty()));
    }

    #[test]
    fn test_duplicate_reaction_is_noop() {
        let mut tree = MessageTree::new();
        let u1 = Uuid::new_v4();
        tree.apply_insert(msg(1, None, 0));
        tree.add_reaction(reaction(1, "👍", u1));
        tree.add_reaction(reaction(1, "👍", u1));
        assert_eq!(tree.reaction_set(1).unwrap().len(), 1);
    }

    #[test]
    fn test_match_provisional_by_fields() {
        let mut tree = MessageTree::new();
        let author = Uuid::new_v4();

        let mut provisional = msg(-1, None, 0);
        provisional.author_id = author;
        provisional.body = "hello".into();
        tree.apply_insert(provisional);

        let mut confirmed = msg(42, None, 3);
        confirmed.author_id = author;
        confirmed.body = "hello".into();

        assert_eq!(
            tree.match_provisional(&confirmed, chrono::Duration::seconds(10)),
            Some(-1)
        );

        let mut outside = confirmed.clone();
        outside.created_at = at(60);
        assert_eq!(tree.match_provisional(&outside, chrono::Duration::seconds(10)), None);
    }

    #[test]
    fn test_flat_view_order() {
        let mut tree = MessageTree::new();
        tree.apply_insert(msg(2, None, 20));
        tree.apply_insert(msg(3, Some(2), 30));
        tree.apply_insert(msg(1, None, 10));

        let ids: Vec<MessageId> = tree.flat_view().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
