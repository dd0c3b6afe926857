//! Reaction aggregation: a pure projection from a message's reaction
//! set to per-emoji groups, never persisted as authoritative state.

use std::collections::BTreeMap;

use cove_types::models::UserId;

use crate::reconciler::ReactionKey;

/// Aggregate for one emoji on one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmojiAggregate {
    pub count: usize,
    pub reacted_by_me: bool,
}

/// Reaction summary for one message, keyed by emoji. `BTreeMap` keeps
/// iteration order deterministic for rendering.
pub type ReactionSummary = BTreeMap<String, EmojiAggregate>;

/// Group a reaction set by emoji. The output depends only on the set
/// contents, never on construction order. Emoji are compared as exact
/// strings; variant forms are distinct keys.
pub fn summarize<'a, I>(reactions: I, viewer: UserId) -> ReactionSummary
where
    I: IntoIterator<Item = &'a ReactionKey>,
{
    let mut summary = ReactionSummary::new();
    for (emoji, user) in reactions {
        let agg = summary
            .entry(emoji.clone())
            .or_insert(EmojiAggregate { count: 0, reacted_by_me: false });
        agg.count += 1;
        if *user == viewer {
            agg.reacted_by_me = true;
        }
    }
    summary
}
