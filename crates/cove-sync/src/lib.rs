//! Client-side synchronization engine for Cove chat.
//!
//! The backend (queries, writes and the live change feed) sits behind the
//! [`ChatBackend`] trait. The [`Coordinator`] owns one active
//! [`ConversationScope`](cove_types::models::ConversationScope) at a
//! time: it seeds the scope from history, keeps a feed subscription
//! alive across transport drops, applies optimistic local updates for
//! the viewer's own writes, and folds every incoming event into the
//! [`MessageTree`]. The presentation layer renders from `view()` and
//! `summarize()` whenever the revision watch channel ticks.

pub mod backend;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod presence;
pub mod reactions;
pub mod reconciler;

pub use backend::{ChatBackend, ScopeFeed};
pub use coordinator::{Coordinator, SyncPhase};
pub use error::{BackendError, SyncError};
pub use feed::FeedConfig;
pub use presence::PresenceRoster;
pub use reactions::{EmojiAggregate, ReactionSummary, summarize};
pub use reconciler::{MessageTree, ThreadNode};
