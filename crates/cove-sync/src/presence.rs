//! Online-user roster, folded from presence events on the feed.

use std::collections::HashMap;

use cove_types::models::{Presence, UserId};

#[derive(Debug, Default)]
pub struct PresenceRoster {
    online: HashMap<UserId, String>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: Presence) {
        if update.online {
            self.online.insert(update.user_id, update.username);
        } else {
            self.online.remove(&update.user_id);
        }
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.online.contains_key(&user)
    }

    pub fn online_users(&self) -> Vec<(UserId, String)> {
        self.online
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn presence(user: UserId, online: bool) -> Presence {
        Presence { user_id: user, username: "bob".into(), online }
    }

    #[test]
    fn test_online_offline_fold() {
        let mut roster = PresenceRoster::new();
        let user = Uuid::new_v4();

        roster.apply(presence(user, true));
        assert!(roster.is_online(user));

        // duplicate delivery changes nothing
        roster.apply(presence(user, true));
        assert_eq!(roster.len(), 1);

        roster.apply(presence(user, false));
        assert!(!roster.is_online(user));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_offline_for_unknown_user_is_noop() {
        let mut roster = PresenceRoster::new();
        roster.apply(presence(Uuid::new_v4(), false));
        assert!(roster.is_empty());
    }
}
