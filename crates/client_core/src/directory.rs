use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{Conversation, UserId};

/// Refreshes an overlay entry may go unlisted before it is forgotten.
const MAX_UNLISTED_REFRESHES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalActivity {
    last_message: String,
    at: DateTime<Utc>,
    unlisted_refreshes: u32,
}

/// In-memory conversation list.
///
/// A refresh replaces the list wholesale. Local send/receive updates are
/// kept in an overlay and re-applied on top of every refresh until the
/// server's own `last_updated_at` catches up with them.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    conversations: Vec<Conversation>,
    overlay: HashMap<UserId, LocalActivity>,
    loaded: bool,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, counterpart: &UserId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.counterpart_user_id == counterpart)
    }

    pub fn replace(&mut self, fetched: Vec<Conversation>) {
        self.conversations = fetched;
        self.loaded = true;

        let conversations = &mut self.conversations;
        self.overlay.retain(|counterpart, activity| {
            let Some(entry) = conversations
                .iter_mut()
                .find(|conversation| &conversation.counterpart_user_id == counterpart)
            else {
                // Not on the server yet; give it a few refreshes to show up.
                activity.unlisted_refreshes += 1;
                return activity.unlisted_refreshes < MAX_UNLISTED_REFRESHES;
            };
            if entry.last_updated_at >= activity.at {
                return false;
            }
            entry.last_message = activity.last_message.clone();
            entry.last_updated_at = activity.at;
            true
        });
    }

    /// Records a send or receive for `counterpart`. Returns whether a listed
    /// conversation changed; unknown counterparts are remembered for the
    /// next few refreshes instead of being attributed to another entry.
    pub fn apply_local_update(
        &mut self,
        counterpart: &UserId,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> bool {
        self.overlay.insert(
            counterpart.clone(),
            LocalActivity {
                last_message: last_message.to_string(),
                at,
                unlisted_refreshes: 0,
            },
        );

        match self
            .conversations
            .iter_mut()
            .find(|conversation| &conversation.counterpart_user_id == counterpart)
        {
            Some(entry) => {
                entry.last_message = last_message.to_string();
                entry.last_updated_at = at;
                true
            }
            None => false,
        }
    }

    /// Case-insensitive substring match on display name. A blank query
    /// matches everything; the underlying list is never touched.
    pub fn filter(&self, query: &str) -> Vec<Conversation> {
        let needle = query.trim().to_lowercase();
        self.conversations
            .iter()
            .filter(|conversation| {
                needle.is_empty() || conversation.display_name.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
