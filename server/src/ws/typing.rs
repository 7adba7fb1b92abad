use std::collections::HashMap;
use std::sync::Mutex;

/// Transient typing flags: user_id -> chat_id -> typing.
///
/// Never persisted. The lock is only held for the map operation itself;
/// callers fan out the resulting events after it is released.
#[derive(Debug, Default)]
pub struct TypingState {
    inner: Mutex<HashMap<i64, HashMap<i64, bool>>>,
}

impl TypingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether `user_id` is typing in `chat_id`.
    pub fn set(&self, user_id: i64, chat_id: i64, typing: bool) {
        let mut map = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if typing {
            map.entry(user_id).or_default().insert(chat_id, true);
        } else if let Some(chats) = map.get_mut(&user_id) {
            chats.remove(&chat_id);
            if chats.is_empty() {
                map.remove(&user_id);
            }
        }
    }

    pub fn is_typing(&self, user_id: i64, chat_id: i64) -> bool {
        let map = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&user_id)
            .and_then(|chats| chats.get(&chat_id).copied())
            .unwrap_or(false)
    }

    /// Drop every flag for `user_id`, returning the chats they were typing in.
    pub fn clear_user(&self, user_id: i64) -> Vec<i64> {
        let removed = {
            let mut map = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.remove(&user_id)
        };

        let mut chats: Vec<i64> = removed
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(chat_id, typing)| typing.then_some(chat_id))
            .collect();
        chats.sort_unstable();
        chats
    }
}
