//! Server-side presence tracking.
//!
//! In-memory presence store (DashMap) keyed by `presence:<user id>`.
//! The hub flips entries on the 0→1 and 1→0 connection edges; the REST
//! endpoint exposes a single user's status.

use axum::{
    extract::{Path, State},
    Json,
};
use dashmap::DashMap;
use serde::Serialize;

use crate::auth::middleware::Claims;
use crate::repo::UserRepository;
use crate::state::AppState;

/// Presence status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Info tracked per user in the presence map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceInfo {
    pub status: PresenceStatus,
    pub last_seen: Option<i64>,
}

/// Cache key for a user's presence entry. Always the decimal form of the id.
pub fn presence_key(user_id: i64) -> String {
    format!("presence:{}", user_id)
}

/// Shared presence store.
#[derive(Debug, Default)]
pub struct PresenceStore {
    entries: DashMap<String, PresenceInfo>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, user_id: i64) {
        self.entries.insert(
            presence_key(user_id),
            PresenceInfo {
                status: PresenceStatus::Online,
                last_seen: None,
            },
        );
    }

    pub fn set_offline(&self, user_id: i64, last_seen: i64) {
        self.entries.insert(
            presence_key(user_id),
            PresenceInfo {
                status: PresenceStatus::Offline,
                last_seen: Some(last_seen),
            },
        );
    }

    pub fn get(&self, user_id: i64) -> Option<PresenceInfo> {
        self.entries
            .get(&presence_key(user_id))
            .map(|entry| entry.value().clone())
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.get(user_id)
            .map(|info| info.status == PresenceStatus::Online)
            .unwrap_or(false)
    }
}

// --- REST endpoint handlers ---

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub user_id: i64,
    pub online: bool,
    pub last_seen: Option<i64>,
}

/// GET /presence/{user_id}: current presence for one user. JWT auth required.
/// Falls back to the persisted last-seen for users not seen since startup.
pub async fn get_presence(
    State(state): State<AppState>,
    _claims: Claims,
    Path(user_id): Path<i64>,
) -> Json<PresenceResponse> {
    let response = match state.hub.presence().get(user_id) {
        Some(info) => PresenceResponse {
            user_id,
            online: info.status == PresenceStatus::Online,
            last_seen: info.last_seen,
        },
        None => {
            let last_seen = state
                .hub
                .users()
                .get_by_id(user_id)
                .await
                .ok()
                .flatten()
                .and_then(|user| user.last_seen);
            PresenceResponse {
                user_id,
                online: false,
                last_seen,
            }
        }
    };

    Json(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_decimal_id() {
        assert_eq!(presence_key(7), "presence:7");
        assert_eq!(presence_key(1234), "presence:1234");
    }

    #[test]
    fn online_offline_transitions() {
        let store = PresenceStore::new();
        assert!(!store.is_online(1));

        store.set_online(1);
        assert!(store.is_online(1));

        store.set_offline(1, 1_700_000_000);
        let info = store.get(1).unwrap();
        assert_eq!(info.status, PresenceStatus::Offline);
        assert_eq!(info.last_seen, Some(1_700_000_000));
    }
}
