use std::sync::Arc;

use crate::config::{HubConfig, SyncConfig};
use crate::db::DbPool;
use crate::push::PushNotifier;
use crate::repo::SqliteStore;
use crate::sync::DifferenceEngine;
use crate::ws::{Collaborators, ConnectionLimits, Hub};

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Repository implementation over the SQLite pool
    pub store: SqliteStore,
    /// Live connection registry and dispatcher
    pub hub: Hub,
    /// Read side of the pts log for the sync endpoints
    pub sync: DifferenceEngine,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Queue sizes and keepalive timing for new connections
    pub limits: ConnectionLimits,
}

impl AppState {
    /// Wire the store, hub and difference engine together.
    /// Must be called inside a Tokio runtime: the hub loop is spawned here.
    pub fn new(
        db: DbPool,
        jwt_secret: Vec<u8>,
        hub_config: &HubConfig,
        sync_config: SyncConfig,
        push: Arc<dyn PushNotifier>,
    ) -> Self {
        let store = SqliteStore::new(db);
        let hub = Hub::start(
            Collaborators::from_store(store.clone(), push),
            hub_config.inbound_queue_capacity,
        );
        let shared = Arc::new(store.clone());
        let sync = DifferenceEngine::new(shared.clone(), shared, sync_config);

        Self {
            store,
            hub,
            sync,
            jwt_secret,
            limits: hub_config.limits(),
        }
    }
}
