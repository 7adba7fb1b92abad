//! Connection registry and its coordinating loop.
//!
//! Every register/unregister/inbound event goes through one mpsc channel and
//! is handled by a single task, so membership changes are applied one at a
//! time. The loop itself never awaits I/O: persistence and fan-out for an
//! inbound envelope run in a task spawned per message.
//!
//! Reads of the registry (fan-out lookups) happen from any task through the
//! DashMap; each lookup clones the user's handles and releases the shard
//! lock before a single frame is queued.

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

use crate::chat::broadcast::presence_event;
use crate::chat::presence::{PresenceStatus, PresenceStore};
use crate::db::models::User;
use crate::push::{self, PushNotifier};
use crate::repo::{ChatRepository, MessageRepository, SqliteStore, UserRepository};
use crate::ws::connection::{ConnectionHandle, SendError};
use crate::ws::envelope::{self, ChatMessageBody, Envelope, MessageType};
use crate::ws::typing::TypingState;

/// Capability set injected into the hub.
#[derive(Clone)]
pub struct Collaborators {
    pub messages: Arc<dyn MessageRepository>,
    pub chats: Arc<dyn ChatRepository>,
    pub users: Arc<dyn UserRepository>,
    pub push: Arc<dyn PushNotifier>,
}

impl Collaborators {
    /// Wire every repository to the same SQLite store.
    pub fn from_store(store: SqliteStore, push: Arc<dyn PushNotifier>) -> Self {
        let store = Arc::new(store);
        Self {
            messages: store.clone(),
            chats: store.clone(),
            users: store,
            push,
        }
    }
}

enum HubEvent {
    Register(ConnectionHandle),
    Unregister(ConnectionHandle),
    Inbound(Envelope),
    Flush(oneshot::Sender<()>),
}

struct Shared {
    /// user_id -> live connections, in registration order
    clients: DashMap<i64, Vec<ConnectionHandle>>,
    typing: TypingState,
    presence: PresenceStore,
    deps: Collaborators,
    events: mpsc::Sender<HubEvent>,
}

/// Handle to the hub. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

impl Hub {
    /// Create the hub and spawn its coordinating loop.
    /// The loop stops once every `Hub` clone has been dropped.
    pub fn start(deps: Collaborators, event_capacity: usize) -> Self {
        let (events, rx) = mpsc::channel(event_capacity.max(1));
        let shared = Arc::new(Shared {
            clients: DashMap::new(),
            typing: TypingState::new(),
            presence: PresenceStore::new(),
            deps,
            events,
        });
        tokio::spawn(run_loop(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    // --- Event submission ---

    pub async fn register(&self, conn: ConnectionHandle) {
        self.submit(HubEvent::Register(conn)).await;
    }

    pub async fn unregister(&self, conn: ConnectionHandle) {
        self.submit(HubEvent::Unregister(conn)).await;
    }

    /// Queue an envelope read from a connection for dispatch.
    pub async fn inbound(&self, envelope: Envelope) {
        self.submit(HubEvent::Inbound(envelope)).await;
    }

    /// Wait until every event submitted before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(HubEvent::Flush(tx)).await;
        let _ = rx.await;
    }

    async fn submit(&self, event: HubEvent) {
        if self.shared.events.send(event).await.is_err() {
            tracing::error!("Hub loop is gone, event dropped");
        }
    }

    // --- Registry queries ---

    pub fn is_online(&self, user_id: i64) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn connection_count(&self, user_id: i64) -> usize {
        self.shared
            .clients
            .get(&user_id)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.shared.presence
    }

    pub fn users(&self) -> &Arc<dyn UserRepository> {
        &self.shared.deps.users
    }

    pub(crate) fn messages(&self) -> &Arc<dyn MessageRepository> {
        &self.shared.deps.messages
    }

    pub(crate) fn chats(&self) -> &Arc<dyn ChatRepository> {
        &self.shared.deps.chats
    }

    pub fn typing(&self) -> &TypingState {
        &self.shared.typing
    }

    /// Snapshot of a user's open connections; the shard lock is released on return.
    fn connections_of(&self, user_id: i64) -> Vec<ConnectionHandle> {
        self.shared
            .clients
            .get(&user_id)
            .map(|entry| entry.value().iter().filter(|c| c.is_open()).cloned().collect())
            .unwrap_or_default()
    }

    // --- Registry mutation (only called from the loop) ---

    fn handle_event(&self, event: HubEvent) {
        match event {
            HubEvent::Register(conn) => self.add_connection(conn),
            HubEvent::Unregister(conn) => self.remove_connection(&conn),
            HubEvent::Inbound(envelope) => {
                let hub = self.clone();
                tokio::spawn(async move { hub.dispatch(envelope).await });
            }
            HubEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn add_connection(&self, conn: ConnectionHandle) {
        if !conn.is_open() {
            tracing::debug!(connection_id = %conn.id(), "Skipping registration of closed connection");
            return;
        }
        let user_id = conn.user_id();

        let count = {
            let mut entry = self.shared.clients.entry(user_id).or_default();
            entry.push(conn.clone());
            entry.len()
        };

        tracing::debug!(
            user_id = user_id,
            connection_id = %conn.id(),
            connections = count,
            "Connection registered"
        );

        if count == 1 {
            self.shared.presence.set_online(user_id);
            self.broadcast_presence(user_id, PresenceStatus::Online, None);
        }
    }

    fn remove_connection(&self, conn: &ConnectionHandle) {
        let user_id = conn.user_id();
        conn.close();

        let (removed, now_empty) = match self.shared.clients.get_mut(&user_id) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|c| c.id() != conn.id());
                (entry.len() < before, entry.is_empty())
            }
            None => (false, false),
        };
        if now_empty {
            self.shared.clients.remove_if(&user_id, |_, conns| conns.is_empty());
        }
        if !removed {
            return;
        }

        tracing::debug!(
            user_id = user_id,
            connection_id = %conn.id(),
            "Connection unregistered"
        );

        if now_empty {
            self.user_went_offline(user_id);
        }
    }

    fn user_went_offline(&self, user_id: i64) {
        let now = chrono::Utc::now().timestamp();
        self.shared.presence.set_offline(user_id, now);
        self.broadcast_presence(user_id, PresenceStatus::Offline, Some(now));

        let typing_chats = self.shared.typing.clear_user(user_id);

        // Repository calls leave the loop
        let hub = self.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.users().update_last_seen(user_id, now).await {
                tracing::warn!(user_id = user_id, error = %e, "Failed to persist last seen");
            }
            for chat_id in typing_chats {
                hub.fan_out_typing(user_id, chat_id, false).await;
            }
        });
    }

    /// Close every connection of a user (ban, forced logout).
    /// Each closed connection goes through the regular unregister path.
    pub async fn disconnect_user(&self, user_id: i64) -> usize {
        let mut closed = 0;
        for conn in self.connections_of(user_id) {
            if conn.close() {
                closed += 1;
                self.unregister(conn).await;
            }
        }
        tracing::info!(user_id = user_id, connections = closed, "User disconnected");
        closed
    }

    // --- Delivery ---

    /// Queue a frame on one connection. A full queue sheds the connection.
    fn deliver(&self, conn: &ConnectionHandle, frame: Message) -> bool {
        match conn.try_send(frame) {
            Ok(()) => true,
            Err(SendError::Full) => {
                tracing::warn!(
                    user_id = conn.user_id(),
                    connection_id = %conn.id(),
                    "Outbound queue full, disconnecting slow consumer"
                );
                self.shed(conn);
                false
            }
            Err(SendError::Closed) => false,
        }
    }

    fn shed(&self, conn: &ConnectionHandle) {
        if !conn.close() {
            return;
        }
        // If the event queue is saturated the connection task still unregisters on exit
        if self
            .shared
            .events
            .try_send(HubEvent::Unregister(conn.clone()))
            .is_err()
        {
            tracing::debug!(
                connection_id = %conn.id(),
                "Hub queue busy, deferring unregister to connection task"
            );
        }
    }

    /// Queue an envelope on a single connection (acks to heartbeats).
    pub fn send_to_connection(&self, conn: &ConnectionHandle, envelope: &Envelope) {
        match envelope::encode(envelope) {
            Ok(text) => {
                self.deliver(conn, Message::Text(text.into()));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode envelope"),
        }
    }

    /// Queue an envelope on every connection of `user_id`.
    ///
    /// With no open connection, a chat message authored by someone else
    /// triggers the offline push instead. Returns the number of connections
    /// the frame was queued on.
    pub async fn send_to_user(&self, user_id: i64, envelope: &Envelope) -> usize {
        let connections = self.connections_of(user_id);

        if connections.is_empty() {
            if envelope.header.kind == MessageType::ChatMessage
                && envelope.header.sender_id != user_id
            {
                self.push_offline(user_id, envelope).await;
            }
            return 0;
        }

        let frame = match envelope::encode(envelope) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode envelope");
                return 0;
            }
        };

        connections
            .iter()
            .filter(|conn| self.deliver(conn, frame.clone()))
            .count()
    }

    /// Deliver to every member of `chat_id` except the envelope's sender.
    pub async fn broadcast_to_chat_members(&self, chat_id: i64, envelope: &Envelope) {
        self.fan_out_where(chat_id, envelope, |_| true).await;
    }

    /// Deliver to chat members other than the sender whose user record passes `allow`.
    pub(crate) async fn fan_out_where<F>(&self, chat_id: i64, envelope: &Envelope, allow: F)
    where
        F: Fn(&User) -> bool,
    {
        let members = match self.chats().get_members(chat_id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(chat_id = chat_id, error = %e, "Failed to load chat members");
                return;
            }
        };

        for member in members {
            if member == envelope.header.sender_id {
                continue;
            }
            let allowed = match self.users().get_by_id(member).await {
                Ok(Some(user)) => allow(&user),
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(user_id = member, error = %e, "Failed to load chat member");
                    false
                }
            };
            if allowed {
                self.send_to_user(member, envelope).await;
            }
        }
    }

    /// Best-effort delivery to every connected user except the envelope's sender.
    pub fn broadcast_to_all(&self, envelope: &Envelope) {
        let frame = match envelope::encode(envelope) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode envelope");
                return;
            }
        };

        let targets: Vec<ConnectionHandle> = self
            .shared
            .clients
            .iter()
            .filter(|entry| *entry.key() != envelope.header.sender_id)
            .flat_map(|entry| entry.value().clone())
            .collect();

        for conn in &targets {
            self.deliver(conn, frame.clone());
        }
    }

    fn broadcast_presence(&self, user_id: i64, status: PresenceStatus, last_seen: Option<i64>) {
        match presence_event(user_id, status, last_seen) {
            Ok(envelope) => self.broadcast_to_all(&envelope),
            Err(e) => tracing::warn!(error = %e, "Failed to build presence event"),
        }
    }

    async fn push_offline(&self, user_id: i64, envelope: &Envelope) {
        let header = &envelope.header;
        let body: ChatMessageBody = match envelope.body_as() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "Chat message body unreadable for push");
                return;
            }
        };

        let title = match self.users().get_by_id(header.sender_id).await {
            Ok(Some(sender)) => sender.username,
            _ => "New message".to_string(),
        };
        let preview = push::preview(&body.message_type, &body.content);

        let mut data = HashMap::new();
        data.insert("type".to_string(), "chat_message".to_string());
        data.insert("message_id".to_string(), header.message_id.clone());
        data.insert("sender_id".to_string(), header.sender_id.to_string());
        if let Some(chat_id) = header.chat_id {
            data.insert("chat_id".to_string(), chat_id.to_string());
        }

        if let Err(e) = self
            .shared
            .deps
            .push
            .send_notification(user_id, &title, &preview, data)
            .await
        {
            tracing::warn!(user_id = user_id, error = %e, "Push notification failed");
        }
    }
}

async fn run_loop(shared: Weak<Shared>, mut events: mpsc::Receiver<HubEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        Hub { shared }.handle_event(event);
    }
    tracing::debug!("Hub loop stopped");
}
