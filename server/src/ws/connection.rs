use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant};

use crate::ws::envelope::{self, AckStatus, Envelope, MessageType};
use crate::ws::hub::Hub;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection liveness. Moves forward only: Open -> Closing -> Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Timing and sizing for one live connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub send_queue_capacity: usize,
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            ping_period: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_frame_bytes: 512 * 1024,
        }
    }
}

/// Cloneable handle to one device's session.
///
/// The hub keeps one clone in its registry; the connection's own tasks keep
/// the others. Frames pushed through `try_send` land in the bounded queue
/// drained by the write loop.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: i64,
    device_id: Arc<str>,
    outbound: mpsc::Sender<Message>,
    liveness: Arc<watch::Sender<Liveness>>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(user_id: i64, device_id: &str, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let (liveness, _) = watch::channel(Liveness::Open);
        let handle = Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            user_id,
            device_id: Arc::from(device_id),
            outbound,
            liveness: Arc::new(liveness),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.liveness() == Liveness::Open
    }

    /// Non-blocking enqueue. Never waits on a slow peer.
    pub fn try_send(&self, frame: Message) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Begin teardown. Returns true only for the call that performed the
    /// Open -> Closing transition, so concurrent closers cannot double-close.
    pub fn close(&self) -> bool {
        self.liveness.send_if_modified(|state| {
            if *state == Liveness::Open {
                *state = Liveness::Closing;
                true
            } else {
                false
            }
        })
    }

    fn mark_closed(&self) {
        self.liveness.send_replace(Liveness::Closed);
    }

    /// Resolves once the connection has left the Open state.
    pub async fn closed(&self) {
        let mut rx = self.liveness.subscribe();
        let _ = rx.wait_for(|state| *state != Liveness::Open).await;
    }
}

/// Drive an authenticated WebSocket until it dies.
///
/// Splits the socket into a read loop (this task) and a write loop (spawned),
/// joined by the handle's bounded queue:
/// - Writer: owns the sink, drains the queue, sends keepalive pings
/// - Reader: decodes frames, answers heartbeats, forwards envelopes to the hub
///
/// Whichever side fails first closes the handle; the other observes it and exits.
pub async fn run_connection(
    socket: WebSocket,
    hub: Hub,
    handle: ConnectionHandle,
    outbound_rx: mpsc::Receiver<Message>,
    limits: ConnectionLimits,
) {
    let (ws_sender, mut ws_receiver) = socket.split();

    hub.register(handle.clone()).await;

    tracing::info!(
        user_id = handle.user_id(),
        connection_id = %handle.id(),
        device_id = %handle.device_id(),
        "Connection started"
    );

    let writer = tokio::spawn(write_loop(ws_sender, outbound_rx, handle.clone(), limits));

    read_loop(&mut ws_receiver, &hub, &handle, limits.pong_wait).await;

    handle.close();
    hub.unregister(handle.clone()).await;
    let _ = writer.await;

    tracing::info!(
        user_id = handle.user_id(),
        connection_id = %handle.id(),
        "Connection stopped"
    );
}

/// Reader: every received frame (data, ping or pong) resets the read deadline.
async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    hub: &Hub,
    handle: &ConnectionHandle,
    pong_wait: Duration,
) {
    let closed = handle.closed();
    tokio::pin!(closed);

    loop {
        let next = tokio::select! {
            _ = &mut closed => break,
            next = timeout(pong_wait, ws_receiver.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::warn!(
                    user_id = handle.user_id(),
                    connection_id = %handle.id(),
                    "Read deadline exceeded, closing connection"
                );
                break;
            }
            Ok(None) => {
                tracing::info!(user_id = handle.user_id(), "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(
                    user_id = handle.user_id(),
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => {
                    handle_frame(text.as_str().as_bytes(), hub, handle).await;
                }
                Message::Binary(data) => {
                    handle_frame(&data, hub, handle).await;
                }
                Message::Ping(data) => {
                    let _ = handle.try_send(Message::Pong(data));
                }
                Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = handle.user_id(),
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
        }
    }
}

/// Decode one frame, stamp the authenticated sender and hand it to the hub.
async fn handle_frame(data: &[u8], hub: &Hub, handle: &ConnectionHandle) {
    let mut envelope = match envelope::decode(data) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(
                user_id = handle.user_id(),
                error = %e,
                "Dropping malformed frame"
            );
            return;
        }
    };

    // Never trust a client-supplied sender
    envelope.header.sender_id = handle.user_id();

    if envelope.header.kind == MessageType::Heartbeat {
        match Envelope::ack(
            &envelope.header.message_id,
            handle.user_id(),
            AckStatus::Ok,
            None,
        ) {
            Ok(ack) => hub.send_to_connection(handle, &ack),
            Err(e) => tracing::warn!(error = %e, "Failed to build heartbeat ack"),
        }
        return;
    }

    hub.inbound(envelope).await;
}

/// Writer: forwards queued frames to the sink and pings every `ping_period`.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    handle: ConnectionHandle,
    limits: ConnectionLimits,
) {
    let mut ping_timer = interval_at(Instant::now() + limits.ping_period, limits.ping_period);
    let closed = handle.closed();
    tokio::pin!(closed);

    loop {
        let frame = tokio::select! {
            _ = &mut closed => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping_timer.tick() => Message::Ping(vec![1, 2, 3, 4].into()),
        };

        match timeout(limits.write_wait, ws_sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(
                    user_id = handle.user_id(),
                    error = %e,
                    "WebSocket send failed"
                );
                break;
            }
            Err(_) => {
                tracing::warn!(
                    user_id = handle.user_id(),
                    "Write deadline exceeded, closing connection"
                );
                break;
            }
        }
    }

    rx.close();
    handle.close();
    let _ = timeout(limits.write_wait, ws_sender.send(Message::Close(None))).await;
    let _ = ws_sender.close().await;
    handle.mark_closed();
}
