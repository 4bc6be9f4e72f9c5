use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mercado_core::ids::ConnectionId;
use tokio::sync::mpsc;

/// Lifecycle of one chat connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, history not yet delivered.
    Connecting,
    Active,
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Active => 1,
            Self::Closed => 2,
        }
    }
}

/// A live socket attached to this process.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    state: AtomicU8,
    /// Unix millis of the last pong or inbound frame.
    last_seen: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            last_seen: AtomicU64::new(now_millis()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn mark_alive(&self) {
        self.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_seen.load(Ordering::Relaxed);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        now_millis().saturating_sub(last) < timeout_ms
    }

    /// Queue a frame without waiting. Returns false if the frame was dropped.
    fn push(&self, frame: String) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

fn now_millis() -> u64 {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
}

/// Every connection attached to this process. Never shared across processes.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection in the `Connecting` state.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections
            .insert(id.clone(), Arc::new(Connection::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn activate(&self, id: &ConnectionId) -> bool {
        match self.connections.get(id) {
            Some(conn) => {
                conn.set_state(ConnectionState::Active);
                true
            }
            None => false,
        }
    }

    /// Remove a connection. Dropping its sender ends the socket writer.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        match self.connections.remove(id) {
            Some((_, conn)) => {
                conn.set_state(ConnectionState::Closed);
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.connections.get(id).map(|c| c.state())
    }

    pub fn mark_alive(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.mark_alive();
        }
    }

    /// Queue a frame for one connection.
    pub fn send_to(&self, id: &ConnectionId, frame: String) -> bool {
        match self.connections.get(id) {
            Some(conn) => conn.push(frame),
            None => false,
        }
    }

    /// Queue the same frame on every registered connection.
    /// Returns how many queues accepted it.
    pub fn broadcast_all(&self, frame: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().push(frame.to_string()))
            .count()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn active_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Active)
            .count()
    }

    /// Remove connections silent (no pong, no frame) for `timeout`.
    pub fn cleanup_dead(&self, timeout: Duration) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "dropped unresponsive connection");
        }
        dead.len()
    }
}

/// Start a background task that periodically drops dead connections.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead(timeout);
            if removed > 0 {
                tracing::info!(removed, "dead connection cleanup");
            }
        }
    })
}
