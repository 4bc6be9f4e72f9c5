//! Per-process chat fan-out.
//!
//! One [`Broadcaster`] is built per worker process. It owns the connection
//! registry and talks to the shared [`MessageStore`]. A message is only
//! fanned out after the store has accepted it.

use std::sync::Arc;

use mercado_core::clock::Clock;
use mercado_core::ids::ConnectionId;
use mercado_core::messages::{ChatMessage, IncomingMessage, NewMessage};
use mercado_core::normalize::NormalizedMessages;
use mercado_core::protocol::{ClientEvent, ErrorKind, ServerEvent};
use mercado_store::{MessageStore, StoreError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ServerError;
use crate::registry::ConnectionRegistry;

/// A connection that completed the history handshake.
pub struct OpenedConnection {
    pub id: ConnectionId,
    /// Serialized `messages` frame. Must reach the socket before anything
    /// queued on `rx`.
    pub history: String,
    pub rx: mpsc::Receiver<String>,
}

/// What became of one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Saved and fanned out to this many connections.
    Broadcast { delivered: usize },
    /// The store refused the write; only the sender was told.
    SaveFailed,
    /// Not a recognised client event.
    Rejected,
}

pub struct Broadcaster {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(store: Arc<dyn MessageStore>, clock: Arc<dyn Clock>, max_send_queue: usize) -> Self {
        Self {
            store,
            clock,
            registry: Arc::new(ConnectionRegistry::new(max_send_queue)),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Connecting -> Active.
    ///
    /// The connection is registered before history is read so broadcasts
    /// issued meanwhile are queued rather than lost. If the store cannot be
    /// read the connection is unregistered and the error returned; the
    /// caller reports it to the client and closes the socket.
    #[instrument(skip(self))]
    pub async fn open(&self) -> Result<OpenedConnection, ServerError> {
        let (id, rx) = self.registry.register();
        info!(connection_id = %id, "new client connected");

        let history = match self.store.get_all().await {
            Ok(messages) => NormalizedMessages::from_messages(messages),
            Err(e) => {
                warn!(connection_id = %id, error = %e, "history fetch failed, closing connection");
                self.registry.unregister(&id);
                return Err(e.into());
            }
        };

        let frame = match ServerEvent::Messages(history).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                self.registry.unregister(&id);
                return Err(e.into());
            }
        };

        self.registry.activate(&id);
        debug!(connection_id = %id, "history ready");
        Ok(OpenedConnection { id, history: frame, rx })
    }

    /// Active -> Closed.
    pub fn close(&self, id: &ConnectionId) {
        if self.registry.unregister(id) {
            info!(connection_id = %id, "client disconnected");
        }
    }

    /// Handle one inbound text frame from `from`.
    #[instrument(skip(self, from, raw), fields(connection_id = %from))]
    pub async fn handle_frame(&self, from: &ConnectionId, raw: &str) -> FrameOutcome {
        match ClientEvent::parse(raw) {
            Ok(ClientEvent::Message(incoming)) => match self.publish(from, incoming).await {
                Ok((_, delivered)) => FrameOutcome::Broadcast { delivered },
                Err(_) => FrameOutcome::SaveFailed,
            },
            Err(e) => {
                warn!(error = %e, "invalid client frame");
                self.send_error(from, ErrorKind::InvalidPayload, e.to_string());
                FrameOutcome::Rejected
            }
        }
    }

    /// Stamp, persist, then fan out. Nothing is broadcast unless the save
    /// succeeded; on failure only the sender receives an error frame.
    pub async fn publish(
        &self,
        from: &ConnectionId,
        incoming: IncomingMessage,
    ) -> Result<(ChatMessage, usize), StoreError> {
        let message = NewMessage::stamp(incoming, self.clock.as_ref());

        let saved = match self.store.save(message).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(connection_id = %from, error = %e, "message save failed");
                self.send_error(from, ErrorKind::StoreUnavailable, e.to_string());
                return Err(e);
            }
        };

        let delivered = self.fan_out(&ServerEvent::Message(saved.clone()));
        debug!(message_id = %saved.id, delivered, "message broadcast");
        Ok((saved, delivered))
    }

    /// Send one event to every connection on this process.
    pub fn fan_out(&self, event: &ServerEvent) -> usize {
        match event.to_json() {
            Ok(frame) => self.registry.broadcast_all(&frame),
            Err(e) => {
                error!(event = event.name(), error = %e, "failed to serialize event");
                0
            }
        }
    }

    /// Send an `error` event to one connection.
    pub fn send_error(&self, to: &ConnectionId, kind: ErrorKind, message: impl Into<String>) -> bool {
        self.notify(to, ServerEvent::error(kind, message))
    }

    fn notify(&self, to: &ConnectionId, event: ServerEvent) -> bool {
        let frame = match event.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!(event = event.name(), error = %e, "failed to serialize event");
                return false;
            }
        };
        let queued = self.registry.send_to(to, frame);
        if !queued {
            warn!(connection_id = %to, event = event.name(), "connection gone, event not delivered");
        }
        queued
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use mercado_core::clock::FixedClock;
    use mercado_core::protocol::ErrorPayload;
    use mercado_store::{Database, SqliteMessageStore};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    /// Store whose reads and writes can be switched off or slowed down.
    pub(crate) struct FlakyStore {
        inner: SqliteMessageStore,
        pub(crate) fail_reads: AtomicBool,
        pub(crate) fail_writes: AtomicBool,
        pub(crate) save_delay_ms: AtomicU64,
    }

    impl FlakyStore {
        pub(crate) fn new() -> Self {
            Self {
                inner: SqliteMessageStore::new(Database::in_memory().unwrap()),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                save_delay_ms: AtomicU64::new(0),
            }
        }

        pub(crate) fn stored(&self) -> usize {
            self.inner.repo().list().unwrap().len()
        }
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn get_all(&self) -> Result<Vec<ChatMessage>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.get_all().await
        }

        async fn save(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            let saved = self.inner.save(message).await?;
            let delay = self.save_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(saved)
        }
    }

    pub(crate) fn fixed_clock() -> Arc<FixedClock> {
        let naive = NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(18, 30, 0)
            .unwrap();
        Arc::new(FixedClock::from_local(naive).unwrap())
    }

    fn setup() -> (Arc<FlakyStore>, Broadcaster) {
        let store = Arc::new(FlakyStore::new());
        let broadcaster = Broadcaster::new(store.clone(), fixed_clock(), 32);
        (store, broadcaster)
    }

    fn incoming(author: &str, text: &str) -> IncomingMessage {
        IncomingMessage {
            author: author.into(),
            text: text.into(),
        }
    }

    fn frame(event: &str, data: serde_json::Value) -> String {
        serde_json::json!({ "event": event, "data": data }).to_string()
    }

    fn parse(frame: &str) -> ServerEvent {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn open_sends_empty_history() {
        let (_, b) = setup();
        let opened = b.open().await.unwrap();
        match parse(&opened.history) {
            ServerEvent::Messages(history) => assert!(history.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(b.registry().active_count(), 1);
    }

    #[tokio::test]
    async fn history_matches_saved_messages() {
        let (store, b) = setup();
        let sender = b.open().await.unwrap();

        let (first, _) = b.publish(&sender.id, incoming("alice", "one")).await.unwrap();
        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(b.publish(&sender.id, incoming("alice", "lost")).await.is_err());
        store.fail_writes.store(false, Ordering::SeqCst);
        let (second, _) = b.publish(&sender.id, incoming("bob", "two")).await.unwrap();

        let late = b.open().await.unwrap();
        let ServerEvent::Messages(history) = parse(&late.history) else {
            panic!("expected history frame");
        };
        assert_eq!(history.ids, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(history.entities.len(), 2);
        assert_eq!(history.entities[&first.id], first);
        assert_eq!(history.entities[&second.id], second);
    }

    #[tokio::test]
    async fn fan_out_reaches_all_connections_once() {
        let (_, b) = setup();
        let mut a = b.open().await.unwrap();
        let mut bb = b.open().await.unwrap();
        let mut c = b.open().await.unwrap();

        let outcome = b
            .handle_frame(&a.id, &frame("message", serde_json::json!({"author": "alice", "text": "hi"})))
            .await;
        assert_eq!(outcome, FrameOutcome::Broadcast { delivered: 3 });

        for conn in [&mut a, &mut bb, &mut c] {
            let ServerEvent::Message(m) = parse(&conn.rx.try_recv().unwrap()) else {
                panic!("expected message frame");
            };
            assert_eq!(m.author, "alice");
            assert_eq!(m.text, "hi");
            assert_eq!(m.timestamp, "17/05/2024 18:30:00");
            assert!(conn.rx.try_recv().is_err(), "received twice");
        }
    }

    #[tokio::test]
    async fn failed_save_is_never_broadcast() {
        let (store, b) = setup();
        let mut sender = b.open().await.unwrap();
        let mut other = b.open().await.unwrap();
        store.fail_writes.store(true, Ordering::SeqCst);

        let outcome = b
            .handle_frame(&sender.id, &frame("message", serde_json::json!({"author": "alice", "text": "hi"})))
            .await;
        assert_eq!(outcome, FrameOutcome::SaveFailed);

        match parse(&sender.rx.try_recv().unwrap()) {
            ServerEvent::Error(ErrorPayload { kind, .. }) => assert_eq!(kind, ErrorKind::StoreUnavailable),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sender.rx.try_recv().is_err());
        assert!(other.rx.try_recv().is_err());

        store.fail_writes.store(false, Ordering::SeqCst);
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_failure_unregisters() {
        let (store, b) = setup();
        store.fail_reads.store(true, Ordering::SeqCst);

        let result = b.open().await;
        assert!(matches!(result, Err(ServerError::Store(StoreError::Unavailable(_)))));
        assert_eq!(b.connection_count(), 0);
    }

    #[tokio::test]
    async fn invalid_frame_rejected_to_sender_only() {
        let (_, b) = setup();
        let mut sender = b.open().await.unwrap();
        let mut other = b.open().await.unwrap();

        let outcome = b.handle_frame(&sender.id, r#"{"event":"message","data":{"author":"x"}}"#).await;
        assert_eq!(outcome, FrameOutcome::Rejected);

        match parse(&sender.rx.try_recv().unwrap()) {
            ServerEvent::Error(payload) => assert_eq!(payload.kind, ErrorKind::InvalidPayload),
            other => panic!("unexpected {other:?}"),
        }
        assert!(other.rx.try_recv().is_err());
        assert_eq!(b.registry().active_count(), 2);
    }

    #[tokio::test]
    async fn broadcast_during_connect_is_queued_after_history() {
        let (_, b) = setup();
        let sender = b.open().await.unwrap();

        // Registered but still Connecting: the frame waits in its queue.
        let (pending_id, mut pending_rx) = b.registry().register();
        b.publish(&sender.id, incoming("alice", "early")).await.unwrap();
        assert!(pending_rx.try_recv().unwrap().contains("early"));
        b.close(&pending_id);
    }

    #[tokio::test]
    async fn close_removes_connection() {
        let (_, b) = setup();
        let a = b.open().await.unwrap();
        let mut other = b.open().await.unwrap();
        b.close(&a.id);
        assert_eq!(b.connection_count(), 1);

        let (_, delivered) = b.publish(&other.id, incoming("bob", "still here")).await.unwrap();
        assert_eq!(delivered, 1);
        assert!(other.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn per_connection_order_follows_arrival() {
        let (store, b) = setup();
        let mut conn = b.open().await.unwrap();
        for i in 0..5 {
            b.handle_frame(&conn.id, &frame("message", serde_json::json!({"author": "a", "text": format!("m{i}")})))
                .await;
        }
        let mut texts = Vec::new();
        while let Ok(f) = conn.rx.try_recv() {
            if let ServerEvent::Message(m) = parse(&f) {
                texts.push(m.text);
            }
        }
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
        let stored: Vec<String> = store.get_all().await.unwrap().into_iter().map(|m| m.text).collect();
        assert_eq!(stored, texts);
    }

    #[tokio::test]
    async fn sender_leaving_mid_save_still_broadcasts() {
        let (store, broadcaster) = setup();
        let broadcaster = Arc::new(broadcaster);
        let alice = broadcaster.open().await.unwrap();
        let mut bob = broadcaster.open().await.unwrap();
        store.save_delay_ms.store(200, Ordering::SeqCst);

        let publishing = tokio::spawn({
            let broadcaster = Arc::clone(&broadcaster);
            let from = alice.id.clone();
            async move { broadcaster.publish(&from, incoming("alice", "bye")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        broadcaster.close(&alice.id);

        let (saved, delivered) = publishing.await.unwrap().unwrap();
        assert_eq!(delivered, 1);
        let frame = bob.rx.recv().await.unwrap();
        assert_eq!(frame, ServerEvent::Message(saved).to_json().unwrap());
        assert_eq!(store.stored(), 1);
    }

    #[tokio::test]
    async fn error_to_departed_sender_is_reported_undelivered() {
        let (store, broadcaster) = setup();
        let alice = broadcaster.open().await.unwrap();
        broadcaster.close(&alice.id);

        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(broadcaster.publish(&alice.id, incoming("alice", "lost")).await.is_err());
        assert!(!broadcaster.send_error(&alice.id, ErrorKind::StoreUnavailable, "down"));
    }

    #[tokio::test]
    async fn send_error_reaches_only_target() {
        let (_, broadcaster) = setup();
        let mut alice = broadcaster.open().await.unwrap();
        let mut bob = broadcaster.open().await.unwrap();

        assert!(broadcaster.send_error(&alice.id, ErrorKind::StoreUnavailable, "busy"));
        let frame: serde_json::Value = serde_json::from_str(&alice.rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["data"]["message"], "busy");
        assert!(bob.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timestamp_taken_when_message_arrives() {
        let clock = fixed_clock();
        let b = Broadcaster::new(Arc::new(FlakyStore::new()), clock.clone(), 8);
        let sender = b.open().await.unwrap();

        let (first, _) = b.publish(&sender.id, incoming("alice", "hi")).await.unwrap();
        let later = NaiveDate::from_ymd_opt(2024, 5, 18)
            .unwrap()
            .and_hms_opt(7, 0, 5)
            .unwrap();
        clock.set(FixedClock::from_local(later).unwrap().now());
        let (second, _) = b.publish(&sender.id, incoming("alice", "morning")).await.unwrap();

        assert_eq!(first.timestamp, "17/05/2024 18:30:00");
        assert_eq!(second.timestamp, "18/05/2024 07:00:05");
    }
}
