use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use mercado_core::protocol::{ErrorKind, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::broadcaster::Broadcaster;

/// Inbound frames read off the socket but not yet handled.
const INBOUND_QUEUE: usize = 64;

/// Drive one upgraded socket through Connecting -> Active -> Closed.
///
/// History is written straight to the socket before the writer starts
/// draining the connection queue, so it always arrives first.
///
/// Three tasks per connection:
/// - writer: drains the outbound queue and sends pings;
/// - reader: reads the socket, refreshes liveness, queues text frames;
/// - handler: saves and fans out queued frames one at a time.
///
/// The handler is never cancelled. Once the socket is gone it finishes the
/// frames already read, so a message that reached the store is always
/// fanned out to the remaining connections.
pub async fn serve_connection(socket: WebSocket, broadcaster: Arc<Broadcaster>, heartbeat: Duration) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let opened = match broadcaster.open().await {
        Ok(opened) => opened,
        Err(e) => {
            let event = ServerEvent::error(ErrorKind::StoreUnavailable, e.to_string());
            if let Ok(frame) = event.to_json() {
                let _ = ws_tx.send(WsMessage::Text(frame.into())).await;
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let id = opened.id;
    let mut rx = opened.rx;

    if ws_tx.send(WsMessage::Text(opened.history.into())).await.is_err() {
        debug!(connection_id = %id, "client went away before history was delivered");
        broadcaster.close(&id);
        return;
    }

    // Writer: queued frames plus periodic ping
    let writer_id = id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        // Unregistered (closed or timed out)
                        None => {
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(connection_id = %writer_id, "sent ping");
                }
            }
        }
    });

    // Handler: sequential per connection, runs to completion
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<String>(INBOUND_QUEUE);
    let handler_id = id.clone();
    let handler_broadcaster = Arc::clone(&broadcaster);
    tokio::spawn(async move {
        while let Some(text) = inbound_rx.recv().await {
            handler_broadcaster.handle_frame(&handler_id, &text).await;
        }
        trace!(connection_id = %handler_id, "handler drained");
    });

    // Reader: never waits on the store
    let reader_id = id.clone();
    let reader_broadcaster = Arc::clone(&broadcaster);
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let registry = reader_broadcaster.registry();
            match frame {
                Ok(WsMessage::Text(text)) => {
                    registry.mark_alive(&reader_id);
                    if let Err(mpsc::error::TrySendError::Full(_)) =
                        inbound_tx.try_send(text.as_str().to_owned())
                    {
                        warn!(connection_id = %reader_id, "inbound queue full, refusing message");
                        reader_broadcaster.send_error(
                            &reader_id,
                            ErrorKind::StoreUnavailable,
                            "server busy, message not saved",
                        );
                    }
                }
                Ok(WsMessage::Pong(_)) => registry.mark_alive(&reader_id),
                Ok(WsMessage::Close(_)) => break,
                Ok(WsMessage::Binary(_)) => {
                    warn!(connection_id = %reader_id, "binary frame ignored");
                }
                Ok(WsMessage::Ping(_)) => registry.mark_alive(&reader_id), // axum answers pings itself
                Err(e) => {
                    debug!(connection_id = %reader_id, error = %e, "socket read failed");
                    break;
                }
            }
        }
    });

    // Aborting the reader only stops socket reads; queued frames still
    // reach the handler.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {},
    }

    broadcaster.close(&id);
}
