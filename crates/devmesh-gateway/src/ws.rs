//! WebSocket binding: `graphql-transport-ws`.
//!
//! Protocol: the client opens with `connection_init` (5 s deadline),
//! the gateway answers `connection_ack`, then each `subscribe` opens
//! one upstream subgraph stream whose frames flow back as `next`
//! messages until `complete`/`error`. Client `complete` or disconnect
//! cancels the matching upstream.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use devmesh_graphql::sse::StreamFrame;
use devmesh_graphql::transport_ws::{ClientMessage, ClientMessageType, CloseCode, ServerMessage};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::executor::RequestHeaders;
use crate::http::open_subscription;
use crate::state::GatewayState;

/// Connection initialization deadline per the protocol spec.
const CONNECTION_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

struct ActiveOperation {
    forwarder: tokio::task::JoinHandle<()>,
}

/// Drive one WebSocket connection.
pub async fn handle_socket(socket: WebSocket, state: GatewayState, headers: RequestHeaders) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(connection_id = %connection_id, "websocket connection established");

    let (mut sender, mut receiver) = socket.split();

    // Wait for connection_init.
    let init = tokio::time::timeout(CONNECTION_INIT_TIMEOUT, async {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) {
                        if client_msg.parsed_type() == Some(ClientMessageType::ConnectionInit) {
                            return true;
                        }
                    }
                }
                Ok(Message::Close(_)) | Err(_) => return false,
                _ => {}
            }
        }
        false
    })
    .await;

    match init {
        Ok(true) => {
            let ack = ServerMessage::connection_ack();
            if let Ok(text) = ack.to_json() {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
        }
        Ok(false) => {
            debug!(connection_id = %connection_id, "connection closed during init");
            return;
        }
        Err(_) => {
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code:   CloseCode::ConnectionInitTimeout.code(),
                    reason: CloseCode::ConnectionInitTimeout.reason().into(),
                })))
                .await;
            return;
        }
    }

    // Frames from upstream forwarders, tagged with the operation id.
    let (frames_tx, mut frames_rx) = mpsc::channel::<(String, StreamFrame)>(64);
    let mut operations: HashMap<String, ActiveOperation> = HashMap::new();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match handle_client_message(
                            &text,
                            &state,
                            &headers,
                            &frames_tx,
                            &mut operations,
                        )
                        .await
                        {
                            Ok(Some(reply)) => {
                                if let Ok(text) = reply.to_json() {
                                    if sender.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(code) => {
                                let _ = sender
                                    .send(Message::Close(Some(CloseFrame {
                                        code:   code.code(),
                                        reason: code.reason().into(),
                                    })))
                                    .await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection_id = %connection_id, "client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, error = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }

            Some((op_id, frame)) = frames_rx.recv() => {
                let outgoing = match frame {
                    StreamFrame::Next { payload } => ServerMessage::next(
                        &op_id,
                        serde_json::to_value(payload).unwrap_or_default(),
                    ),
                    StreamFrame::Error { errors } => {
                        operations.remove(&op_id);
                        ServerMessage::error(&op_id, errors)
                    }
                    StreamFrame::Complete => {
                        operations.remove(&op_id);
                        ServerMessage::complete(&op_id)
                    }
                };
                if let Ok(text) = outgoing.to_json() {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if let Ok(text) = ServerMessage::ping().to_json() {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Cancel every upstream on the way out; cancellation propagates to
    // the subgraphs when the forwarders drop their receivers.
    for (_, operation) in operations.drain() {
        operation.forwarder.abort();
    }
    info!(connection_id = %connection_id, "websocket connection closed");
}

async fn handle_client_message(
    text: &str,
    state: &GatewayState,
    headers: &RequestHeaders,
    frames_tx: &mpsc::Sender<(String, StreamFrame)>,
    operations: &mut HashMap<String, ActiveOperation>,
) -> Result<Option<ServerMessage>, CloseCode> {
    let message: ClientMessage =
        serde_json::from_str(text).map_err(|_| CloseCode::ProtocolError)?;

    match message.parsed_type() {
        Some(ClientMessageType::Subscribe) => {
            let op_id = message.id.clone().ok_or(CloseCode::ProtocolError)?;
            if operations.contains_key(&op_id) {
                return Err(CloseCode::SubscriberAlreadyExists);
            }
            let request = message
                .subscribe_request()
                .ok_or(CloseCode::ProtocolError)?;

            let correlation_id = headers
                .correlation_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            match open_subscription(
                state,
                &request,
                &correlation_id,
                headers.authorization.as_deref(),
            )
            .await
            {
                Ok(mut receiver) => {
                    let tx = frames_tx.clone();
                    let task_op_id = op_id.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(frame) = receiver.recv().await {
                            let terminal = frame.is_terminal();
                            if tx.send((task_op_id.clone(), frame)).await.is_err() {
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                        // Upstream pump ended without a terminal frame.
                        let _ = tx.send((task_op_id, StreamFrame::Complete)).await;
                    });
                    operations.insert(op_id, ActiveOperation { forwarder });
                }
                Err(err) => {
                    let _ = frames_tx
                        .send((
                            op_id,
                            StreamFrame::Error {
                                errors: vec![
                                    devmesh_graphql::request::WireError::from_error(&err),
                                ],
                            },
                        ))
                        .await;
                }
            }
        }

        Some(ClientMessageType::Complete) => {
            let op_id = message.id.ok_or(CloseCode::ProtocolError)?;
            if let Some(operation) = operations.remove(&op_id) {
                operation.forwarder.abort();
                debug!(operation_id = %op_id, "subscription completed by client");
            }
        }

        Some(ClientMessageType::Ping) => {
            return Ok(Some(ServerMessage::pong(message.payload)));
        }

        Some(ClientMessageType::Pong) => {}

        Some(ClientMessageType::ConnectionInit) => {
            return Err(CloseCode::TooManyInitRequests);
        }

        None => {
            // Unknown message types are ignored per the protocol.
        }
    }

    Ok(None)
}
