use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{ws::{Message, WebSocket}, Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::ErrorBody,
    events::{ClientRequest, ServerEvent},
    gateway::Gateway,
    AppResult, ChatError,
};

#[derive(Deserialize)]
pub(crate) struct ConnectQuery {
    username: Option<String>,
}

/// Identity is taken as given; a connection without one never opens.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn room_ws(
    Query(ConnectQuery { username }): Query<ConnectQuery>,
    State(gateway): State<Arc<Gateway>>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let identity = username.unwrap_or_default().trim().to_owned();
    if identity.is_empty() {
        warn!("refusing connection without identity");
        return Err(ChatError::MissingIdentity.into());
    }

    Ok(ws.on_upgrade(move |stream| serve(gateway, identity, stream)).into_response())
}

async fn serve(gateway: Arc<Gateway>, identity: String, stream: WebSocket) {
    let conn_id = Uuid::now_v7();

    // subscribe before the session exists so nothing addressed to it is missed
    let mut rx = gateway.presence.subscribe();
    if let Err(err) = gateway.connect(conn_id, &identity).await {
        warn!(%conn_id, error = %err, "connection rejected");
        return;
    }

    let (mut sender, mut receiver) = stream.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut forward_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(event) => event,
                    None => break,
                },
                envelope = rx.recv() => match envelope {
                    Ok(envelope) if envelope.is_for(conn_id) => envelope.event,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%conn_id, skipped, "connection fell behind the broadcast channel");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%conn_id, error = %err, "could not encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        // handled to completion here; a disconnect is only noticed on the next read
        let event = match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => gateway.handle(conn_id, request).await,
            Err(err) => {
                debug!(%conn_id, error = %err, "bad frame");
                ServerEvent::Error {
                    error: ErrorBody { kind: "bad_request", message: err.to_string(), retryable: false },
                }
            }
        };
        if reply_tx.send(event).is_err() {
            break;
        }
    }

    gateway.disconnect(conn_id);
    drop(reply_tx);

    // let queued replies and the disconnect notice drain before giving up on the socket
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut forward_task).await.is_err() {
        forward_task.abort();
    }
    info!(%conn_id, identity = %identity, "connection finished");
}
