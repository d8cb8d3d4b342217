//! WebSocket protocol adapter (spec §4.3.2).

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{info, warn};

use crate::error::{on_error, TransitError};
use crate::http::AppState;
use crate::metadata::{FileMetadata, WsFileHeader};
use crate::transfer::Transfer;

pub async fn send_handler(
    ws: axum::extract::WebSocketUpgrade,
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_send(socket, state, uid))
}

async fn close_with_error(socket: &mut WebSocket, msg: &str) {
    let _ = socket.send(Message::Text(format!("Error: {msg}"))).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1011,
            reason: msg.to_string().into(),
        })))
        .await;
}

async fn handle_send(mut socket: WebSocket, state: AppState, uid: String) {
    let header_msg = match socket.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            close_with_error(&mut socket, "Cannot decode file metadata JSON header.").await;
            return;
        }
    };

    let header: WsFileHeader = match serde_json::from_str(&header_msg) {
        Ok(h) => h,
        Err(_) => {
            close_with_error(&mut socket, "Cannot decode file metadata JSON header.").await;
            return;
        }
    };

    let file = match FileMetadata::from_ws_header(&header) {
        Ok(f) => f,
        Err(_) => {
            close_with_error(&mut socket, "Cannot decode file metadata JSON header.").await;
            return;
        }
    };

    let transfer = match Transfer::create(&state.store, &uid, file) {
        Ok(t) => t,
        Err(TransitError::Conflict(_)) => {
            close_with_error(&mut socket, "Transfer ID is already used.").await;
            return;
        }
        Err(e) => {
            close_with_error(&mut socket, &e.to_string()).await;
            return;
        }
    };

    if tokio::time::timeout(state.store.config.event_timeout, transfer.wait_for_client_connected())
        .await
        .is_err()
    {
        close_with_error(&mut socket, "Receiver did not connect in time.").await;
        return;
    }

    if socket.send(Message::Text("Go for file chunks".into())).await.is_err() {
        return;
    }

    info!(uid = %uid, "sender streaming");

    let (mut sink, stream) = socket.split();
    let byte_stream = stream.map(|msg| match msg {
        Ok(Message::Binary(data)) => Ok(bytes::Bytes::from(data)),
        Ok(Message::Close(_)) => Ok(bytes::Bytes::new()),
        Ok(_) => Ok(bytes::Bytes::new()),
        Err(_) => Err(()),
    });

    let error_slot: Arc<tokio::sync::Mutex<Option<TransitError>>> = Arc::new(tokio::sync::Mutex::new(None));
    let error_slot2 = error_slot.clone();
    let callback = on_error(move |e| {
        let error_slot2 = error_slot2.clone();
        async move {
            *error_slot2.lock().await = Some(e);
        }
    });

    let interrupted = transfer.collect_upload(Box::pin(byte_stream), callback).await;

    if interrupted {
        info!(uid = %uid, "receiver interrupted the transfer");
        let reason = "Transfer was interrupted by the receiver.";
        let _ = sink
            .send(Message::Close(Some(CloseFrame { code: 1000, reason: reason.into() })))
            .await;
        return;
    }

    let captured = error_slot.lock().await.take();
    if let Some(e) = captured {
        warn!(uid = %uid, error = %e, "upload failed");
        let _ = sink.send(Message::Text(format!("Error: {e}"))).await;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: e.close_code(),
                reason: e.to_string().into(),
            })))
            .await;
    }
}

/// Legacy receive-side endpoint (spec §4.3.2, marked deprecated in §9). Kept
/// because the spec allows implementations to include it as long as it
/// obeys the same receiver-slot claim semantics as the HTTP GET path.
pub async fn receive_handler(
    ws: axum::extract::WebSocketUpgrade,
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_receive(socket, state, uid))
}

async fn handle_receive(mut socket: WebSocket, state: AppState, uid: String) {
    let transfer = match Transfer::get(&state.store, &uid) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            close_with_error(&mut socket, &e.to_string()).await;
            return;
        }
    };

    let header = transfer.file.to_ws_header();
    if socket
        .send(Message::Text(serde_json::to_string(&header).unwrap()))
        .await
        .is_err()
    {
        return;
    }

    match socket.next().await {
        Some(Ok(Message::Text(text))) if text == "Go for file chunks" => {}
        _ => return,
    }

    if !transfer.set_receiver_connected() {
        close_with_error(&mut socket, "Receiver already connected.").await;
        return;
    }
    transfer.set_client_connected();

    let error_slot: Arc<tokio::sync::Mutex<Option<TransitError>>> = Arc::new(tokio::sync::Mutex::new(None));
    let error_slot2 = error_slot.clone();
    let callback = on_error(move |e| {
        let error_slot2 = error_slot2.clone();
        async move {
            *error_slot2.lock().await = Some(e);
        }
    });

    let stream = transfer.clone().supply_download(callback);
    futures::pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        if socket.send(Message::Binary(chunk.to_vec())).await.is_err() {
            state.store.set_interrupted(&uid);
            return;
        }
    }

    if let Some(e) = error_slot.lock().await.take() {
        warn!(uid = %uid, error = %e, "download failed");
    }

    let _ = socket.send(Message::Binary(Vec::new())).await;
}
