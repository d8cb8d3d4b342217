//! HTTP protocol adapter (spec §4.3.1).
//!
//! PUT and GET each translate to `Transfer` operations and map
//! `TransitError` onto the right HTTP surface. Upload errors before the
//! response starts become a status code; download errors after the
//! streaming body has started instead terminate the stream in place,
//! since headers can't be rewritten once sent (spec §7).

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{on_error, TransitError};
use crate::html::{self, is_crawler, is_curl};
use crate::metadata::FileMetadata;
use crate::store::Store;
use crate::transfer::Transfer;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub max_http_size: u64,
}

#[derive(Deserialize, Default)]
pub struct DownloadQuery {
    download: Option<bool>,
}

pub async fn put_upload(
    State(state): State<AppState>,
    Path((uid, filename)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, TransitError> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let file = FileMetadata::from_http(&filename, content_length, content_type)
        .map_err(TransitError::InvalidInput)?;

    if file.size > state.max_http_size {
        return Err(TransitError::TooLarge);
    }

    let transfer = Transfer::create(&state.store, &uid, file)?;

    tokio::time::timeout(state.store.config.event_timeout, transfer.wait_for_client_connected())
        .await
        .map_err(|_| TransitError::Timeout("Timeout waiting for receiver.".into()))??;

    use futures::TryStreamExt;
    let byte_stream = body
        .into_data_stream()
        .map_ok(|b| b)
        .map_err(|_| ());

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
        return Ok((StatusCode::OK, "Transfer was interrupted by the receiver.").into_response());
    }

    if let Some(e) = error_slot.lock().await.take() {
        warn!(uid = %uid, error = %e, "upload failed");
        return Err(e);
    }

    info!(uid = %uid, "upload finished");
    Ok((StatusCode::OK, "Transfer complete.").into_response())
}

pub async fn get_download(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, TransitError> {
    let transfer = Arc::new(Transfer::get(&state.store, &uid)?);

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if is_crawler(user_agent) {
        let page = html::preview_page(&transfer.file);
        return Ok(([(header::CONTENT_TYPE, "text/html")], page).into_response());
    }

    if !is_curl(user_agent) && query.download != Some(true) {
        let page = html::download_gate_page(&uid, &transfer.file);
        return Ok(([(header::CONTENT_TYPE, "text/html")], page).into_response());
    }

    if !transfer.set_receiver_connected() {
        return Err(TransitError::Conflict("Receiver already connected.".into()));
    }

    transfer.set_client_connected();
    info!(uid = transfer.uid(), phase = ?transfer.phase(), "receiver paired");

    let error_slot: Arc<tokio::sync::Mutex<Option<TransitError>>> = Arc::new(tokio::sync::Mutex::new(None));
    let error_slot2 = error_slot.clone();
    let callback = on_error(move |e| {
        let error_slot2 = error_slot2.clone();
        async move {
            *error_slot2.lock().await = Some(e);
        }
    });

    let stream = transfer.clone().supply_download(callback);
    let body = Body::from_stream(stream.map(Ok::<_, std::io::Error>));

    let disposition = format!("attachment; filename=\"{}\"", transfer.file.name);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &transfer.file.content_type)
        .header(header::CONTENT_LENGTH, transfer.file.size)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(body)
        .map_err(|e| TransitError::Internal(e.to_string()))?;

    Ok(response)
}

pub async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

pub async fn robots() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], html::ROBOTS_TXT)
}

use futures::StreamExt;
