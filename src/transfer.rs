//! Lifecycle state machine for one transfer ID (spec §4.2).
//!
//! `Transfer` is a thin behavioral wrapper over a [`Store`]: it owns no
//! mutable state of its own beyond the uid and the metadata it was created
//! or read with. `bytes_uploaded`/`bytes_downloaded` live on the stack of
//! whichever task is running `collect_upload`/`supply_download` — they are
//! not cross-process state, per Invariant 6's framing that only the Store
//! flags need to survive a process boundary.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tracing::{info, warn};

use crate::error::{OnError, TransitError};
use crate::metadata::FileMetadata;
use crate::store::{QueueItem, Store};

/// Bookkeeping-only view of where a transfer sits in its lifecycle (spec
/// §4.2's state diagram). The Store's own flags remain the source of
/// truth across processes; this exists so `tracing` spans and tests have
/// a name for "where are we" without re-deriving it from three flag reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Claimed,
    Paired,
    Streaming,
    Completed,
    Aborted,
}

/// Restrict a transfer ID to the charset spec §3 allows.
pub fn validate_uid(uid: &str) -> Result<(), TransitError> {
    if !uid.is_empty() && uid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        Ok(())
    } else {
        Err(TransitError::InvalidInput("Invalid transfer ID.".into()))
    }
}

pub struct Transfer {
    store: Store,
    uid: String,
    pub file: FileMetadata,
}

impl Transfer {
    /// Claims `uid` for `file`. Fails `conflict` if already claimed (spec §4.2 `create`).
    pub fn create(store: &Store, uid: &str, file: FileMetadata) -> Result<Self, TransitError> {
        validate_uid(uid)?;
        store.set_metadata(uid, &file.to_json())?;
        info!(uid, name = %file.name, size = file.size, "transfer claimed");
        Ok(Self { store: store.clone(), uid: uid.to_string(), file })
    }

    /// Reads an existing transfer's metadata. Fails `not_found` if absent (spec §4.2 `get`).
    pub fn get(store: &Store, uid: &str) -> Result<Self, TransitError> {
        validate_uid(uid)?;
        let json = store
            .get_metadata(uid)
            .ok_or_else(|| TransitError::NotFound("Transfer not found.".into()))?;
        let file = FileMetadata::from_json(&json).map_err(TransitError::Internal)?;
        Ok(Self { store: store.clone(), uid: uid.to_string(), file })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Derives the current §4.2 state-machine phase from Store flags, for
    /// tracing spans and tests. Never a source of truth itself.
    pub fn phase(&self) -> TransferPhase {
        if self.store.is_completed(&self.uid) {
            TransferPhase::Completed
        } else if self.store.is_interrupted(&self.uid) {
            TransferPhase::Aborted
        } else if self.store.is_event_set(&self.uid, "client_connected") {
            TransferPhase::Streaming
        } else if self.store.is_receiver_connected(&self.uid) {
            TransferPhase::Paired
        } else {
            TransferPhase::Claimed
        }
    }

    /// Drains `stream` onto the Store queue (spec §4.2 `collect_upload`).
    ///
    /// `stream` yields `Ok(Bytes)` chunks, `Err(())` on an unexpected sender
    /// disconnect. A zero-length chunk is end-of-stream, matching an HTTP
    /// body's final empty read or an explicit WS sentinel frame. Returns
    /// `true` if the upload stopped because the receiver gave up — this is
    /// the "internal non-propagating error" spec §4.2 describes: it never
    /// reaches `on_error`, but the adapter still needs to know so it can
    /// close the sender's connection with an explanatory reason.
    pub async fn collect_upload<S>(&self, mut stream: S, on_error: OnError) -> bool
    where
        S: futures::Stream<Item = Result<Bytes, ()>> + Unpin,
    {
        use futures::StreamExt;

        let mut bytes_uploaded: u64 = 0;
        let mut disconnected = false;

        loop {
            match stream.next().await {
                None => break,
                Some(Err(())) => {
                    disconnected = true;
                    break;
                }
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        break;
                    }
                    if self.store.is_interrupted(&self.uid) {
                        warn!(uid = %self.uid, "receiver gone, stopping upload");
                        return true;
                    }
                    if let Err(e) = self.store.put_chunk(&self.uid, QueueItem::Data(chunk.clone())).await {
                        on_error(e).await;
                        return false;
                    }
                    bytes_uploaded += chunk.len() as u64;
                }
            }
        }

        if disconnected {
            let _ = self.store.put_chunk(&self.uid, QueueItem::Dead).await;
            return false;
        }

        if bytes_uploaded < self.file.size {
            let _ = self.store.put_chunk(&self.uid, QueueItem::Dead).await;
            on_error(TransitError::Truncated).await;
        } else {
            if let Err(e) = self.store.put_chunk(&self.uid, QueueItem::Done).await {
                on_error(e).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
                return false;
            }
            info!(uid = %self.uid, bytes_uploaded, "upload complete");
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        false
    }

    /// Pulls chunks off the Store queue for the receiver (spec §4.2
    /// `supply_download`). Returns an async stream of `Bytes`; errors are
    /// reported through `on_error` and terminate the stream. Dropping the
    /// returned stream — whether it ran to completion or the receiver hung
    /// up early — schedules `finalize_download` as a background task, per
    /// spec §4.3.1's "schedule finalize_download when the response handler
    /// completes."
    pub fn supply_download(
        self: std::sync::Arc<Self>,
        on_error: OnError,
    ) -> impl futures::Stream<Item = Bytes> + Send {
        let finalize_on = self.clone();
        let inner = async_stream::stream! {
            let bytes_downloaded = AtomicU64::new(0);
            loop {
                match self.store.take_chunk(&self.uid).await {
                    Err(e) => {
                        on_error(e).await;
                        break;
                    }
                    Ok(QueueItem::Dead) => {
                        on_error(TransitError::PeerGone("Sender disconnected.".into())).await;
                        break;
                    }
                    Ok(QueueItem::Done) => {
                        if bytes_downloaded.load(Ordering::Relaxed) < self.file.size {
                            on_error(TransitError::Truncated).await;
                        } else {
                            self.store.set_event(&self.uid, "completed");
                            info!(uid = %self.uid, "download complete");
                        }
                        break;
                    }
                    Ok(QueueItem::Data(chunk)) => {
                        bytes_downloaded.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        yield chunk;
                    }
                }
            }
        };
        FinalizingStream { inner: Box::pin(inner), transfer: finalize_on }
    }

    /// Runs when the download response handler ends, whether the consumer
    /// drained it fully or gave up early (spec §4.2 `finalize_download`).
    pub async fn finalize_download(&self) {
        if !self.store.is_interrupted(&self.uid) && !self.store.is_completed(&self.uid) {
            self.store.set_interrupted(&self.uid);
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::time::timeout(Duration::from_secs(30), async {
            self.store.cleanup(&self.uid);
        })
        .await
        .ok();
    }

    pub fn set_receiver_connected(&self) -> bool {
        self.store.set_receiver_connected(&self.uid)
    }

    pub fn set_client_connected(&self) {
        self.store.set_event(&self.uid, "client_connected");
    }

    pub async fn wait_for_client_connected(&self) -> Result<(), TransitError> {
        self.store.wait_for_event(&self.uid, "client_connected").await
    }
}

/// Wraps a download stream so dropping it — full completion or an early
/// receiver hangup — always schedules exactly one `finalize_download` run.
struct FinalizingStream {
    inner: Pin<Box<dyn Stream<Item = Bytes> + Send>>,
    transfer: Arc<Transfer>,
}

impl Stream for FinalizingStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for FinalizingStream {
    fn drop(&mut self) {
        let transfer = self.transfer.clone();
        tokio::spawn(async move { transfer.finalize_download().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use futures::stream;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn store() -> Store {
        Store::new(StoreConfig {
            queue_depth: 16,
            queue_timeout: Duration::from_millis(500),
            event_timeout: Duration::from_millis(500),
            event_ttl: Duration::from_secs(5),
            state_ttl: Duration::from_secs(5),
            cleanup_ttl: Duration::from_secs(5),
        })
    }

    #[test]
    fn uid_charset_is_enforced() {
        assert!(validate_uid("abc-123").is_ok());
        assert!(validate_uid("bad id").is_err());
        assert!(validate_uid("").is_err());
    }

    #[tokio::test]
    async fn duplicate_create_is_conflict() {
        let s = store();
        let file = FileMetadata::new("a.bin", 10, None).unwrap();
        Transfer::create(&s, "dup", file.clone()).unwrap();
        let err = Transfer::create(&s, "dup", file);
        assert!(matches!(err, Err(TransitError::Conflict(_))));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let s = store();
        assert!(matches!(Transfer::get(&s, "nope"), Err(TransitError::NotFound(_))));
    }

    #[tokio::test]
    async fn full_upload_then_download_round_trips() {
        let s = store();
        let file = FileMetadata::new("a.bin", 8, None).unwrap();
        let xfer = Transfer::create(&s, "rt", file).unwrap();

        let chunks: Vec<Result<Bytes, ()>> = vec![Ok(Bytes::from_static(b"abcd")), Ok(Bytes::from_static(b"efgh"))];
        let upload = stream::iter(chunks);
        let failed = Arc::new(AtomicBool::new(false));
        let failed2 = failed.clone();
        xfer.collect_upload(upload, crate::error::on_error(move |_| {
            let failed2 = failed2.clone();
            async move { failed2.store(true, Ordering::SeqCst); }
        })).await;
        assert!(!failed.load(Ordering::SeqCst));

        let xfer = Arc::new(Transfer::get(&s, "rt").unwrap());
        let failed = Arc::new(AtomicBool::new(false));
        let failed2 = failed.clone();
        let out = xfer.supply_download(crate::error::on_error(move |_| {
            let failed2 = failed2.clone();
            async move { failed2.store(true, Ordering::SeqCst); }
        }));
        futures::pin_mut!(out);
        use futures::StreamExt;
        let mut collected = Vec::new();
        while let Some(chunk) = out.next().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"abcdefgh");
        assert!(!failed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn short_upload_pushes_dead_and_receiver_sees_peer_gone() {
        let s = store();
        let file = FileMetadata::new("a.bin", 100, None).unwrap();
        let xfer = Transfer::create(&s, "short", file).unwrap();

        let upload = stream::iter(vec![Ok(Bytes::from_static(b"only 4"))]);
        xfer.collect_upload(upload, crate::error::on_error(|_| async {})).await;

        let xfer = Arc::new(Transfer::get(&s, "short").unwrap());
        let saw_error = Arc::new(AtomicBool::new(false));
        let saw_error2 = saw_error.clone();
        let out = xfer.supply_download(crate::error::on_error(move |e| {
            let saw_error2 = saw_error2.clone();
            async move {
                assert!(matches!(e, TransitError::PeerGone(_)));
                saw_error2.store(true, Ordering::SeqCst);
            }
        }));
        futures::pin_mut!(out);
        use futures::StreamExt;
        while out.next().await.is_some() {}
        assert!(saw_error.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn done_with_short_count_is_truncated() {
        let s = store();
        let file = FileMetadata::new("a.bin", 100, None).unwrap();
        let xfer = Arc::new(Transfer::create(&s, "mismatch", file).unwrap());

        s.put_chunk("mismatch", QueueItem::Data(Bytes::from_static(b"only 4 bytes"))).await.unwrap();
        s.put_chunk("mismatch", QueueItem::Done).await.unwrap();

        let saw_error = Arc::new(AtomicBool::new(false));
        let saw_error2 = saw_error.clone();
        let out = xfer.supply_download(crate::error::on_error(move |e| {
            let saw_error2 = saw_error2.clone();
            async move {
                assert!(matches!(e, TransitError::Truncated));
                saw_error2.store(true, Ordering::SeqCst);
            }
        }));
        futures::pin_mut!(out);
        use futures::StreamExt;
        while out.next().await.is_some() {}
        assert!(saw_error.load(Ordering::SeqCst));
    }
}
