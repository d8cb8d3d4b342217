//! In-memory stand-in for the shared key-value/pub-sub backend spec §4.1
//! assumes but does not implement.
//!
//! Per spec §9's design note: "Implementations that keep everything in one
//! process may replace the Store with an in-memory variant exposing the
//! same operations, but the signaling semantics (sticky events, blocking
//! pop, TTLs, single-flight cleanup) must be preserved." This is exactly
//! that variant, grounded in `umbra-relay::state::RelayState`: a `DashMap`
//! of per-transfer entries behind an `Arc`, cloned into every axum handler.
//!
//! Sticky events pair a TTL'd marker (checked on every wait, so a late
//! waiter still observes an already-fired event) with a `broadcast` channel
//! (so an already-waiting task wakes without polling) — the same
//! marker+pub/sub duality spec §4.1 calls out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::{broadcast, Notify};

use crate::error::TransitError;

/// Tunable knobs, all defaulted from spec §3/§4/§9 and overridable via CLI/env.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub queue_depth: usize,
    pub queue_timeout: Duration,
    pub event_timeout: Duration,
    pub event_ttl: Duration,
    pub state_ttl: Duration,
    pub cleanup_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            queue_timeout: Duration::from_secs(20),
            event_timeout: Duration::from_secs(300),
            event_ttl: Duration::from_secs(300),
            state_ttl: Duration::from_secs(300),
            cleanup_ttl: Duration::from_secs(60),
        }
    }
}

/// An entry on the per-transfer queue. Sentinels are first-class values
/// rather than magic byte sequences (spec's `0x00 0xFF` / `0xDE 0xAD`) —
/// since this queue is our own in-process structure and not a literal
/// byte-string-only backend, a typed enum satisfies the "sentinels can
/// never collide with a real payload chunk" invariant by construction.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Data(Bytes),
    Done,
    Dead,
}

struct Queue {
    items: StdMutex<VecDeque<QueueItem>>,
    cap: usize,
    space_available: Notify,
    item_available: Notify,
}

impl Queue {
    fn new(cap: usize) -> Self {
        Self {
            items: StdMutex::new(VecDeque::new()),
            cap,
            space_available: Notify::new(),
            item_available: Notify::new(),
        }
    }

    async fn push(&self, item: QueueItem, timeout: Duration) -> Result<(), TransitError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut items = self.items.lock().unwrap();
                if items.len() < self.cap {
                    items.push_back(item);
                    drop(items);
                    self.item_available.notify_waiters();
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransitError::Timeout("Timeout during upload".into()));
            }
            tokio::select! {
                _ = self.space_available.notified() => {}
                _ = tokio::time::sleep(remaining.min(Duration::from_millis(500))) => {}
            }
        }
    }

    async fn pop(&self, timeout: Duration) -> Result<QueueItem, TransitError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut items = self.items.lock().unwrap();
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.space_available.notify_waiters();
                    return Ok(item);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransitError::Timeout("Timeout during download".into()));
            }
            tokio::select! {
                _ = self.item_available.notified() => {}
                _ = tokio::time::sleep(remaining.min(Duration::from_millis(500))) => {}
            }
        }
    }

    /// Truncate to length 1 so a producer blocked on `push` wakes and
    /// rechecks capacity immediately (spec §4.1 `set_interrupted`).
    fn truncate_to_one(&self) {
        let mut items = self.items.lock().unwrap();
        while items.len() > 1 {
            items.pop_back();
        }
        drop(items);
        self.space_available.notify_waiters();
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

/// A sticky event: a TTL'd marker plus a broadcast channel, so that a
/// waiter arriving after the event fired still observes it (marker hit),
/// and a waiter already subscribed wakes on the very next publish.
struct EventSlot {
    fired_at: StdMutex<Option<Instant>>,
    ttl: Duration,
    tx: broadcast::Sender<()>,
}

impl EventSlot {
    fn new(ttl: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(8);
        Self {
            fired_at: StdMutex::new(None),
            ttl,
            tx,
        }
    }

    fn set(&self) {
        *self.fired_at.lock().unwrap() = Some(Instant::now());
        let _ = self.tx.send(());
    }

    fn is_fired(&self) -> bool {
        match *self.fired_at.lock().unwrap() {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    async fn wait(&self, timeout: Duration) -> Result<(), TransitError> {
        if self.is_fired() {
            return Ok(());
        }
        let mut rx = self.tx.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransitError::Timeout("Timeout waiting for event".into()));
            }
            tokio::select! {
                res = rx.recv() => {
                    match res {
                        Ok(()) => return Ok(()),
                        Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                        Err(broadcast::error::RecvError::Closed) => {
                            if self.is_fired() { return Ok(()); }
                        }
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    if self.is_fired() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

struct TtlFlag {
    value: StdMutex<Option<(Vec<u8>, Instant)>>,
}

impl TtlFlag {
    fn new() -> Self {
        Self { value: StdMutex::new(None) }
    }

    /// Set-if-absent with TTL. Returns `true` iff this call claimed it.
    fn set_if_absent(&self, payload: Vec<u8>, ttl: Duration) -> bool {
        let mut guard = self.value.lock().unwrap();
        if let Some((_, expires)) = &*guard {
            if Instant::now() < *expires {
                return false;
            }
        }
        *guard = Some((payload, Instant::now() + ttl));
        true
    }

    fn exists(&self) -> bool {
        let guard = self.value.lock().unwrap();
        matches!(&*guard, Some((_, expires)) if Instant::now() < *expires)
    }

    fn get(&self) -> Option<Vec<u8>> {
        let guard = self.value.lock().unwrap();
        match &*guard {
            Some((payload, expires)) if Instant::now() < *expires => Some(payload.clone()),
            _ => None,
        }
    }
}

/// Per-uid state. Fields under `transfer:<uid>:*` in spec §6's key layout
/// (queue, metadata, client_connected/completed markers, receiver_connected)
/// live here and are dropped wholesale by `cleanup`. `interrupt:<uid>` and
/// `cleanup:<uid>` are deliberately separate top-level keys in spec §6 and
/// outlive cleanup until their own TTL lapses — modeled below as sibling
/// maps on `Store` rather than fields on this struct.
struct TransferEntry {
    queue: Queue,
    metadata: TtlFlag,
    receiver_connected: TtlFlag,
    events: DashMap<String, Arc<EventSlot>>,
}

impl TransferEntry {
    fn new(cap: usize) -> Self {
        Self {
            queue: Queue::new(cap),
            metadata: TtlFlag::new(),
            receiver_connected: TtlFlag::new(),
            events: DashMap::new(),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    transfers: Arc<DashMap<String, Arc<TransferEntry>>>,
    interrupted: Arc<DashMap<String, Instant>>,
    cleanup_claims: Arc<DashMap<String, (Vec<u8>, Instant)>>,
    pub config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            transfers: Arc::new(DashMap::new()),
            interrupted: Arc::new(DashMap::new()),
            cleanup_claims: Arc::new(DashMap::new()),
            config,
        }
    }

    fn entry(&self, uid: &str) -> Arc<TransferEntry> {
        self.transfers
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(TransferEntry::new(self.config.queue_depth)))
            .clone()
    }

    // ── Queue operations (spec §4.1) ──────────────────────────────────────

    pub async fn put_chunk(&self, uid: &str, item: QueueItem) -> Result<(), TransitError> {
        self.entry(uid).queue.push(item, self.config.queue_timeout).await
    }

    pub async fn take_chunk(&self, uid: &str) -> Result<QueueItem, TransitError> {
        self.entry(uid).queue.pop(self.config.queue_timeout).await
    }

    pub fn queue_len(&self, uid: &str) -> usize {
        self.entry(uid).queue.len()
    }

    // ── Event operations (spec §4.1) ──────────────────────────────────────

    pub fn set_event(&self, uid: &str, name: &str) {
        let entry = self.entry(uid);
        let slot = entry
            .events
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EventSlot::new(self.config.event_ttl)))
            .clone();
        slot.set();
    }

    pub async fn wait_for_event(&self, uid: &str, name: &str) -> Result<(), TransitError> {
        let entry = self.entry(uid);
        let slot = entry
            .events
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EventSlot::new(self.config.event_ttl)))
            .clone();
        slot.wait(self.config.event_timeout).await
    }

    pub fn is_event_set(&self, uid: &str, name: &str) -> bool {
        self.entry(uid)
            .events
            .get(name)
            .map(|slot| slot.is_fired())
            .unwrap_or(false)
    }

    // ── Metadata operations (spec §4.1) ────────────────────────────────────

    /// Claim-and-verify: write a random challenge set-if-absent, read it
    /// back, and only overwrite with the real payload if this caller won
    /// the race. Fails with `Conflict` otherwise.
    pub fn set_metadata(&self, uid: &str, json: &str) -> Result<(), TransitError> {
        let entry = self.entry(uid);
        let mut challenge = vec![0u8; 8];
        rand::thread_rng().fill_bytes(&mut challenge);
        if !entry.metadata.set_if_absent(challenge.clone(), self.config.state_ttl) {
            return Err(TransitError::Conflict("Transfer ID is already used.".into()));
        }
        if entry.metadata.get().as_deref() != Some(&challenge[..]) {
            return Err(TransitError::Conflict("Transfer ID is already used.".into()));
        }
        *entry.metadata.value.lock().unwrap() =
            Some((json.as_bytes().to_vec(), Instant::now() + self.config.state_ttl));
        Ok(())
    }

    pub fn get_metadata(&self, uid: &str) -> Option<String> {
        self.entry(uid)
            .metadata
            .get()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    // ── Transfer state operations (spec §4.1) ──────────────────────────────

    pub fn set_receiver_connected(&self, uid: &str) -> bool {
        self.entry(uid).receiver_connected.set_if_absent(vec![1], self.config.state_ttl)
    }

    pub fn is_receiver_connected(&self, uid: &str) -> bool {
        self.entry(uid).receiver_connected.exists()
    }

    pub fn is_completed(&self, uid: &str) -> bool {
        self.is_event_set(uid, "completed")
    }

    pub fn set_interrupted(&self, uid: &str) {
        self.interrupted
            .entry(uid.to_string())
            .or_insert_with(Instant::now);
        self.entry(uid).queue.truncate_to_one();
    }

    pub fn is_interrupted(&self, uid: &str) -> bool {
        match self.interrupted.get(uid) {
            Some(at) => at.elapsed() < self.config.state_ttl,
            None => false,
        }
    }

    // ── Cleanup (spec §4.1) ────────────────────────────────────────────────

    /// Single-flight claim over `cleanup:<uid>`; returns `true` if this
    /// caller is the one that should perform the cleanup.
    fn claim_cleanup(&self, uid: &str) -> bool {
        let mut challenge = vec![0u8; 8];
        rand::thread_rng().fill_bytes(&mut challenge);
        let deadline = Instant::now() + self.config.cleanup_ttl;

        let mut winner = false;
        self.cleanup_claims
            .entry(uid.to_string())
            .and_modify(|existing| {
                if Instant::now() >= existing.1 {
                    *existing = (challenge.clone(), deadline);
                    winner = true;
                }
            })
            .or_insert_with(|| {
                winner = true;
                (challenge.clone(), deadline)
            });

        if !winner {
            return false;
        }
        matches!(self.cleanup_claims.get(uid), Some(entry) if entry.0 == challenge)
    }

    /// Remove every `transfer:<uid>:*` key. Idempotent and single-flight:
    /// a loser returns 0 without touching state. `interrupt:<uid>` and
    /// `cleanup:<uid>` are untouched here — they live outside the
    /// `transfer:<uid>:*` prefix per spec §6 and expire on their own TTL.
    pub fn cleanup(&self, uid: &str) -> usize {
        if !self.claim_cleanup(uid) {
            return 0;
        }
        match self.transfers.remove(uid) {
            Some(_) => 1,
            None => 0,
        }
    }

    /// Periodic sweep for entries whose flags have all expired, backing up
    /// the lazy expire-on-read checks above with the same belt-and-suspenders
    /// reclamation `umbra-relay`'s `cleanup_expired` loop performs (spec §2).
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.interrupted.retain(|_, at| now.duration_since(*at) < self.config.state_ttl);
        self.cleanup_claims.retain(|_, (_, expires)| now < *expires);
        let stale: Vec<String> = self
            .transfers
            .iter()
            .filter(|kv| {
                let entry = kv.value();
                !entry.metadata.exists()
                    && !entry.receiver_connected.exists()
                    && entry.events.iter().all(|e| !e.value().is_fired())
                    && entry.queue.len() == 0
            })
            .map(|kv| kv.key().clone())
            .collect();
        for uid in stale {
            self.transfers.remove(&uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(StoreConfig {
            queue_depth: 2,
            queue_timeout: Duration::from_millis(300),
            event_timeout: Duration::from_millis(300),
            event_ttl: Duration::from_secs(5),
            state_ttl: Duration::from_secs(5),
            cleanup_ttl: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn queue_fifo_order() {
        let s = store();
        s.put_chunk("a", QueueItem::Data(Bytes::from_static(b"one"))).await.unwrap();
        s.put_chunk("a", QueueItem::Data(Bytes::from_static(b"two"))).await.unwrap();
        assert_eq!(s.queue_len("a"), 2);
        match s.take_chunk("a").await.unwrap() {
            QueueItem::Data(b) => assert_eq!(&b[..], b"one"),
            _ => panic!("expected data"),
        }
        match s.take_chunk("a").await.unwrap() {
            QueueItem::Data(b) => assert_eq!(&b[..], b"two"),
            _ => panic!("expected data"),
        }
        assert_eq!(s.queue_len("a"), 0);
    }

    #[tokio::test]
    async fn queue_backpressure_blocks_then_times_out() {
        let s = store();
        s.put_chunk("a", QueueItem::Data(Bytes::from_static(b"1"))).await.unwrap();
        s.put_chunk("a", QueueItem::Data(Bytes::from_static(b"2"))).await.unwrap();
        let err = s.put_chunk("a", QueueItem::Data(Bytes::from_static(b"3"))).await;
        assert!(matches!(err, Err(TransitError::Timeout(_))));
    }

    #[tokio::test]
    async fn take_chunk_times_out_when_empty() {
        let s = store();
        let err = s.take_chunk("empty").await;
        assert!(matches!(err, Err(TransitError::Timeout(_))));
    }

    #[test]
    fn metadata_claim_is_single_writer() {
        let s = store();
        s.set_metadata("a", "{}").unwrap();
        let err = s.set_metadata("a", "{}");
        assert!(matches!(err, Err(TransitError::Conflict(_))));
    }

    #[test]
    fn receiver_connected_is_claimed_once() {
        let s = store();
        assert!(s.set_receiver_connected("a"));
        assert!(!s.set_receiver_connected("a"));
        assert!(s.is_receiver_connected("a"));
    }

    #[tokio::test]
    async fn sticky_event_seen_by_late_waiter() {
        let s = store();
        s.set_event("a", "client_connected");
        s.wait_for_event("a", "client_connected").await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_event_times_out_if_never_set() {
        let s = store();
        let err = s.wait_for_event("a", "client_connected").await;
        assert!(matches!(err, Err(TransitError::Timeout(_))));
    }

    #[tokio::test]
    async fn interrupt_truncates_queue_and_unblocks_producer() {
        let s = store();
        s.put_chunk("a", QueueItem::Data(Bytes::from_static(b"1"))).await.unwrap();
        s.put_chunk("a", QueueItem::Data(Bytes::from_static(b"2"))).await.unwrap();
        s.set_interrupted("a");
        assert!(s.is_interrupted("a"));
        s.put_chunk("a", QueueItem::Data(Bytes::from_static(b"3"))).await.unwrap();
    }

    #[test]
    fn cleanup_is_single_flight_and_idempotent() {
        let s = store();
        s.set_metadata("a", "{}").unwrap();
        assert_eq!(s.cleanup("a"), 1);
        assert_eq!(s.cleanup("a"), 0);
        assert!(s.get_metadata("a").is_none());
    }
}
