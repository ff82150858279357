use crate::clock::Clock;
use crate::identity::{read, write};
use crate::kv::KeyValueStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PENDING_EVENTS_KEY: &str = "vantage_pending_events";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport refused the payload")]
    Refused,
    #[error("endpoint answered with status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Fire-and-forget sender that survives page unload. Returns whether the payload was
/// accepted for sending, not whether it arrived.
pub trait BeaconSink: Send + Sync {
    fn is_supported(&self) -> bool {
        true
    }

    fn send_beacon(&self, url: &str, body: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub body: &'a str,
    pub content_type: &'a str,
    pub keep_alive: bool,
}

/// Request/response HTTP capability. Implementations must not attach cookies or other
/// credentials.
pub trait HttpFetch: Send + Sync {
    fn post(&self, request: &FetchRequest<'_>) -> Result<u16, TransportError>;
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn send(&self, endpoint: &str, payload: &str) -> Result<(), TransportError>;
}

pub struct UnloadSafe {
    sink: Arc<dyn BeaconSink>,
}

impl UnloadSafe {
    pub fn new(sink: Arc<dyn BeaconSink>) -> Self {
        Self { sink }
    }
}

impl Transport for UnloadSafe {
    fn name(&self) -> &'static str {
        "beacon"
    }

    fn is_available(&self) -> bool {
        self.sink.is_supported()
    }

    fn send(&self, endpoint: &str, payload: &str) -> Result<(), TransportError> {
        if self.sink.send_beacon(endpoint, payload) {
            Ok(())
        } else {
            Err(TransportError::Refused)
        }
    }
}

pub struct KeepAliveFetch {
    client: Arc<dyn HttpFetch>,
}

impl KeepAliveFetch {
    pub fn new(client: Arc<dyn HttpFetch>) -> Self {
        Self { client }
    }
}

impl Transport for KeepAliveFetch {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn send(&self, endpoint: &str, payload: &str) -> Result<(), TransportError> {
        let status = self.client.post(&FetchRequest {
            url: endpoint,
            body: payload,
            content_type: "application/json",
            keep_alive: true,
        })?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(TransportError::Status(status))
        }
    }
}

/// Ordered transports, tried until one accepts the payload.
#[derive(Default)]
pub struct TransportChain {
    transports: Vec<Box<dyn Transport>>,
}

impl TransportChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the usual chain from whatever capabilities the host offers: unload-safe
    /// beacon first, keep-alive request second.
    pub fn detect(beacon: Option<Arc<dyn BeaconSink>>, fetch: Option<Arc<dyn HttpFetch>>) -> Self {
        let mut chain = Self::new();
        if let Some(sink) = beacon {
            chain = chain.with(UnloadSafe::new(sink));
        }
        if let Some(client) = fetch {
            chain = chain.with(KeepAliveFetch::new(client));
        }
        chain
    }

    pub fn with(mut self, transport: impl Transport + 'static) -> Self {
        if transport.is_available() {
            self.transports.push(Box::new(transport));
        } else {
            debug!(event = "transport_skipped", transport = transport.name());
        }
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    pub fn send(&self, endpoint: &str, payload: &str) -> Result<&'static str, TransportError> {
        let mut last_error = TransportError::Unavailable("no transport configured".to_string());
        for transport in &self.transports {
            match transport.send(endpoint, payload) {
                Ok(()) => return Ok(transport.name()),
                Err(err) => {
                    debug!(
                        event = "transport_failed",
                        transport = transport.name(),
                        error = %err
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryConfig {
    pub endpoint: String,
    pub queue_capacity: usize,
    pub pending_ttl_secs: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: "/track".to_string(),
            queue_capacity: 10,
            pending_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl DeliveryConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::seconds(self.pending_ttl_secs)
    }
}

/// A serialized event that could not be delivered yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingEvent {
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Bounded FIFO of undelivered events held in durable storage.
pub struct PendingQueue {
    store: Arc<dyn KeyValueStore>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    pub fn load(&self) -> Vec<PendingEvent> {
        let Some(raw) = read(self.store.as_ref(), PENDING_EVENTS_KEY) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(event = "pending_queue_unreadable", error = %err);
            Vec::new()
        })
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    /// Appends an entry, evicting the oldest ones past capacity. Returns how many were
    /// evicted.
    pub fn push(&self, event: PendingEvent) -> usize {
        let mut entries = self.load();
        entries.push(event);
        let evicted = entries.len().saturating_sub(self.capacity);
        if evicted > 0 {
            entries.drain(..evicted);
            warn!(event = "pending_queue_evicted", evicted);
        }
        self.save(&entries);
        evicted
    }

    pub fn replace(&self, entries: &[PendingEvent]) {
        self.save(entries);
    }

    fn save(&self, entries: &[PendingEvent]) {
        if entries.is_empty() {
            if let Err(err) = self.store.remove(PENDING_EVENTS_KEY) {
                warn!(event = "pending_queue_clear_failed", error = %err);
            }
            return;
        }
        match serde_json::to_string(entries) {
            Ok(encoded) => write(self.store.as_ref(), PENDING_EVENTS_KEY, &encoded),
            Err(err) => warn!(event = "pending_queue_encode_failed", error = %err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered { transport: &'static str },
    Queued,
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub expired: usize,
    pub remaining: usize,
}

/// Sends payloads through the transport chain and parks the ones that fail.
pub struct Deliverer {
    chain: TransportChain,
    queue: PendingQueue,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
}

impl Deliverer {
    pub fn new(
        chain: TransportChain,
        durable: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        let queue = PendingQueue::new(durable, config.queue_capacity);
        Self {
            chain,
            queue,
            clock,
            config,
        }
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn deliver(&self, payload: &str) -> DeliveryResult {
        match self.chain.send(&self.config.endpoint, payload) {
            Ok(transport) => {
                debug!(event = "event_delivered", transport);
                self.drain_pending();
                DeliveryResult::Delivered { transport }
            }
            Err(err) => {
                info!(event = "event_queued", error = %err);
                self.queue.push(PendingEvent {
                    payload: payload.to_string(),
                    enqueued_at: self.clock.now(),
                });
                DeliveryResult::Queued
            }
        }
    }

    /// Retries every parked payload once, oldest first. Entries older than the pending TTL
    /// are dropped without a send attempt.
    pub fn drain_pending(&self) -> DrainReport {
        let entries = self.queue.load();
        if entries.is_empty() {
            return DrainReport::default();
        }

        let now = self.clock.now();
        let ttl = self.config.pending_ttl();
        let mut report = DrainReport::default();
        let mut kept = Vec::new();
        for entry in entries {
            if now - entry.enqueued_at > ttl {
                report.expired += 1;
                continue;
            }
            match self.chain.send(&self.config.endpoint, &entry.payload) {
                Ok(_) => report.delivered += 1,
                Err(_) => kept.push(entry),
            }
        }
        report.remaining = kept.len();
        self.queue.replace(&kept);

        info!(
            event = "pending_drained",
            delivered = report.delivered,
            expired = report.expired,
            remaining = report.remaining
        );
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Beacon that records payloads and can be switched off.
    #[derive(Default)]
    pub(crate) struct RecordingBeacon {
        pub(crate) sent: Mutex<Vec<String>>,
        pub(crate) refusing: AtomicBool,
    }

    impl RecordingBeacon {
        pub(crate) fn refuse(&self, refusing: bool) {
            self.refusing.store(refusing, Ordering::Relaxed);
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().expect("lock").clone()
        }
    }

    impl BeaconSink for RecordingBeacon {
        fn send_beacon(&self, _url: &str, body: &str) -> bool {
            if self.refusing.load(Ordering::Relaxed) {
                return false;
            }
            self.sent.lock().expect("lock").push(body.to_string());
            true
        }
    }

    struct StatusFetch {
        status: Result<u16, TransportError>,
        seen: Mutex<Vec<(String, bool)>>,
    }

    impl HttpFetch for StatusFetch {
        fn post(&self, request: &FetchRequest<'_>) -> Result<u16, TransportError> {
            self.seen
                .lock()
                .expect("lock")
                .push((request.body.to_string(), request.keep_alive));
            self.status.clone()
        }
    }

    struct Unsupported;

    impl BeaconSink for Unsupported {
        fn is_supported(&self) -> bool {
            false
        }

        fn send_beacon(&self, _url: &str, _body: &str) -> bool {
            true
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn deliverer(beacon: Arc<RecordingBeacon>) -> (Arc<ManualClock>, Arc<MemoryStore>, Deliverer) {
        let clock = Arc::new(ManualClock::new(start()));
        let durable = Arc::new(MemoryStore::new());
        let chain = TransportChain::detect(Some(beacon), None);
        let deliverer = Deliverer::new(
            chain,
            durable.clone(),
            clock.clone(),
            DeliveryConfig::default(),
        );
        (clock, durable, deliverer)
    }

    #[test]
    fn probing_skips_unsupported_capabilities() {
        let chain = TransportChain::detect(Some(Arc::new(Unsupported)), None);
        assert!(chain.names().is_empty());
        assert!(matches!(
            chain.send("/track", "{}"),
            Err(TransportError::Unavailable(_))
        ));
    }

    #[test]
    fn fetch_fallback_used_when_beacon_refuses() {
        let beacon = Arc::new(RecordingBeacon::default());
        beacon.refuse(true);
        let fetch = Arc::new(StatusFetch {
            status: Ok(204),
            seen: Mutex::new(Vec::new()),
        });
        let chain = TransportChain::detect(Some(beacon), Some(fetch.clone()));
        assert_eq!(chain.names(), vec!["beacon", "fetch"]);

        assert_eq!(chain.send("/track", "{\"a\":1}"), Ok("fetch"));
        let seen = fetch.seen.lock().expect("lock");
        assert_eq!(seen.as_slice(), &[("{\"a\":1}".to_string(), true)]);
    }

    #[test]
    fn non_success_status_is_a_failure() {
        let fetch = Arc::new(StatusFetch {
            status: Ok(503),
            seen: Mutex::new(Vec::new()),
        });
        let chain = TransportChain::detect(None, Some(fetch));
        assert_eq!(chain.send("/track", "{}"), Err(TransportError::Status(503)));
    }

    #[test]
    fn queue_keeps_newest_entries_up_to_capacity() {
        let queue = PendingQueue::new(Arc::new(MemoryStore::new()), 10);
        for n in 0..11 {
            let evicted = queue.push(PendingEvent {
                payload: format!("event-{n}"),
                enqueued_at: start(),
            });
            assert_eq!(evicted, usize::from(n == 10));
        }
        let entries = queue.load();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0].payload, "event-1");
        assert_eq!(entries[9].payload, "event-10");
    }

    #[test]
    fn failed_delivery_is_queued_then_drained_in_order() {
        let beacon = Arc::new(RecordingBeacon::default());
        let (_clock, _durable, deliverer) = deliverer(beacon.clone());

        beacon.refuse(true);
        assert_eq!(deliverer.deliver("first"), DeliveryResult::Queued);
        assert_eq!(deliverer.deliver("second"), DeliveryResult::Queued);
        assert_eq!(deliverer.queue().len(), 2);

        beacon.refuse(false);
        let result = deliverer.deliver("third");
        assert_eq!(result, DeliveryResult::Delivered { transport: "beacon" });
        assert_eq!(beacon.sent(), vec!["third", "first", "second"]);
        assert!(deliverer.queue().is_empty());
    }

    #[test]
    fn expired_entries_are_dropped_without_retry() {
        let beacon = Arc::new(RecordingBeacon::default());
        let (clock, _durable, deliverer) = deliverer(beacon.clone());

        beacon.refuse(true);
        deliverer.deliver("stale");
        clock.advance(Duration::hours(23));
        deliverer.deliver("fresh");
        clock.advance(Duration::hours(2));

        beacon.refuse(false);
        let report = deliverer.drain_pending();
        assert_eq!(
            report,
            DrainReport {
                delivered: 1,
                expired: 1,
                remaining: 0
            }
        );
        assert_eq!(beacon.sent(), vec!["fresh"]);
    }

    #[test]
    fn failures_during_drain_stay_queued() {
        let beacon = Arc::new(RecordingBeacon::default());
        let (_clock, durable, deliverer) = deliverer(beacon.clone());

        beacon.refuse(true);
        deliverer.deliver("parked");
        let report = deliverer.drain_pending();
        assert_eq!(report.remaining, 1);
        assert!(durable
            .get(PENDING_EVENTS_KEY)
            .expect("get")
            .is_some_and(|raw| raw.contains("parked")));
    }
}
