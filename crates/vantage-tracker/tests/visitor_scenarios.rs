use chrono::{Duration, TimeZone, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use vantage_core::AttributionField;
use vantage_tracker::{
    BeaconSink, DeliveryResult, FileStore, KeyValueStore, KvError, ManualClock, MemoryStore,
    PageContext, PageSignal, Sampler, Tracker, TrackerConfig, TrackerDeps, TransportChain,
};

#[derive(Default)]
struct SwitchableBeacon {
    down: AtomicBool,
    delivered: Mutex<Vec<String>>,
}

impl SwitchableBeacon {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Relaxed);
    }

    fn delivered(&self) -> Vec<Value> {
        self.delivered
            .lock()
            .expect("lock")
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("json"))
            .collect()
    }
}

impl BeaconSink for SwitchableBeacon {
    fn send_beacon(&self, _url: &str, body: &str) -> bool {
        if self.down.load(Ordering::Relaxed) {
            return false;
        }
        self.delivered.lock().expect("lock").push(body.to_string());
        true
    }
}

struct NeverSample;

impl Sampler for NeverSample {
    fn accept(&mut self, _rate: f64) -> bool {
        false
    }
}

/// Storage that refuses every call, like a browser with storage disabled.
struct DisabledStorage;

impl KeyValueStore for DisabledStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
        Err(KvError::Unavailable("storage disabled".to_string()))
    }

    fn set(&self, key: &str, _value: &str) -> Result<(), KvError> {
        Err(KvError::QuotaExceeded {
            key: key.to_string(),
        })
    }

    fn remove(&self, _key: &str) -> Result<(), KvError> {
        Err(KvError::Unavailable("storage disabled".to_string()))
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 4, 10, 8, 0, 0)
            .single()
            .expect("valid timestamp"),
    ))
}

fn tracker(
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    clock: Arc<ManualClock>,
    beacon: Arc<SwitchableBeacon>,
) -> Tracker {
    Tracker::new(
        TrackerConfig::default(),
        TrackerDeps {
            durable,
            session,
            clock,
            transports: TransportChain::detect(Some(beacon), None),
            sampler: Box::new(NeverSample),
            rule_source: None,
        },
    )
}

#[test]
fn pageview_queued_while_offline_is_sent_when_page_becomes_visible() {
    let beacon = Arc::new(SwitchableBeacon::default());
    let mut tracker = tracker(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        clock(),
        beacon.clone(),
    );

    beacon.set_down(true);
    let result = tracker
        .page_load(PageContext::new("https://shop.test/landing"))
        .expect("page load");
    assert_eq!(result, DeliveryResult::Queued);
    assert_eq!(tracker.deliverer().queue().len(), 1);

    beacon.set_down(false);
    let outcome = tracker
        .dispatch(PageSignal::VisibilityVisible)
        .expect("visible");
    let drained = outcome.drained.expect("drain ran");
    assert_eq!(drained.delivered, 1);
    assert!(tracker.deliverer().queue().is_empty());

    let delivered = beacon.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["event_type"], "pageview");
    assert_eq!(delivered[0]["page_url"], "https://shop.test/landing");
}

#[test]
fn campaign_visit_sets_first_and_last_touch_once() {
    let beacon = Arc::new(SwitchableBeacon::default());
    let durable = Arc::new(MemoryStore::new());
    let clock = clock();
    let mut tracker = tracker(
        durable.clone(),
        Arc::new(MemoryStore::new()),
        clock.clone(),
        beacon.clone(),
    );

    tracker
        .page_load(PageContext::new(
            "https://shop.test/?utm_source=newsletter&utm_medium=email",
        ))
        .expect("first visit");
    clock.advance(Duration::days(3));
    tracker
        .page_load(PageContext::new(
            "https://shop.test/?utm_source=google&utm_campaign=retarget",
        ))
        .expect("return visit");

    let first = tracker.attribution().first_touch();
    assert_eq!(first.get(AttributionField::UtmSource), Some("newsletter"));
    assert_eq!(first.get(AttributionField::UtmMedium), Some("email"));
    assert_eq!(first.get(AttributionField::UtmCampaign), Some("retarget"));

    let last = tracker.attribution().last_touch();
    assert_eq!(last.get(AttributionField::UtmSource), Some("google"));
    assert_eq!(last.get(AttributionField::UtmMedium), Some("email"));

    let delivered = beacon.delivered();
    assert_eq!(delivered[1]["utm_source"], "google");
    assert_eq!(delivered[1]["first_touch"]["utm_source"], "newsletter");
    assert_eq!(delivered[1]["visit_count"], 2);
}

#[test]
fn identity_survives_a_new_tracker_on_the_same_durable_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("durable.json");
    let beacon = Arc::new(SwitchableBeacon::default());
    let clock = clock();

    let first_client = {
        let durable = Arc::new(FileStore::open(&path).expect("open"));
        let mut tracker = tracker(
            durable,
            Arc::new(MemoryStore::new()),
            clock.clone(),
            beacon.clone(),
        );
        tracker
            .page_load(PageContext::new("https://shop.test/"))
            .expect("page load");
        tracker.identity().client_id()
    };

    clock.advance(Duration::hours(2));
    let durable = Arc::new(FileStore::open(&path).expect("reopen"));
    let mut tracker = tracker(
        durable,
        Arc::new(MemoryStore::new()),
        clock.clone(),
        beacon.clone(),
    );
    tracker
        .page_load(PageContext::new("https://shop.test/"))
        .expect("page load");
    assert_eq!(tracker.identity().client_id(), first_client);
    assert_eq!(tracker.identity().visit_count(), 2);
}

#[test]
fn disabled_storage_still_tracks_with_stable_ids_for_the_page() {
    let beacon = Arc::new(SwitchableBeacon::default());
    let mut tracker = tracker(
        Arc::new(DisabledStorage),
        Arc::new(DisabledStorage),
        clock(),
        beacon.clone(),
    );

    tracker
        .page_load(PageContext::new("https://shop.test/?utm_source=ads"))
        .expect("page load");
    tracker
        .dispatch(PageSignal::Custom {
            name: "signup_started".to_string(),
            properties: serde_json::Map::new(),
        })
        .expect("custom");

    let delivered = beacon.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0]["client_id"], delivered[1]["client_id"]);
    assert_eq!(delivered[0]["session_id"], delivered[1]["session_id"]);
    assert_eq!(delivered[1]["event_type"], "custom");
    assert_eq!(delivered[1]["name"], "signup_started");
    assert_eq!(delivered[1]["utm_source"], "ads");
}
