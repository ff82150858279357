use crate::identity::{read, write};
use crate::kv::KeyValueStore;
use std::sync::Arc;
use tracing::{debug, warn};
use vantage_core::AttributionParameters;

pub const FIRST_TOUCH_KEY: &str = "vantage_first_touch";
pub const LAST_TOUCH_KEY: &str = "vantage_last_touch";

/// First-touch and last-touch attribution snapshots kept in durable storage.
pub struct AttributionStore {
    durable: Arc<dyn KeyValueStore>,
}

impl AttributionStore {
    pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
        Self { durable }
    }

    /// Folds the parameters of an incoming page into both snapshots. Last-touch takes every
    /// present field; first-touch only takes fields it does not hold yet.
    pub fn record_incoming(&self, incoming: &AttributionParameters) {
        if incoming.is_empty() {
            return;
        }
        let mut first = self.first_touch();
        let mut last = self.last_touch();
        for (field, value) in incoming.present() {
            last.set(field, value);
            if first.get(field).is_none() {
                first.set(field, value);
            }
        }
        self.save(FIRST_TOUCH_KEY, &first);
        self.save(LAST_TOUCH_KEY, &last);
        debug!(event = "attribution_recorded", fields = incoming.present().count());
    }

    /// Stored last-touch with the current URL's fields layered on top.
    pub fn current(&self, url_params: &AttributionParameters) -> AttributionParameters {
        self.last_touch().overlaid_with(url_params)
    }

    pub fn first_touch(&self) -> AttributionParameters {
        self.load(FIRST_TOUCH_KEY)
    }

    pub fn last_touch(&self) -> AttributionParameters {
        self.load(LAST_TOUCH_KEY)
    }

    fn load(&self, key: &str) -> AttributionParameters {
        let Some(raw) = read(self.durable.as_ref(), key) else {
            return AttributionParameters::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(event = "attribution_unreadable", key, error = %err);
            AttributionParameters::default()
        })
    }

    fn save(&self, key: &str, params: &AttributionParameters) {
        match serde_json::to_string(params) {
            Ok(encoded) => write(self.durable.as_ref(), key, &encoded),
            Err(err) => warn!(event = "attribution_encode_failed", key, error = %err),
        }
    }
}
