use crate::clock::Clock;
use crate::kv::KeyValueStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use vantage_core::new_id;

pub const CLIENT_ID_KEY: &str = "vantage_client_id";
pub const VISIT_COUNT_KEY: &str = "vantage_visit_count";
pub const LAST_ACTIVITY_KEY: &str = "vantage_last_activity";
pub const SESSION_ID_KEY: &str = "vantage_session_id";
pub const JOURNEY_ID_KEY: &str = "vantage_journey_id";
pub const PAGE_SEQUENCE_KEY: &str = "vantage_page_sequence";
pub const LAST_PAGE_URL_KEY: &str = "vantage_last_page_url";
pub const LAST_PAGE_AT_KEY: &str = "vantage_last_page_at";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: i64,
    pub heartbeat_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            heartbeat_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::seconds(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::seconds(self.heartbeat_secs)
    }
}

/// Position of the current page within the tab's journey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JourneyStep {
    pub journey_id: String,
    pub page_sequence: u32,
    pub previous_page_url: Option<String>,
    /// Whole seconds between the previous page load and this one.
    pub time_on_previous_page: Option<u64>,
}

/// Owns the visitor, session and journey identifiers.
///
/// `durable` outlives browser sessions (client id, visit count, last activity); `session`
/// is scoped to one tab (session id, journey state).
pub struct IdentityManager {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl IdentityManager {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            durable,
            session,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn client_id(&self) -> String {
        if let Some(existing) = read(self.durable.as_ref(), CLIENT_ID_KEY) {
            return existing;
        }
        let candidate = new_id();
        // Another initializer on the same storage may have won the race.
        if let Some(existing) = read(self.durable.as_ref(), CLIENT_ID_KEY) {
            return existing;
        }
        write(self.durable.as_ref(), CLIENT_ID_KEY, &candidate);
        debug!(event = "client_id_created", client_id = %candidate);
        candidate
    }

    /// Returns the live session id, starting a new session (and counting a new visit) when
    /// none exists or the previous one has been idle for the configured timeout.
    pub fn session_id(&self) -> String {
        let now = self.clock.now();
        let live = match (
            read(self.session.as_ref(), SESSION_ID_KEY),
            self.last_activity(),
        ) {
            (Some(id), Some(last)) if now - last < self.config.idle_timeout() => Some(id),
            _ => None,
        };

        let id = match live {
            Some(id) => id,
            None => {
                let id = new_id();
                write(self.session.as_ref(), SESSION_ID_KEY, &id);
                let visits = self.visit_count() + 1;
                write(self.durable.as_ref(), VISIT_COUNT_KEY, &visits.to_string());
                debug!(event = "session_started", session_id = %id, visit_count = visits);
                id
            }
        };
        self.record_activity(now);
        id
    }

    pub fn visit_count(&self) -> u64 {
        read(self.durable.as_ref(), VISIT_COUNT_KEY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        read(self.durable.as_ref(), LAST_ACTIVITY_KEY)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn touch(&self) {
        self.record_activity(self.clock.now());
    }

    /// Keeps a live session warm. An already expired session is left alone so the next
    /// real activity starts a fresh one.
    pub fn heartbeat(&self) -> bool {
        let now = self.clock.now();
        let live = read(self.session.as_ref(), SESSION_ID_KEY).is_some()
            && self
                .last_activity()
                .is_some_and(|last| now - last < self.config.idle_timeout());
        if live {
            self.record_activity(now);
        }
        live
    }

    pub fn journey_id(&self) -> String {
        if let Some(existing) = read(self.session.as_ref(), JOURNEY_ID_KEY) {
            return existing;
        }
        let id = new_id();
        write(self.session.as_ref(), JOURNEY_ID_KEY, &id);
        id
    }

    /// Records a page load in the tab's journey and reports where it sits.
    pub fn advance_journey(&self, page_url: &str) -> JourneyStep {
        let now = self.clock.now();
        let journey_id = self.journey_id();
        let previous_sequence: u32 = read(self.session.as_ref(), PAGE_SEQUENCE_KEY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let previous_page_url = read(self.session.as_ref(), LAST_PAGE_URL_KEY);
        let time_on_previous_page = read(self.session.as_ref(), LAST_PAGE_AT_KEY)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| (now - at.with_timezone(&Utc)).num_seconds().max(0) as u64);

        let page_sequence = previous_sequence.saturating_add(1);
        write(
            self.session.as_ref(),
            PAGE_SEQUENCE_KEY,
            &page_sequence.to_string(),
        );
        write(self.session.as_ref(), LAST_PAGE_URL_KEY, page_url);
        write(self.session.as_ref(), LAST_PAGE_AT_KEY, &now.to_rfc3339());

        JourneyStep {
            journey_id,
            page_sequence,
            previous_page_url,
            time_on_previous_page,
        }
    }

    fn record_activity(&self, now: DateTime<Utc>) {
        write(self.durable.as_ref(), LAST_ACTIVITY_KEY, &now.to_rfc3339());
    }
}

pub(crate) fn read(store: &dyn KeyValueStore, key: &str) -> Option<String> {
    match store.get(key) {
        Ok(value) => value.filter(|value| !value.is_empty()),
        Err(err) => {
            debug!(event = "storage_read_failed", key, error = %err);
            None
        }
    }
}

pub(crate) fn write(store: &dyn KeyValueStore, key: &str, value: &str) {
    if let Err(err) = store.set(key, value) {
        warn!(event = "storage_write_failed", key, error = %err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryStore;
    use chrono::TimeZone;

    struct Fixture {
        durable: Arc<MemoryStore>,
        session: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        identity: IdentityManager,
    }

    fn fixture() -> Fixture {
        let durable = Arc::new(MemoryStore::new());
        let session = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
                .single()
                .expect("valid timestamp"),
        ));
        let identity = IdentityManager::new(
            durable.clone(),
            session.clone(),
            clock.clone(),
            SessionConfig::default(),
        );
        Fixture {
            durable,
            session,
            clock,
            identity,
        }
    }

    #[test]
    fn client_id_is_stable_for_the_storage_lifetime() {
        let fx = fixture();
        let first = fx.identity.client_id();
        assert_eq!(fx.identity.client_id(), first);

        fx.durable.clear();
        assert_ne!(fx.identity.client_id(), first);
    }

    #[test]
    fn client_id_adopts_value_written_by_another_initializer() {
        let fx = fixture();
        fx.durable.set(CLIENT_ID_KEY, "from-other-tab").expect("set");
        assert_eq!(fx.identity.client_id(), "from-other-tab");
    }

    #[test]
    fn session_survives_29_minutes_and_rotates_after_31() {
        let fx = fixture();
        let first = fx.identity.session_id();
        assert_eq!(fx.identity.visit_count(), 1);

        fx.clock.advance(Duration::minutes(29));
        assert_eq!(fx.identity.session_id(), first);
        assert_eq!(fx.identity.visit_count(), 1);

        fx.clock.advance(Duration::minutes(31));
        let rotated = fx.identity.session_id();
        assert_ne!(rotated, first);
        assert_eq!(fx.identity.visit_count(), 2);
    }

    #[test]
    fn heartbeat_extends_live_session_only() {
        let fx = fixture();
        let id = fx.identity.session_id();

        fx.clock.advance(Duration::minutes(20));
        assert!(fx.identity.heartbeat());
        fx.clock.advance(Duration::minutes(20));
        assert_eq!(fx.identity.session_id(), id);

        fx.clock.advance(Duration::minutes(45));
        assert!(!fx.identity.heartbeat());
        assert_ne!(fx.identity.session_id(), id);
    }

    #[test]
    fn missing_session_scope_starts_new_session() {
        let fx = fixture();
        let id = fx.identity.session_id();
        fx.session.clear();
        assert_ne!(fx.identity.session_id(), id);
        assert_eq!(fx.identity.visit_count(), 2);
    }

    #[test]
    fn journey_advances_sequence_and_previous_page() {
        let fx = fixture();
        let first = fx.identity.advance_journey("https://shop.test/");
        assert_eq!(first.page_sequence, 1);
        assert_eq!(first.previous_page_url, None);
        assert_eq!(first.time_on_previous_page, None);

        fx.clock.advance(Duration::seconds(42));
        let second = fx.identity.advance_journey("https://shop.test/pricing");
        assert_eq!(second.journey_id, first.journey_id);
        assert_eq!(second.page_sequence, 2);
        assert_eq!(
            second.previous_page_url.as_deref(),
            Some("https://shop.test/")
        );
        assert_eq!(second.time_on_previous_page, Some(42));
    }
}
