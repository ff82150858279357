use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};
use vantage_core::contracts::{ElementDescriptor, EventType, IngestAck, MouseSample};
use vantage_core::stores::{
    ClickRecord, EventStore, JourneyRecord, MouseMovementRecord, PageviewRecord, StoreError,
};
use vantage_core::AttributionParameters;

/// Fields lifted into typed columns; everything else on a pageview-shaped event is kept as
/// its `details` JSON.
const COMMON_FIELDS: [&str; 22] = [
    "event_type",
    "client_id",
    "session_id",
    "journey_id",
    "page_url",
    "timestamp",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "first_touch",
    "referrer",
    "page_title",
    "viewport_width",
    "viewport_height",
    "user_agent",
    "visit_count",
    "page_sequence",
    "previous_page_url",
    "time_on_previous_page",
    "is_direct",
];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("event store is missing fields: {}", .fields.join(", "))]
    SchemaMismatch { fields: Vec<String> },
    #[error("event store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        let fields = missing_fields(err.message());
        if fields.is_empty() {
            IngestError::Store(err)
        } else {
            IngestError::SchemaMismatch { fields }
        }
    }
}

fn missing_column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"has no column named (\w+)",
            r"|no such column: (?:\w+\.)?(\w+)",
            r#"|column "?(\w+)"? (?:of relation "?\w+"? )?does not exist"#,
        ))
        .expect("valid regex")
    })
}

/// Payload field that feeds a storage column. Columns that hold derived values keep their
/// own name.
fn payload_field(column: &str) -> &str {
    match column {
        "first_touch_json" => "first_touch",
        "element_tag" => "element.tag",
        "element_id" => "element.id",
        "element_classes_json" => "element.classes",
        "element_text" => "element.text",
        "element_href" => "element.href",
        "movements_json" => "movements",
        "occurred_at" => "timestamp",
        other => other,
    }
}

/// Payload fields a storage error reports as missing, in order of appearance.
pub fn missing_fields(message: &str) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for caps in missing_column_pattern().captures_iter(message) {
        let name = caps
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| payload_field(m.as_str()).to_string());
        if let Some(name) = name {
            if !fields.contains(&name) {
                fields.push(name);
            }
        }
    }
    fields
}

fn default_event_type() -> String {
    EventType::Pageview.as_str().to_string()
}

#[derive(Debug, Deserialize)]
struct IncomingEvent {
    #[serde(default = "default_event_type")]
    event_type: String,
    client_id: String,
    session_id: String,
    #[serde(default)]
    journey_id: Option<String>,
    #[serde(default)]
    page_url: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    utm_source: Option<String>,
    #[serde(default)]
    utm_medium: Option<String>,
    #[serde(default)]
    utm_campaign: Option<String>,
    #[serde(default)]
    utm_term: Option<String>,
    #[serde(default)]
    utm_content: Option<String>,
    #[serde(default)]
    first_touch: Option<AttributionParameters>,
    #[serde(default)]
    referrer: Option<String>,
    #[serde(default)]
    page_title: Option<String>,
    #[serde(default)]
    viewport_width: Option<u32>,
    #[serde(default)]
    viewport_height: Option<u32>,
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    visit_count: Option<u64>,
    #[serde(default)]
    page_sequence: Option<u32>,
    #[serde(default)]
    previous_page_url: Option<String>,
    #[serde(default)]
    time_on_previous_page: Option<u64>,
    #[serde(default)]
    x: Option<i32>,
    #[serde(default)]
    y: Option<i32>,
    #[serde(default)]
    element: Option<ElementDescriptor>,
    #[serde(default)]
    movements: Vec<MouseSample>,
}

impl IncomingEvent {
    fn attribution(&self) -> AttributionParameters {
        let raw = AttributionParameters {
            utm_source: self.utm_source.clone(),
            utm_medium: self.utm_medium.clone(),
            utm_campaign: self.utm_campaign.clone(),
            utm_term: self.utm_term.clone(),
            utm_content: self.utm_content.clone(),
        };
        AttributionParameters::default().overlaid_with(&raw)
    }
}

/// Routes raw tracking payloads to the matching Event Store writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestRouter;

impl IngestRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn ingest_str<S: EventStore + ?Sized>(
        &self,
        store: &S,
        raw: &str,
        received_at: DateTime<Utc>,
    ) -> Result<IngestAck, IngestError> {
        let payload: Value = serde_json::from_str(raw)
            .map_err(|err| IngestError::InvalidPayload(err.to_string()))?;
        self.ingest(store, payload, received_at)
    }

    pub fn ingest<S: EventStore + ?Sized>(
        &self,
        store: &S,
        payload: Value,
        received_at: DateTime<Utc>,
    ) -> Result<IngestAck, IngestError> {
        let Value::Object(fields) = payload else {
            return Err(IngestError::InvalidPayload(
                "payload must be a JSON object".to_string(),
            ));
        };
        let event: IncomingEvent = serde_json::from_value(Value::Object(fields.clone()))
            .map_err(|err| IngestError::InvalidPayload(err.to_string()))?;
        if event.client_id.trim().is_empty() || event.session_id.trim().is_empty() {
            return Err(IngestError::InvalidPayload(
                "client_id and session_id are required".to_string(),
            ));
        }

        let event_type = event.event_type.clone();
        match event_type.parse::<EventType>() {
            Ok(EventType::Click) => store_click(store, event, received_at)?,
            Ok(EventType::MouseMovement) => store_mouse_movement(store, event, received_at)?,
            _ => store_pageview(store, event, fields, received_at)?,
        }

        debug!(event = "event_ingested", event_type = %event_type);
        Ok(IngestAck {
            success: true,
            event_type,
            timestamp: received_at,
        })
    }
}

fn store_click<S: EventStore + ?Sized>(
    store: &S,
    event: IncomingEvent,
    received_at: DateTime<Utc>,
) -> Result<(), IngestError> {
    let element = event.element.unwrap_or_default();
    let record = ClickRecord {
        client_id: event.client_id,
        session_id: event.session_id,
        page_url: event.page_url,
        x: event.x.unwrap_or(0),
        y: event.y.unwrap_or(0),
        element_tag: Some(element.tag).filter(|tag| !tag.is_empty()),
        element_id: element.id,
        element_classes: element.classes,
        element_text: element.text,
        element_href: element.href,
        occurred_at: event.timestamp.unwrap_or(received_at),
    };
    store.insert_click(&record)?;
    Ok(())
}

fn store_mouse_movement<S: EventStore + ?Sized>(
    store: &S,
    event: IncomingEvent,
    received_at: DateTime<Utc>,
) -> Result<(), IngestError> {
    let record = MouseMovementRecord {
        client_id: event.client_id,
        session_id: event.session_id,
        page_url: event.page_url,
        movements: event.movements,
        viewport_width: event.viewport_width,
        viewport_height: event.viewport_height,
        occurred_at: event.timestamp.unwrap_or(received_at),
    };
    store.insert_mouse_movement(&record)?;
    Ok(())
}

fn store_pageview<S: EventStore + ?Sized>(
    store: &S,
    event: IncomingEvent,
    mut fields: Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Result<(), IngestError> {
    let attribution = event.attribution();
    let first_visit = !store.has_prior_visit(&event.client_id)?;
    let is_direct = attribution.utm_source.is_none()
        && event
            .referrer
            .as_deref()
            .map_or(true, |referrer| referrer.trim().is_empty());
    for name in COMMON_FIELDS {
        fields.remove(name);
    }
    let occurred_at = event.timestamp.unwrap_or(received_at);

    let record = PageviewRecord {
        event_type: event.event_type.clone(),
        client_id: event.client_id.clone(),
        session_id: event.session_id.clone(),
        journey_id: event.journey_id.clone(),
        page_url: event.page_url.clone(),
        referrer: event.referrer.clone(),
        page_title: event.page_title.clone(),
        attribution,
        first_touch: event.first_touch.clone().filter(|ft| !ft.is_empty()),
        viewport_width: event.viewport_width,
        viewport_height: event.viewport_height,
        user_agent: event.user_agent.clone(),
        visit_count: event.visit_count,
        first_visit,
        is_direct,
        details: Value::Object(fields),
        occurred_at,
        received_at,
    };
    let primary = store.insert_pageview(&record);

    if let Some(journey_id) = event.journey_id.filter(|id| !id.is_empty()) {
        let journey = JourneyRecord {
            journey_id,
            client_id: event.client_id,
            session_id: event.session_id,
            page_url: event.page_url,
            previous_page_url: event.previous_page_url,
            page_sequence: event.page_sequence,
            time_on_previous_page: event.time_on_previous_page,
            occurred_at,
        };
        if let Err(err) = store.insert_journey(&journey) {
            warn!(
                event = "journey_write_failed",
                journey_id = %journey.journey_id,
                error = %err
            );
        }
    }

    primary?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeEvents {
        prior_clients: Vec<String>,
        pageviews: RefCell<Vec<PageviewRecord>>,
        journeys: RefCell<Vec<JourneyRecord>>,
        clicks: RefCell<Vec<ClickRecord>>,
        movements: RefCell<Vec<MouseMovementRecord>>,
        pageview_error: Option<String>,
        journey_error: Option<String>,
    }

    impl EventStore for FakeEvents {
        fn has_prior_visit(&self, client_id: &str) -> Result<bool, StoreError> {
            Ok(self.prior_clients.iter().any(|c| c == client_id))
        }

        fn insert_pageview(&self, record: &PageviewRecord) -> Result<(), StoreError> {
            if let Some(message) = &self.pageview_error {
                return Err(StoreError::Backend(message.clone()));
            }
            self.pageviews.borrow_mut().push(record.clone());
            Ok(())
        }

        fn insert_journey(&self, record: &JourneyRecord) -> Result<(), StoreError> {
            if let Some(message) = &self.journey_error {
                return Err(StoreError::Backend(message.clone()));
            }
            self.journeys.borrow_mut().push(record.clone());
            Ok(())
        }

        fn insert_click(&self, record: &ClickRecord) -> Result<(), StoreError> {
            self.clicks.borrow_mut().push(record.clone());
            Ok(())
        }

        fn insert_mouse_movement(&self, record: &MouseMovementRecord) -> Result<(), StoreError> {
            self.movements.borrow_mut().push(record.clone());
            Ok(())
        }
    }

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn newsletter_first_visit_is_neither_repeat_nor_direct() {
        let store = FakeEvents::default();
        let ack = IngestRouter::new()
            .ingest(
                &store,
                json!({
                    "event_type": "pageview",
                    "client_id": "c-1",
                    "session_id": "s-1",
                    "page_url": "https://shop.test/?utm_source=newsletter&utm_medium=email",
                    "utm_source": "newsletter",
                    "utm_medium": "email",
                    "timestamp": "2026-03-02T11:59:58Z"
                }),
                received(),
            )
            .expect("ingest");

        assert!(ack.success);
        assert_eq!(ack.event_type, "pageview");
        assert_eq!(ack.timestamp, received());

        let pageviews = store.pageviews.borrow();
        assert_eq!(pageviews.len(), 1);
        assert!(pageviews[0].first_visit);
        assert!(!pageviews[0].is_direct);
        assert_eq!(pageviews[0].attribution.utm_medium.as_deref(), Some("email"));
        assert_eq!(
            pageviews[0].occurred_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 11, 59, 58)
                .single()
                .expect("valid timestamp")
        );
    }

    #[test]
    fn returning_visitor_without_source_or_referrer_is_direct() {
        let store = FakeEvents {
            prior_clients: vec!["c-1".to_string()],
            ..FakeEvents::default()
        };
        let raw = json!({
            "client_id": "c-1",
            "session_id": "s-2",
            "page_url": "https://shop.test/",
            "referrer": "",
            "utm_medium": "email"
        })
        .to_string();
        IngestRouter::new()
            .ingest_str(&store, &raw, received())
            .expect("ingest");

        let pageviews = store.pageviews.borrow();
        assert_eq!(pageviews[0].event_type, "pageview");
        assert!(!pageviews[0].first_visit);
        assert!(pageviews[0].is_direct);
    }

    #[test]
    fn referrer_alone_makes_a_visit_indirect() {
        let store = FakeEvents::default();
        IngestRouter::new()
            .ingest(
                &store,
                json!({
                    "client_id": "c-1",
                    "session_id": "s-1",
                    "page_url": "https://shop.test/",
                    "referrer": "https://search.test/"
                }),
                received(),
            )
            .expect("ingest");
        assert!(!store.pageviews.borrow()[0].is_direct);
    }

    #[test]
    fn clicks_and_mouse_movements_use_their_own_records() {
        let store = FakeEvents::default();
        let router = IngestRouter::new();
        router
            .ingest(
                &store,
                json!({
                    "event_type": "click",
                    "client_id": "c-1",
                    "session_id": "s-1",
                    "page_url": "https://shop.test/",
                    "x": 120,
                    "y": 48,
                    "element": {"tag": "button", "id": "cta", "classes": ["btn"], "text": "Buy"}
                }),
                received(),
            )
            .expect("click");
        router
            .ingest(
                &store,
                json!({
                    "event_type": "mouse_movement",
                    "client_id": "c-1",
                    "session_id": "s-1",
                    "page_url": "https://shop.test/",
                    "viewport_width": 1280,
                    "movements": [{"x": 1, "y": 2, "t": 30}, {"x": 3, "y": 4, "t": 60}]
                }),
                received(),
            )
            .expect("movement");

        assert!(store.pageviews.borrow().is_empty());
        let clicks = store.clicks.borrow();
        assert_eq!(clicks[0].element_tag.as_deref(), Some("button"));
        assert_eq!(clicks[0].element_classes, vec!["btn".to_string()]);
        assert_eq!((clicks[0].x, clicks[0].y), (120, 48));
        let movements = store.movements.borrow();
        assert_eq!(movements[0].movements.len(), 2);
        assert_eq!(movements[0].viewport_width, Some(1280));
    }

    #[test]
    fn other_event_types_take_the_pageview_shape_with_details() {
        let store = FakeEvents::default();
        let ack = IngestRouter::new()
            .ingest(
                &store,
                json!({
                    "event_type": "scroll_depth",
                    "client_id": "c-1",
                    "session_id": "s-1",
                    "page_url": "https://shop.test/",
                    "depth_percent": 75
                }),
                received(),
            )
            .expect("ingest");
        assert_eq!(ack.event_type, "scroll_depth");

        let pageviews = store.pageviews.borrow();
        assert_eq!(pageviews[0].event_type, "scroll_depth");
        assert_eq!(pageviews[0].details, json!({"depth_percent": 75}));
    }

    #[test]
    fn journey_is_written_even_when_the_pageview_write_fails() {
        let store = FakeEvents {
            pageview_error: Some("disk I/O error".to_string()),
            ..FakeEvents::default()
        };
        let err = IngestRouter::new()
            .ingest(
                &store,
                json!({
                    "client_id": "c-1",
                    "session_id": "s-1",
                    "journey_id": "j-1",
                    "page_url": "https://shop.test/b",
                    "previous_page_url": "https://shop.test/a",
                    "page_sequence": 2,
                    "time_on_previous_page": 14
                }),
                received(),
            )
            .expect_err("pageview write fails");

        assert!(matches!(err, IngestError::Store(_)));
        let journeys = store.journeys.borrow();
        assert_eq!(journeys.len(), 1);
        assert_eq!(journeys[0].page_sequence, Some(2));
        assert_eq!(journeys[0].time_on_previous_page, Some(14));
    }

    #[test]
    fn journey_failure_does_not_fail_the_pageview() {
        let store = FakeEvents {
            journey_error: Some("journeys table locked".to_string()),
            ..FakeEvents::default()
        };
        IngestRouter::new()
            .ingest(
                &store,
                json!({"client_id": "c-1", "session_id": "s-1", "journey_id": "j-1"}),
                received(),
            )
            .expect("pageview still stored");
        assert_eq!(store.pageviews.borrow().len(), 1);
    }

    #[test]
    fn missing_column_maps_to_schema_mismatch() {
        let store = FakeEvents {
            pageview_error: Some(
                "sqlite error: table pageviews has no column named page_title".to_string(),
            ),
            ..FakeEvents::default()
        };
        let err = IngestRouter::new()
            .ingest(
                &store,
                json!({"client_id": "c-1", "session_id": "s-1"}),
                received(),
            )
            .expect_err("schema mismatch");
        match err {
            IngestError::SchemaMismatch { fields } => assert_eq!(fields, vec!["page_title"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_field_patterns_cover_common_backends() {
        assert_eq!(
            missing_fields(r#"column "utm_term" of relation "pageviews" does not exist"#),
            vec!["utm_term"]
        );
        assert_eq!(missing_fields("no such column: p.first_visit"), vec!["first_visit"]);
        assert!(missing_fields("database is locked").is_empty());
    }

    #[test]
    fn storage_columns_are_reported_as_payload_fields() {
        assert_eq!(
            missing_fields("table clicks has no column named element_classes_json"),
            vec!["element.classes"]
        );
        assert_eq!(
            missing_fields(
                "table pageviews has no column named first_touch_json; \
                 table mouse_movements has no column named movements_json"
            ),
            vec!["first_touch", "movements"]
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let store = FakeEvents::default();
        let router = IngestRouter::new();
        assert!(matches!(
            router.ingest_str(&store, "{not json", received()),
            Err(IngestError::InvalidPayload(_))
        ));
        assert!(matches!(
            router.ingest(&store, json!([1, 2]), received()),
            Err(IngestError::InvalidPayload(_))
        ));
        assert!(matches!(
            router.ingest(&store, json!({"client_id": "c-1"}), received()),
            Err(IngestError::InvalidPayload(_))
        ));
        assert!(store.pageviews.borrow().is_empty());
    }
}
