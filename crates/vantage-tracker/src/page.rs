use crate::identity::JourneyStep;
use crate::mouse::MouseBuffer;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use vantage_core::contracts::ElementDescriptor;
use vantage_core::AttributionParameters;

pub const SCROLL_THRESHOLDS: [u8; 4] = [25, 50, 75, 100];

/// What the host knows about the document being viewed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub page_url: String,
    pub referrer: Option<String>,
    pub page_title: Option<String>,
    pub viewport_width: Option<u32>,
    pub viewport_height: Option<u32>,
    pub user_agent: Option<String>,
}

impl PageContext {
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
            ..Self::default()
        }
    }
}

/// Host-side happenings routed into the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum PageSignal {
    Click {
        x: i32,
        y: i32,
        element: ElementDescriptor,
    },
    /// Current scroll position as a percentage of the scrollable height.
    Scroll { percent: f64 },
    Submit {
        form_id: Option<String>,
        form_action: Option<String>,
        field_names: Vec<String>,
    },
    MouseMove { x: i32, y: i32 },
    SectionVisible { section_id: String, ratio: f64 },
    VisibilityHidden,
    VisibilityVisible,
    Online,
    /// Periodic timer; drives heartbeats and time-based mouse flushes.
    Tick,
    Custom {
        name: String,
        properties: Map<String, Value>,
    },
}

/// Mutable per-page state. Each page load gets a fresh instance.
#[derive(Debug, Clone)]
pub struct PageSession {
    pub context: PageContext,
    pub journey: JourneyStep,
    pub url_attribution: AttributionParameters,
    entered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    scroll_thresholds: Vec<u8>,
    scroll_fired: BTreeSet<u8>,
    sections_seen: BTreeSet<String>,
    pub(crate) mouse: MouseBuffer,
}

impl PageSession {
    pub fn new(context: PageContext, journey: JourneyStep, now: DateTime<Utc>) -> Self {
        let url_attribution = AttributionParameters::from_url(&context.page_url);
        Self {
            context,
            journey,
            url_attribution,
            entered_at: now,
            last_heartbeat: now,
            scroll_thresholds: SCROLL_THRESHOLDS.to_vec(),
            scroll_fired: BTreeSet::new(),
            sections_seen: BTreeSet::new(),
            mouse: MouseBuffer::new(now),
        }
    }

    pub fn with_scroll_thresholds(mut self, thresholds: &[u8]) -> Self {
        let mut thresholds = thresholds.to_vec();
        thresholds.sort_unstable();
        thresholds.dedup();
        self.scroll_thresholds = thresholds;
        self
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// Milliseconds since the page was entered, clamped at zero.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.entered_at).num_milliseconds().max(0) as u64
    }

    /// Thresholds newly crossed by scrolling to `percent`, each reported once per page.
    pub fn crossed_thresholds(&mut self, percent: f64) -> Vec<u8> {
        let mut crossed = Vec::new();
        for &threshold in &self.scroll_thresholds {
            if percent >= f64::from(threshold) && self.scroll_fired.insert(threshold) {
                crossed.push(threshold);
            }
        }
        crossed
    }

    /// True the first time a section is seen on this page.
    pub fn first_sight(&mut self, section_id: &str) -> bool {
        self.sections_seen.insert(section_id.to_string())
    }

    pub fn heartbeat_due(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        now - self.last_heartbeat >= interval
    }

    pub fn mark_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
    }

    pub fn mouse(&self) -> &MouseBuffer {
        &self.mouse
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn session() -> PageSession {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        PageSession::new(
            PageContext::new("https://shop.test/?utm_source=google"),
            JourneyStep {
                journey_id: "j-1".to_string(),
                page_sequence: 1,
                previous_page_url: None,
                time_on_previous_page: None,
            },
            now,
        )
    }

    #[test]
    fn thresholds_fire_once_each() {
        let mut page = session();
        assert_eq!(page.crossed_thresholds(10.0), Vec::<u8>::new());
        assert_eq!(page.crossed_thresholds(60.0), vec![25, 50]);
        assert_eq!(page.crossed_thresholds(55.0), Vec::<u8>::new());
        assert_eq!(page.crossed_thresholds(100.0), vec![75, 100]);
        assert_eq!(page.crossed_thresholds(100.0), Vec::<u8>::new());
    }

    #[test]
    fn custom_thresholds_replace_defaults() {
        let mut page = session().with_scroll_thresholds(&[90, 10, 10]);
        assert_eq!(page.crossed_thresholds(95.0), vec![10, 90]);
    }

    #[test]
    fn independent_pages_do_not_share_counters() {
        let mut first = session();
        let mut second = session();
        assert_eq!(first.crossed_thresholds(30.0), vec![25]);
        assert_eq!(second.crossed_thresholds(30.0), vec![25]);
        assert!(first.first_sight("pricing"));
        assert!(!first.first_sight("pricing"));
        assert!(second.first_sight("pricing"));
    }

    #[test]
    fn url_attribution_comes_from_page_url() {
        let page = session();
        assert_eq!(page.url_attribution.utm_source.as_deref(), Some("google"));
    }

    #[test]
    fn heartbeat_interval_tracking() {
        let mut page = session();
        let start = page.entered_at();
        assert!(!page.heartbeat_due(start + Duration::seconds(59), Duration::seconds(60)));
        assert!(page.heartbeat_due(start + Duration::seconds(60), Duration::seconds(60)));
        page.mark_heartbeat(start + Duration::seconds(60));
        assert!(!page.heartbeat_due(start + Duration::seconds(61), Duration::seconds(60)));
        assert_eq!(page.elapsed_ms(start + Duration::seconds(2)), 2_000);
    }
}
