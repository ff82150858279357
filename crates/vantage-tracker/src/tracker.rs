use crate::attribution::AttributionStore;
use crate::clock::Clock;
use crate::delivery::{
    DeliveryConfig, DeliveryResult, Deliverer, DrainReport, TransportChain, TransportError,
};
use crate::identity::{IdentityManager, SessionConfig};
use crate::kv::{KeyValueStore, ResilientStore};
use crate::mouse::{MouseConfig, Sampler};
use crate::page::{PageContext, PageSession, PageSignal, SCROLL_THRESHOLDS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use vantage_core::contracts::{ContentRule, EventBody, EventContext, MouseSample, TrackingEvent};
use vantage_core::AttributionParameters;
use vantage_personalize::{ApplyReport, InsertedElement, Mutator, Personalizer};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("event could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where personalization rules come from.
pub trait RuleSource {
    fn fetch_rules(
        &self,
        attribution: &AttributionParameters,
    ) -> Result<Vec<ContentRule>, TransportError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub scroll_thresholds: Vec<u8>,
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
    pub mouse: MouseConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            scroll_thresholds: SCROLL_THRESHOLDS.to_vec(),
            session: SessionConfig::default(),
            delivery: DeliveryConfig::default(),
            mouse: MouseConfig::default(),
        }
    }
}

/// Host capabilities the tracker runs on.
pub struct TrackerDeps {
    /// Survives browser restarts.
    pub durable: Arc<dyn KeyValueStore>,
    /// Scoped to one tab.
    pub session: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub transports: TransportChain,
    pub sampler: Box<dyn Sampler>,
    pub rule_source: Option<Box<dyn RuleSource>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalOutcome {
    pub deliveries: Vec<DeliveryResult>,
    pub drained: Option<DrainReport>,
}

pub struct Tracker {
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    identity: IdentityManager,
    attribution: AttributionStore,
    deliverer: Deliverer,
    sampler: Box<dyn Sampler>,
    rule_source: Option<Box<dyn RuleSource>>,
    personalizer: Option<Personalizer>,
    page: Option<PageSession>,
}

impl Tracker {
    pub fn new(config: TrackerConfig, deps: TrackerDeps) -> Self {
        let durable: Arc<dyn KeyValueStore> = Arc::new(ResilientStore::new(deps.durable));
        let session: Arc<dyn KeyValueStore> = Arc::new(ResilientStore::new(deps.session));
        let identity = IdentityManager::new(
            durable.clone(),
            session,
            deps.clock.clone(),
            config.session.clone(),
        );
        let attribution = AttributionStore::new(durable.clone());
        let deliverer = Deliverer::new(
            deps.transports,
            durable,
            deps.clock.clone(),
            config.delivery.clone(),
        );
        Self {
            config,
            clock: deps.clock,
            identity,
            attribution,
            deliverer,
            sampler: deps.sampler,
            rule_source: deps.rule_source,
            personalizer: None,
            page: None,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityManager {
        &self.identity
    }

    pub fn attribution(&self) -> &AttributionStore {
        &self.attribution
    }

    pub fn deliverer(&self) -> &Deliverer {
        &self.deliverer
    }

    pub fn page(&self) -> Option<&PageSession> {
        self.page.as_ref()
    }

    /// Starts tracking a new document: settles identity, folds the URL's campaign
    /// parameters into the stored attribution, advances the journey and sends the pageview.
    pub fn page_load(&mut self, context: PageContext) -> Result<DeliveryResult, TrackError> {
        self.flush_mouse()?;

        let now = self.clock.now();
        let incoming = AttributionParameters::from_url(&context.page_url);
        self.attribution.record_incoming(&incoming);
        let client_id = self.identity.client_id();
        let session_id = self.identity.session_id();
        let journey = self.identity.advance_journey(&context.page_url);
        info!(
            event = "page_loaded",
            client_id = %client_id,
            session_id = %session_id,
            page_sequence = journey.page_sequence
        );

        self.page = Some(
            PageSession::new(context, journey, now)
                .with_scroll_thresholds(&self.config.scroll_thresholds),
        );
        self.track(EventBody::Pageview)
    }

    pub fn track(&mut self, body: EventBody) -> Result<DeliveryResult, TrackError> {
        let event = self.enrich(body);
        let payload = serde_json::to_string(&event)?;
        let result = self.deliverer.deliver(&payload);
        debug!(
            event = "event_tracked",
            event_type = %event.event_type(),
            delivered = result.is_delivered()
        );
        Ok(result)
    }

    /// Wraps an event body with identity, session, attribution and page context. Journey
    /// fields ride on pageviews only.
    pub fn enrich(&self, body: EventBody) -> TrackingEvent {
        let client_id = self.identity.client_id();
        let session_id = self.identity.session_id();
        let first_touch = self.attribution.first_touch();
        let blank = PageContext::default();
        let (page_context, url_attribution) = match &self.page {
            Some(page) => (&page.context, page.url_attribution.clone()),
            None => (&blank, AttributionParameters::default()),
        };
        let journey = self
            .page
            .as_ref()
            .filter(|_| matches!(body, EventBody::Pageview))
            .map(|page| &page.journey);

        let context = EventContext {
            client_id,
            session_id,
            journey_id: journey.map(|step| step.journey_id.clone()),
            page_url: page_context.page_url.clone(),
            timestamp: self.clock.now(),
            attribution: self.attribution.current(&url_attribution),
            first_touch: (!first_touch.is_empty()).then_some(first_touch),
            referrer: page_context.referrer.clone(),
            page_title: page_context.page_title.clone(),
            viewport_width: page_context.viewport_width,
            viewport_height: page_context.viewport_height,
            user_agent: page_context.user_agent.clone(),
            visit_count: Some(self.identity.visit_count()),
            page_sequence: journey.map(|step| step.page_sequence),
            previous_page_url: journey.and_then(|step| step.previous_page_url.clone()),
            time_on_previous_page: journey.and_then(|step| step.time_on_previous_page),
        };
        TrackingEvent { context, body }
    }

    pub fn dispatch(&mut self, signal: PageSignal) -> Result<SignalOutcome, TrackError> {
        let mut outcome = SignalOutcome::default();
        match signal {
            PageSignal::Click { x, y, element } => {
                outcome
                    .deliveries
                    .push(self.track(EventBody::Click { x, y, element })?);
            }
            PageSignal::Scroll { percent } => {
                let crossed = self
                    .page
                    .as_mut()
                    .map(|page| page.crossed_thresholds(percent))
                    .unwrap_or_default();
                for depth_percent in crossed {
                    outcome
                        .deliveries
                        .push(self.track(EventBody::ScrollDepth { depth_percent })?);
                }
            }
            PageSignal::Submit {
                form_id,
                form_action,
                field_names,
            } => {
                outcome.deliveries.push(self.track(EventBody::FormSubmit {
                    form_id,
                    form_action,
                    field_names,
                })?);
            }
            PageSignal::MouseMove { x, y } => {
                let now = self.clock.now();
                let batch_full = match self.page.as_mut() {
                    Some(page) => {
                        let sample = MouseSample {
                            x,
                            y,
                            t: page.elapsed_ms(now),
                        };
                        page.mouse
                            .offer(sample, &mut *self.sampler, &self.config.mouse)
                    }
                    None => false,
                };
                if batch_full {
                    outcome.deliveries.extend(self.flush_mouse()?);
                }
            }
            PageSignal::SectionVisible { section_id, ratio } => {
                let first = self
                    .page
                    .as_mut()
                    .is_some_and(|page| page.first_sight(&section_id));
                if first {
                    outcome.deliveries.push(self.track(EventBody::SectionView {
                        section_id,
                        visible_ratio: ratio,
                    })?);
                }
            }
            PageSignal::VisibilityHidden => {
                outcome.deliveries.extend(self.flush_mouse()?);
            }
            PageSignal::VisibilityVisible | PageSignal::Online => {
                outcome.drained = Some(self.deliverer.drain_pending());
            }
            PageSignal::Tick => {
                let now = self.clock.now();
                let interval = self.config.session.heartbeat_interval();
                let (heartbeat_due, flush_due) = match self.page.as_ref() {
                    Some(page) => (
                        page.heartbeat_due(now, interval),
                        page.mouse().flush_due(now, &self.config.mouse),
                    ),
                    None => (false, false),
                };
                if heartbeat_due {
                    self.identity.heartbeat();
                    if let Some(page) = self.page.as_mut() {
                        page.mark_heartbeat(now);
                    }
                }
                if flush_due {
                    outcome.deliveries.extend(self.flush_mouse()?);
                }
            }
            PageSignal::Custom { name, properties } => {
                outcome
                    .deliveries
                    .push(self.track(EventBody::Custom { name, properties })?);
            }
        }
        Ok(outcome)
    }

    /// Fetches the rules for the visitor's current attribution and applies them, watching
    /// for late-rendered buttons when the rules call for it. Rule fetch failures leave the
    /// page as it is.
    pub fn personalize<M: Mutator + ?Sized>(&mut self, dom: &mut M) -> ApplyReport {
        if let Some(mut previous) = self.personalizer.take() {
            previous.stop(dom);
        }
        let attribution = self.current_attribution();
        if attribution.is_empty() {
            return ApplyReport::default();
        }
        let Some(source) = self.rule_source.as_ref() else {
            return ApplyReport::default();
        };
        let rules = match source.fetch_rules(&attribution) {
            Ok(rules) => rules,
            Err(err) => {
                warn!(event = "rules_fetch_failed", error = %err);
                return ApplyReport::default();
            }
        };

        let mut personalizer = Personalizer::new(rules, attribution);
        let report = personalizer.apply_and_watch(dom);
        info!(
            event = "page_personalized",
            rules = personalizer.rules().len(),
            elements_updated = report.elements_updated,
            element_failures = report.element_failures
        );
        self.personalizer = Some(personalizer);
        report
    }

    pub fn handle_insertions<M: Mutator + ?Sized>(
        &mut self,
        dom: &mut M,
        inserted: &[InsertedElement],
    ) -> Option<ApplyReport> {
        self.personalizer.as_mut()?.handle_insertions(dom, inserted)
    }

    pub fn current_attribution(&self) -> AttributionParameters {
        let url_attribution = self
            .page
            .as_ref()
            .map(|page| page.url_attribution.clone())
            .unwrap_or_default();
        self.attribution.current(&url_attribution)
    }

    fn flush_mouse(&mut self) -> Result<Option<DeliveryResult>, TrackError> {
        let now = self.clock.now();
        let Some(page) = self.page.as_mut() else {
            return Ok(None);
        };
        let Some(movements) = page.mouse.take(now) else {
            return Ok(None);
        };
        self.track(EventBody::MouseMovement { movements }).map(Some)
    }
}
