use crate::dom::{DomError, ElementRef, InsertedElement, Mutator, WatchHandle};
use crate::html::strip_html;
use std::collections::BTreeSet;
use tracing::{debug, warn};
use vantage_core::contracts::ContentRule;
use vantage_core::AttributionParameters;

const OBSERVATION_HINTS: [&str; 4] = ["button", "btn", "submit", "cta"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub rules_matched: usize,
    pub elements_updated: usize,
    /// Elements whose markup this personalizer already wrote and left alone on re-apply.
    pub elements_skipped: usize,
    pub element_failures: usize,
    pub selector_failures: usize,
}

impl ApplyReport {
    fn absorb(&mut self, other: ApplyReport) {
        self.rules_matched += other.rules_matched;
        self.elements_updated += other.elements_updated;
        self.elements_skipped += other.elements_skipped;
        self.element_failures += other.element_failures;
        self.selector_failures += other.selector_failures;
    }
}

/// How an element was rewritten. Markup rewrites can insert new elements; text and
/// attribute rewrites cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewrite {
    Text,
    Markup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextApproach {
    TextContent,
    TextNodes,
    ChildReplacement,
}

const BUTTON_TEXT_APPROACHES: [TextApproach; 3] = [
    TextApproach::TextContent,
    TextApproach::TextNodes,
    TextApproach::ChildReplacement,
];

impl TextApproach {
    fn run<M: Mutator + ?Sized>(
        self,
        dom: &mut M,
        element: ElementRef,
        text: &str,
    ) -> Result<(), DomError> {
        match self {
            TextApproach::TextContent => dom.set_text_content(element, text),
            TextApproach::TextNodes => dom.replace_text_nodes(element, text),
            TextApproach::ChildReplacement => dom.replace_children_with_text(element, text),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TextApproach::TextContent => "text_content",
            TextApproach::TextNodes => "text_nodes",
            TextApproach::ChildReplacement => "child_replacement",
        }
    }
}

/// Rewrites every element targeted by a rule whose condition holds for `attribution`.
/// Failures are contained per element and per selector.
pub fn apply_rules<M: Mutator + ?Sized>(
    dom: &mut M,
    rules: &[ContentRule],
    attribution: &AttributionParameters,
) -> ApplyReport {
    apply_rules_once(dom, rules, attribution, &mut BTreeSet::new())
}

/// Same as [`apply_rules`], but markup is written at most once per (rule, element). Elements
/// recorded in `written` are skipped, so markup that injects buttons cannot feed back into
/// the insertion watch.
fn apply_rules_once<M: Mutator + ?Sized>(
    dom: &mut M,
    rules: &[ContentRule],
    attribution: &AttributionParameters,
    written: &mut BTreeSet<(usize, ElementRef)>,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for (index, rule) in rules.iter().enumerate() {
        if !rule.active || !rule.matches(attribution) {
            continue;
        }
        report.rules_matched += 1;

        let elements = match dom.query_selector_all(&rule.selector) {
            Ok(elements) => elements,
            Err(err) => {
                warn!(
                    event = "rule_selector_failed",
                    rule_id = %rule.id,
                    selector = %rule.selector,
                    error = %err
                );
                report.selector_failures += 1;
                continue;
            }
        };

        for element in elements {
            if written.contains(&(index, element)) {
                report.elements_skipped += 1;
                continue;
            }
            match rewrite_element(dom, element, &rule.replacement_content) {
                Ok(rewrite) => {
                    if rewrite == Rewrite::Markup {
                        written.insert((index, element));
                    }
                    report.elements_updated += 1;
                }
                Err(err) => {
                    warn!(
                        event = "rule_element_failed",
                        rule_id = %rule.id,
                        element = element.0,
                        error = %err
                    );
                    report.element_failures += 1;
                }
            }
        }
    }

    report
}

fn rewrite_element<M: Mutator + ?Sized>(
    dom: &mut M,
    element: ElementRef,
    content: &str,
) -> Result<Rewrite, DomError> {
    let tag = dom.tag_name(element).ok_or(DomError::Detached(element))?;
    match tag.as_str() {
        "button" => set_button_text(dom, element, &strip_html(content)).map(|()| Rewrite::Text),
        "input" => {
            let text = strip_html(content);
            dom.set_attribute(element, "value", &text)?;
            let input_type = dom
                .attribute(element, "type")
                .map(|value| value.to_lowercase());
            if matches!(input_type.as_deref(), Some("submit" | "button")) {
                dom.set_attribute(element, "data-text", &text)?;
                dom.set_attribute(element, "aria-label", &text)?;
            }
            Ok(Rewrite::Text)
        }
        _ => match dom.set_inner_html(element, content) {
            Ok(()) => Ok(Rewrite::Markup),
            Err(err) => {
                debug!(event = "inner_html_fallback", element = element.0, error = %err);
                dom.set_text_content(element, &strip_html(content))
                    .map(|()| Rewrite::Text)
            }
        },
    }
}

fn set_button_text<M: Mutator + ?Sized>(
    dom: &mut M,
    element: ElementRef,
    text: &str,
) -> Result<(), DomError> {
    for approach in BUTTON_TEXT_APPROACHES {
        match approach.run(dom, element, text) {
            Ok(()) => {
                let applied = dom
                    .text_content(element)
                    .map(|current| current.trim() == text.trim())
                    .unwrap_or(false);
                if applied {
                    return Ok(());
                }
                debug!(
                    event = "button_text_not_applied",
                    approach = approach.as_str(),
                    element = element.0
                );
            }
            Err(err) => {
                debug!(
                    event = "button_text_failed",
                    approach = approach.as_str(),
                    element = element.0,
                    error = %err
                );
            }
        }
    }
    Err(DomError::TextStrategiesExhausted(element))
}

/// True when any selector reads like it targets a button or submit control. Rules that only
/// touch headings or copy blocks never need insertion watching.
pub fn selectors_warrant_observation<'a, I>(selectors: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    selectors.into_iter().any(|selector| {
        let lowered = selector.to_lowercase();
        OBSERVATION_HINTS.iter().any(|hint| lowered.contains(hint))
    })
}

pub fn is_button_like(inserted: &InsertedElement) -> bool {
    inserted.tag == "button"
        || (inserted.tag == "input"
            && matches!(inserted.input_type.as_deref(), Some("submit" | "button")))
        || inserted.contains_button
}

/// Holds the rule set fetched for a page and keeps it applied as the page renders.
pub struct Personalizer {
    rules: Vec<ContentRule>,
    attribution: AttributionParameters,
    watch: Option<WatchHandle>,
    written: BTreeSet<(usize, ElementRef)>,
}

impl Personalizer {
    pub fn new(rules: Vec<ContentRule>, attribution: AttributionParameters) -> Self {
        Self {
            rules,
            attribution,
            watch: None,
            written: BTreeSet::new(),
        }
    }

    pub fn rules(&self) -> &[ContentRule] {
        &self.rules
    }

    pub fn watch_handle(&self) -> Option<WatchHandle> {
        self.watch
    }

    pub fn apply<M: Mutator + ?Sized>(&mut self, dom: &mut M) -> ApplyReport {
        apply_rules_once(dom, &self.rules, &self.attribution, &mut self.written)
    }

    /// Installs an insertion watch when the matching rules target button-like controls.
    /// Returns whether a watch is active afterwards.
    pub fn watch<M: Mutator + ?Sized>(&mut self, dom: &mut M) -> bool {
        if self.watch.is_some() {
            return true;
        }
        let selectors = self
            .rules
            .iter()
            .filter(|rule| rule.active && rule.matches(&self.attribution))
            .map(|rule| rule.selector.as_str());
        if !selectors_warrant_observation(selectors) {
            debug!(event = "personalize_watch_skipped", rules = self.rules.len());
            return false;
        }

        match dom.watch(is_button_like) {
            Ok(handle) => {
                self.watch = Some(handle);
                true
            }
            Err(err) => {
                warn!(event = "personalize_watch_failed", error = %err);
                false
            }
        }
    }

    /// Re-applies the rule set at most once per batch, and only when the batch brought in a
    /// button-like element. Elements already given markup are not rewritten, so buttons
    /// injected by a rule's own content settle after one pass.
    pub fn handle_insertions<M: Mutator + ?Sized>(
        &mut self,
        dom: &mut M,
        inserted: &[InsertedElement],
    ) -> Option<ApplyReport> {
        self.watch?;
        if !inserted.iter().any(is_button_like) {
            return None;
        }
        Some(self.apply(dom))
    }

    pub fn stop<M: Mutator + ?Sized>(&mut self, dom: &mut M) {
        if let Some(handle) = self.watch.take() {
            dom.unwatch(handle);
        }
    }

    /// Applies once and then watches; the combined report covers the initial pass.
    pub fn apply_and_watch<M: Mutator + ?Sized>(&mut self, dom: &mut M) -> ApplyReport {
        let mut report = ApplyReport::default();
        report.absorb(self.apply(dom));
        self.watch(dom);
        report
    }
}
