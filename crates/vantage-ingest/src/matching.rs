use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use vantage_core::contracts::{ContentRule, RuleUsageRecord};
use vantage_core::stores::{RuleStore, StoreError};
use vantage_core::AttributionParameters;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("rule store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingConfig {
    /// Emit one usage record per returned rule.
    pub record_usage: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { record_usage: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleMatcher {
    config: MatchingConfig,
}

impl RuleMatcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    /// Active rules whose condition equals the request's value for that field. A request
    /// with no attribution at all never touches the store.
    pub fn match_rules<S: RuleStore + ?Sized>(
        &self,
        store: &S,
        params: &AttributionParameters,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContentRule>, MatchError> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let matched: Vec<ContentRule> = store
            .active_rules()?
            .into_iter()
            .filter(|rule| rule.active && rule.matches(params))
            .collect();
        debug!(
            event = "rules_matched",
            matched = matched.len(),
            fields = params.present().count()
        );

        if self.config.record_usage {
            for rule in &matched {
                let usage = RuleUsageRecord::for_rule(rule, now);
                if let Err(err) = store.record_rule_usage(&usage) {
                    warn!(event = "rule_usage_failed", rule_id = %rule.id, error = %err);
                }
            }
        }
        Ok(matched)
    }
}

pub fn match_rules<S: RuleStore + ?Sized>(
    store: &S,
    params: &AttributionParameters,
    now: DateTime<Utc>,
) -> Result<Vec<ContentRule>, MatchError> {
    RuleMatcher::default().match_rules(store, params, now)
}
