use crate::{AttributionField, AttributionParameters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const ELEMENT_TEXT_MAX_CHARS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("rule {field} cannot be empty")]
    EmptyRuleField { field: &'static str },
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Pageview,
    Click,
    ScrollDepth,
    FormSubmit,
    MouseMovement,
    SectionView,
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Pageview => "pageview",
            EventType::Click => "click",
            EventType::ScrollDepth => "scroll_depth",
            EventType::FormSubmit => "form_submit",
            EventType::MouseMovement => "mouse_movement",
            EventType::SectionView => "section_view",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "pageview" => Ok(EventType::Pageview),
            "click" => Ok(EventType::Click),
            "scroll_depth" => Ok(EventType::ScrollDepth),
            "form_submit" => Ok(EventType::FormSubmit),
            "mouse_movement" => Ok(EventType::MouseMovement),
            "section_view" => Ok(EventType::SectionView),
            "custom" => Ok(EventType::Custom),
            other => Err(ContractError::UnknownEventType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MouseSample {
    pub x: i32,
    pub y: i32,
    /// Milliseconds since the page was entered.
    pub t: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElementDescriptor {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl ElementDescriptor {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_lowercase(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !trimmed.is_empty() {
            self.text = Some(trimmed.chars().take(ELEMENT_TEXT_MAX_CHARS).collect());
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventContext {
    pub client_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journey_id: Option<String>,
    pub page_url: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub attribution: AttributionParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_touch: Option<AttributionParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_sequence: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_page_url: Option<String>,
    /// Seconds spent on the previous page of the journey.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_on_previous_page: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventBody {
    Pageview,
    Click {
        x: i32,
        y: i32,
        element: ElementDescriptor,
    },
    ScrollDepth {
        depth_percent: u8,
    },
    FormSubmit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        form_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        form_action: Option<String>,
        #[serde(default)]
        field_names: Vec<String>,
    },
    MouseMovement {
        movements: Vec<MouseSample>,
    },
    SectionView {
        section_id: String,
        visible_ratio: f64,
    },
    Custom {
        name: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
}

impl EventBody {
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::Pageview => EventType::Pageview,
            EventBody::Click { .. } => EventType::Click,
            EventBody::ScrollDepth { .. } => EventType::ScrollDepth,
            EventBody::FormSubmit { .. } => EventType::FormSubmit,
            EventBody::MouseMovement { .. } => EventType::MouseMovement,
            EventBody::SectionView { .. } => EventType::SectionView,
            EventBody::Custom { .. } => EventType::Custom,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingEvent {
    #[serde(flatten)]
    pub context: EventContext,
    #[serde(flatten)]
    pub body: EventBody,
}

impl TrackingEvent {
    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentRule {
    pub id: String,
    pub selector: String,
    pub condition_type: AttributionField,
    pub condition_value: String,
    pub replacement_content: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub usage_count: u64,
}

fn default_active() -> bool {
    true
}

impl ContentRule {
    pub fn new(
        id: String,
        selector: String,
        condition_type: AttributionField,
        condition_value: String,
        replacement_content: String,
    ) -> Result<Self, ContractError> {
        if selector.trim().is_empty() {
            return Err(ContractError::EmptyRuleField { field: "selector" });
        }
        if condition_value.is_empty() {
            return Err(ContractError::EmptyRuleField {
                field: "condition_value",
            });
        }

        Ok(Self {
            id,
            selector,
            condition_type,
            condition_value,
            replacement_content,
            active: true,
            usage_count: 0,
        })
    }

    /// Exact, case-sensitive comparison against the rule's single condition.
    pub fn matches(&self, params: &AttributionParameters) -> bool {
        params.get(self.condition_type) == Some(self.condition_value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleUsageRecord {
    pub rule_id: String,
    pub condition_type: AttributionField,
    pub condition_value: String,
    pub used_at: DateTime<Utc>,
}

impl RuleUsageRecord {
    pub fn for_rule(rule: &ContentRule, used_at: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule.id.clone(),
            condition_type: rule.condition_type,
            condition_value: rule.condition_value.clone(),
            used_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RulesResponse {
    pub rules: Vec<ContentRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestAck {
    pub success: bool,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestFailure {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
