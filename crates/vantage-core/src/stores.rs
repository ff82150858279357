use crate::contracts::{ContentRule, MouseSample, RuleUsageRecord};
use crate::AttributionParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}")]
    Backend(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn message(&self) -> &str {
        match self {
            StoreError::Backend(message) | StoreError::Unavailable(message) => message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageviewRecord {
    pub event_type: String,
    pub client_id: String,
    pub session_id: String,
    pub journey_id: Option<String>,
    pub page_url: String,
    pub referrer: Option<String>,
    pub page_title: Option<String>,
    pub attribution: AttributionParameters,
    pub first_touch: Option<AttributionParameters>,
    pub viewport_width: Option<u32>,
    pub viewport_height: Option<u32>,
    pub user_agent: Option<String>,
    pub visit_count: Option<u64>,
    pub first_visit: bool,
    pub is_direct: bool,
    /// Event-specific fields (scroll depth, form metadata, custom properties).
    pub details: Value,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JourneyRecord {
    pub journey_id: String,
    pub client_id: String,
    pub session_id: String,
    pub page_url: String,
    pub previous_page_url: Option<String>,
    pub page_sequence: Option<u32>,
    pub time_on_previous_page: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClickRecord {
    pub client_id: String,
    pub session_id: String,
    pub page_url: String,
    pub x: i32,
    pub y: i32,
    pub element_tag: Option<String>,
    pub element_id: Option<String>,
    pub element_classes: Vec<String>,
    pub element_text: Option<String>,
    pub element_href: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MouseMovementRecord {
    pub client_id: String,
    pub session_id: String,
    pub page_url: String,
    pub movements: Vec<MouseSample>,
    pub viewport_width: Option<u32>,
    pub viewport_height: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

pub trait RuleStore {
    fn active_rules(&self) -> Result<Vec<ContentRule>, StoreError>;
    fn record_rule_usage(&self, usage: &RuleUsageRecord) -> Result<(), StoreError>;
}

pub trait EventStore {
    fn has_prior_visit(&self, client_id: &str) -> Result<bool, StoreError>;
    fn insert_pageview(&self, record: &PageviewRecord) -> Result<(), StoreError>;
    fn insert_journey(&self, record: &JourneyRecord) -> Result<(), StoreError>;
    fn insert_click(&self, record: &ClickRecord) -> Result<(), StoreError>;
    fn insert_mouse_movement(&self, record: &MouseMovementRecord) -> Result<(), StoreError>;
}
