use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;
use vantage_core::contracts::{ContentRule, MouseSample, RuleUsageRecord};
use vantage_core::stores::{
    ClickRecord, EventStore, JourneyRecord, MouseMovementRecord, PageviewRecord, RuleStore,
    StoreError,
};
use vantage_core::{AttributionField, AttributionParameters};

pub const TRACKING_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJourneyStep {
    pub page_url: String,
    pub previous_page_url: Option<String>,
    pub page_sequence: Option<u32>,
    pub time_on_previous_page: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPageview {
    pub event_type: String,
    pub client_id: String,
    pub page_url: String,
    pub attribution: AttributionParameters,
    pub first_visit: bool,
    pub is_direct: bool,
    pub occurred_at: DateTime<Utc>,
}

/// SQLite-backed Rule Store and Event Store.
pub struct TrackingStore {
    conn: Connection,
}

impl TrackingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > TRACKING_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: TRACKING_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_tracking_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_rule_usage.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn upsert_rule(&self, rule: &ContentRule) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO content_rules (
                rule_id,
                selector,
                condition_type,
                condition_value,
                replacement_content,
                active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(rule_id) DO UPDATE SET
                selector=excluded.selector,
                condition_type=excluded.condition_type,
                condition_value=excluded.condition_value,
                replacement_content=excluded.replacement_content,
                active=excluded.active
            ",
            params![
                rule.id,
                rule.selector,
                rule.condition_type.as_str(),
                rule.condition_value,
                rule.replacement_content,
                rule.active,
            ],
        )?;

        Ok(())
    }

    pub fn set_rule_active(&self, rule_id: &str, active: bool) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "UPDATE content_rules SET active = ?2 WHERE rule_id = ?1",
            params![rule_id, active],
        )?;
        Ok(changes > 0)
    }

    pub fn rule(&self, rule_id: &str) -> Result<Option<ContentRule>, StorageError> {
        let rule = self
            .conn
            .query_row(
                "
                SELECT rule_id, selector, condition_type, condition_value,
                       replacement_content, active, usage_count
                FROM content_rules
                WHERE rule_id = ?1
                ",
                [rule_id],
                rule_from_row,
            )
            .optional()?;
        Ok(rule)
    }

    pub fn load_active_rules(&self) -> Result<Vec<ContentRule>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT rule_id, selector, condition_type, condition_value,
                   replacement_content, active, usage_count
            FROM content_rules
            WHERE active = 1
            ORDER BY rule_id ASC
            ",
        )?;
        let rows = stmt.query_map([], rule_from_row)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    pub fn insert_rule_usage(&self, usage: &RuleUsageRecord) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "
            INSERT INTO rule_usage (rule_id, condition_type, condition_value, used_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                usage.rule_id,
                usage.condition_type.as_str(),
                usage.condition_value,
                usage.used_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE content_rules SET usage_count = usage_count + 1 WHERE rule_id = ?1",
            [&usage.rule_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn rule_usage_count(&self, rule_id: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM rule_usage WHERE rule_id = ?1",
            [rule_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn client_has_pageview(&self, client_id: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM pageviews WHERE client_id = ?1 LIMIT 1",
                [client_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn append_pageview(&self, record: &PageviewRecord) -> Result<(), StorageError> {
        let first_touch_json = record
            .first_touch
            .as_ref()
            .map(|first_touch| {
                serde_json::to_string(first_touch)
                    .map_err(|err| StorageError::Serialization(err.to_string()))
            })
            .transpose()?;
        let details_json = serde_json::to_string(&record.details)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn.execute(
            "
            INSERT INTO pageviews (
                event_type,
                client_id,
                session_id,
                journey_id,
                page_url,
                referrer,
                page_title,
                utm_source,
                utm_medium,
                utm_campaign,
                utm_term,
                utm_content,
                first_touch_json,
                viewport_width,
                viewport_height,
                user_agent,
                visit_count,
                first_visit,
                is_direct,
                details_json,
                occurred_at,
                received_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
            )
            ",
            params![
                record.event_type,
                record.client_id,
                record.session_id,
                record.journey_id,
                record.page_url,
                record.referrer,
                record.page_title,
                record.attribution.utm_source,
                record.attribution.utm_medium,
                record.attribution.utm_campaign,
                record.attribution.utm_term,
                record.attribution.utm_content,
                first_touch_json,
                record.viewport_width,
                record.viewport_height,
                record.user_agent,
                record.visit_count.map(|count| count as i64),
                record.first_visit,
                record.is_direct,
                details_json,
                record.occurred_at.to_rfc3339(),
                record.received_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn pageviews_for_client(
        &self,
        client_id: &str,
    ) -> Result<Vec<StoredPageview>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT event_type, client_id, page_url, utm_source, utm_medium, utm_campaign,
                   utm_term, utm_content, first_visit, is_direct, occurred_at
            FROM pageviews
            WHERE client_id = ?1
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map([client_id], |row| {
            Ok(StoredPageview {
                event_type: row.get(0)?,
                client_id: row.get(1)?,
                page_url: row.get(2)?,
                attribution: AttributionParameters {
                    utm_source: row.get(3)?,
                    utm_medium: row.get(4)?,
                    utm_campaign: row.get(5)?,
                    utm_term: row.get(6)?,
                    utm_content: row.get(7)?,
                },
                first_visit: row.get(8)?,
                is_direct: row.get(9)?,
                occurred_at: timestamp_column(row, 10)?,
            })
        })?;

        let mut pageviews = Vec::new();
        for row in rows {
            pageviews.push(row?);
        }
        Ok(pageviews)
    }

    pub fn append_journey(&self, record: &JourneyRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO journeys (
                journey_id,
                client_id,
                session_id,
                page_url,
                previous_page_url,
                page_sequence,
                time_on_previous_page,
                occurred_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                record.journey_id,
                record.client_id,
                record.session_id,
                record.page_url,
                record.previous_page_url,
                record.page_sequence,
                record.time_on_previous_page.map(|secs| secs as i64),
                record.occurred_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn journey_steps(&self, journey_id: &str) -> Result<Vec<StoredJourneyStep>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT page_url, previous_page_url, page_sequence, time_on_previous_page, occurred_at
            FROM journeys
            WHERE journey_id = ?1
            ORDER BY occurred_at ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([journey_id], |row| {
            Ok(StoredJourneyStep {
                page_url: row.get(0)?,
                previous_page_url: row.get(1)?,
                page_sequence: row.get(2)?,
                time_on_previous_page: row.get::<_, Option<i64>>(3)?.map(|secs| secs as u64),
                occurred_at: timestamp_column(row, 4)?,
            })
        })?;

        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?);
        }
        Ok(steps)
    }

    pub fn append_click(&self, record: &ClickRecord) -> Result<(), StorageError> {
        let classes_json = serde_json::to_string(&record.element_classes)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn.execute(
            "
            INSERT INTO clicks (
                client_id,
                session_id,
                page_url,
                x,
                y,
                element_tag,
                element_id,
                element_classes_json,
                element_text,
                element_href,
                occurred_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                record.client_id,
                record.session_id,
                record.page_url,
                record.x,
                record.y,
                record.element_tag,
                record.element_id,
                classes_json,
                record.element_text,
                record.element_href,
                record.occurred_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn click_count(&self, session_id: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM clicks WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn append_mouse_movement(&self, record: &MouseMovementRecord) -> Result<(), StorageError> {
        let movements_json = serde_json::to_string(&record.movements)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn.execute(
            "
            INSERT INTO mouse_movements (
                client_id,
                session_id,
                page_url,
                movements_json,
                viewport_width,
                viewport_height,
                occurred_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                record.client_id,
                record.session_id,
                record.page_url,
                movements_json,
                record.viewport_width,
                record.viewport_height,
                record.occurred_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn mouse_movements_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Vec<MouseSample>>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT movements_json FROM mouse_movements WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([session_id], |row| row.get::<_, String>(0))?;

        let mut batches = Vec::new();
        for row in rows {
            let samples: Vec<MouseSample> = serde_json::from_str(&row?)
                .map_err(|err| StorageError::Serialization(err.to_string()))?;
            batches.push(samples);
        }
        Ok(batches)
    }
}

impl RuleStore for TrackingStore {
    fn active_rules(&self) -> Result<Vec<ContentRule>, StoreError> {
        Ok(self.load_active_rules()?)
    }

    fn record_rule_usage(&self, usage: &RuleUsageRecord) -> Result<(), StoreError> {
        Ok(self.insert_rule_usage(usage)?)
    }
}

impl EventStore for TrackingStore {
    fn has_prior_visit(&self, client_id: &str) -> Result<bool, StoreError> {
        Ok(self.client_has_pageview(client_id)?)
    }

    fn insert_pageview(&self, record: &PageviewRecord) -> Result<(), StoreError> {
        Ok(self.append_pageview(record)?)
    }

    fn insert_journey(&self, record: &JourneyRecord) -> Result<(), StoreError> {
        Ok(self.append_journey(record)?)
    }

    fn insert_click(&self, record: &ClickRecord) -> Result<(), StoreError> {
        Ok(self.append_click(record)?)
    }

    fn insert_mouse_movement(&self, record: &MouseMovementRecord) -> Result<(), StoreError> {
        Ok(self.append_mouse_movement(record)?)
    }
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<ContentRule> {
    let condition_type: String = row.get(2)?;
    let condition_type = condition_type
        .parse::<AttributionField>()
        .map_err(|err| conversion_error(2, err))?;

    Ok(ContentRule {
        id: row.get(0)?,
        selector: row.get(1)?,
        condition_type,
        condition_value: row.get(3)?,
        replacement_content: row.get(4)?,
        active: row.get(5)?,
        usage_count: row.get::<_, i64>(6)? as u64,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(value).map_err(|err| conversion_error(idx, err.to_string()))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
