//! Entity store and append-only event log.
//!
//! A reconciliation pass talks to the ledger through a [`LedgerTx`]: load the
//! current rows of one kind, then hand back a [`PassPlan`] that is written and
//! committed as a single unit. Readers only ever see committed plans.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use shelfwatch_core::{EntityKind, EntityRecord, EntityRow, Event, EventTarget, EventType};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

pub const CRATE_NAME: &str = "shelfwatch-ledger";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("store unavailable: {0}")]
    Transaction(String),
    #[error("migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::Integrity(db.message().to_string());
            }
        }
        StoreError::Transaction(err.to_string())
    }
}

/// Row mutation addressed by natural key.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    /// New row: active, first_seen = last_seen = pass time, no last change.
    Insert { record: EntityRecord, data_hash: String },
    /// Advance last_seen_at only.
    Touch,
    /// Flip back to active and advance last_seen_at.
    Reactivate,
    /// Store a new fingerprint for unchanged fields (the fingerprint scheme
    /// moved). Forces active and advances last_seen_at; last_change_at stays.
    Rehash { data_hash: String },
    /// Replace mutable fields and hash, stamp last_change_at, force active.
    Update { record: EntityRecord, data_hash: String },
    Deactivate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEvent {
    pub event_type: EventType,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub key: String,
    pub write: RowWrite,
    pub event: Option<PlannedEvent>,
}

/// Everything one pass wants to write. At most one change (and so one event) per key.
#[derive(Debug, Clone, PartialEq)]
pub struct PassPlan {
    pub kind: EntityKind,
    pub pass_time: DateTime<Utc>,
    pub changes: Vec<PlannedChange>,
}

impl PassPlan {
    pub fn event_count(&self, event_type: EventType) -> usize {
        self.changes
            .iter()
            .filter(|c| c.event.as_ref().is_some_and(|e| e.event_type == event_type))
            .count()
    }

    pub fn events(&self) -> impl Iterator<Item = &PlannedEvent> {
        self.changes.iter().filter_map(|c| c.event.as_ref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub rows_written: usize,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub target: Option<EventTarget>,
    pub entity_kind: Option<EntityKind>,
    pub event_type: Option<EventType>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn for_target(target: EventTarget) -> Self {
        Self {
            target: Some(target),
            ..Default::default()
        }
    }

    pub fn of_type(event_type: EventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Default::default()
        }
    }

    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            until: Some(until),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.target.map_or(true, |t| t == event.target)
            && self.entity_kind.map_or(true, |k| k == event.target.kind())
            && self.event_type.map_or(true, |t| t == event.event_type)
            && self.since.map_or(true, |s| event.created_at >= s)
            && self.until.map_or(true, |u| event.created_at < u)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub total: usize,
    pub counts: BTreeMap<String, usize>,
}

/// Per-day event counts (UTC), oldest day first.
pub fn calendar(events: &[Event]) -> Vec<CalendarDay> {
    let mut days: BTreeMap<NaiveDate, BTreeMap<String, usize>> = BTreeMap::new();
    for event in events {
        *days
            .entry(event.created_at.date_naive())
            .or_default()
            .entry(event.event_type.as_str().to_string())
            .or_default() += 1;
    }
    days.into_iter()
        .map(|(date, counts)| CalendarDay {
            date,
            total: counts.values().sum(),
            counts,
        })
        .collect()
}

/// Shared read/write surface over products, files and events.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Open the unit of work for one pass over `kind`.
    async fn begin(&self, kind: EntityKind) -> Result<Box<dyn LedgerTx>, StoreError>;

    async fn active_keys(&self, kind: EntityKind) -> Result<BTreeSet<String>, StoreError>;

    /// Newest `last_seen_at` first.
    async fn list_entities(
        &self,
        kind: EntityKind,
        active: Option<bool>,
    ) -> Result<Vec<EntityRow>, StoreError>;

    async fn get_entity(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRow>, StoreError>;

    /// Newest first.
    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError>;
}

/// One open pass. Dropping it without [`LedgerTx::apply`] discards everything.
#[async_trait]
pub trait LedgerTx: Send {
    fn kind(&self) -> EntityKind;

    /// Current rows of this kind, locked for the rest of the unit of work.
    async fn load(&mut self) -> Result<Vec<EntityRow>, StoreError>;

    /// Write every change and event in `plan`, then commit.
    async fn apply(self: Box<Self>, plan: PassPlan) -> Result<CommitReceipt, StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub(crate) fn check_plan_kind(tx_kind: EntityKind, plan: &PassPlan) -> Result<(), StoreError> {
    if plan.kind != tx_kind {
        return Err(StoreError::Integrity(format!(
            "{} plan applied to a {} unit of work",
            plan.kind, tx_kind
        )));
    }
    for change in &plan.changes {
        if let RowWrite::Insert { record, .. } | RowWrite::Update { record, .. } = &change.write {
            if record.kind() != tx_kind || record.url() != change.key {
                return Err(StoreError::Integrity(format!(
                    "planned record {} does not match key {}",
                    record.url(),
                    change.key
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(id: i64, target: EventTarget, event_type: EventType, day: u32) -> Event {
        Event {
            id,
            target,
            event_type,
            description: String::new(),
            created_at: Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn query_filters_combine() {
        let e = event(1, EventTarget::Product(7), EventType::Updated, 10);
        assert!(EventQuery::for_target(EventTarget::Product(7)).matches(&e));
        assert!(!EventQuery::for_target(EventTarget::File(7)).matches(&e));
        assert!(!EventQuery::of_type(EventType::Created).matches(&e));

        let since = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).single().unwrap();
        let until = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        assert!(!EventQuery::between(since, until).matches(&e), "until is exclusive");
        assert!(EventQuery::between(since, until + chrono::Duration::seconds(1)).matches(&e));
    }

    #[test]
    fn calendar_groups_by_day_and_type() {
        let events = vec![
            event(1, EventTarget::Product(1), EventType::Created, 10),
            event(2, EventTarget::Product(2), EventType::Created, 10),
            event(3, EventTarget::File(1), EventType::FileChanged, 10),
            event(4, EventTarget::Product(1), EventType::Deactivated, 12),
        ];
        let days = calendar(&events);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].total, 3);
        assert_eq!(days[0].counts["created"], 2);
        assert_eq!(days[0].counts["file_changed"], 1);
        assert_eq!(days[1].counts["deactivated"], 1);
    }
}
