//! In-process ledger. Same contract as Postgres: a plan lands whole or not at all.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use shelfwatch_core::{EntityKind, EntityRow, Event, EventTarget};
use tokio::sync::RwLock;

use crate::{
    check_plan_kind, CommitReceipt, EventQuery, Ledger, LedgerTx, PassPlan, RowWrite, StoreError,
};

#[derive(Debug, Clone, Default)]
struct Table {
    version: u64,
    next_id: i64,
    rows: BTreeMap<i64, EntityRow>,
    by_url: HashMap<String, i64>,
}

impl Table {
    fn row_mut(&mut self, key: &str) -> Result<&mut EntityRow, StoreError> {
        let id = self
            .by_url
            .get(key)
            .copied()
            .ok_or_else(|| StoreError::Integrity(format!("no row for natural key {key}")))?;
        self.rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Integrity(format!("index points at missing row {id}")))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<EntityKind, Table>,
    events: Vec<Event>,
    next_event_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events ever appended.
    pub async fn event_len(&self) -> usize {
        self.state.read().await.events.len()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self, kind: EntityKind) -> Result<Box<dyn LedgerTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            kind,
            loaded_version: None,
        }))
    }

    async fn active_keys(&self, kind: EntityKind) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tables
            .get(&kind)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| r.is_active)
                    .map(|r| r.key().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        active: Option<bool>,
    ) -> Result<Vec<EntityRow>, StoreError> {
        let state = self.state.read().await;
        let mut rows: Vec<EntityRow> = state
            .tables
            .get(&kind)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| active.map_or(true, |a| r.is_active == a))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn get_entity(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRow>, StoreError> {
        let state = self.state.read().await;
        Ok(state.tables.get(&kind).and_then(|t| t.rows.get(&id)).cloned())
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

struct MemoryTx {
    state: Arc<RwLock<MemoryState>>,
    kind: EntityKind,
    loaded_version: Option<u64>,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn load(&mut self) -> Result<Vec<EntityRow>, StoreError> {
        let state = self.state.read().await;
        let table = state.tables.get(&self.kind).cloned().unwrap_or_default();
        self.loaded_version = Some(table.version);
        Ok(table.rows.into_values().collect())
    }

    async fn apply(self: Box<Self>, plan: PassPlan) -> Result<CommitReceipt, StoreError> {
        check_plan_kind(self.kind, &plan)?;
        let mut state = self.state.write().await;

        let mut table = state.tables.get(&self.kind).cloned().unwrap_or_default();
        if self.loaded_version != Some(table.version) {
            return Err(StoreError::Integrity(format!(
                "{} snapshot is stale; another writer committed first",
                self.kind
            )));
        }

        // Work on copies so a failure halfway leaves the shared state untouched.
        let mut next_event_id = state.next_event_id;
        let mut appended = Vec::new();
        let pass_time = plan.pass_time;

        for change in &plan.changes {
            let id = match &change.write {
                RowWrite::Insert { record, data_hash } => {
                    if table.by_url.contains_key(&change.key) {
                        return Err(StoreError::Integrity(format!(
                            "duplicate natural key {}",
                            change.key
                        )));
                    }
                    table.next_id += 1;
                    let id = table.next_id;
                    table.by_url.insert(change.key.clone(), id);
                    table.rows.insert(
                        id,
                        EntityRow {
                            id,
                            record: record.clone(),
                            data_hash: data_hash.clone(),
                            first_seen_at: pass_time,
                            last_seen_at: pass_time,
                            last_change_at: None,
                            is_active: true,
                        },
                    );
                    id
                }
                RowWrite::Touch => {
                    let row = table.row_mut(&change.key)?;
                    row.last_seen_at = row.last_seen_at.max(pass_time);
                    row.id
                }
                RowWrite::Reactivate => {
                    let row = table.row_mut(&change.key)?;
                    row.is_active = true;
                    row.last_seen_at = row.last_seen_at.max(pass_time);
                    row.id
                }
                RowWrite::Rehash { data_hash } => {
                    let row = table.row_mut(&change.key)?;
                    row.data_hash = data_hash.clone();
                    row.is_active = true;
                    row.last_seen_at = row.last_seen_at.max(pass_time);
                    row.id
                }
                RowWrite::Update { record, data_hash } => {
                    let row = table.row_mut(&change.key)?;
                    row.record = record.clone();
                    row.data_hash = data_hash.clone();
                    row.last_seen_at = row.last_seen_at.max(pass_time);
                    row.last_change_at = Some(pass_time);
                    row.is_active = true;
                    row.id
                }
                RowWrite::Deactivate => {
                    let row = table.row_mut(&change.key)?;
                    row.is_active = false;
                    row.id
                }
            };

            if let Some(planned) = &change.event {
                next_event_id += 1;
                appended.push(Event {
                    id: next_event_id,
                    target: EventTarget::new(self.kind, id),
                    event_type: planned.event_type,
                    description: planned.description.clone(),
                    created_at: pass_time,
                });
            }
        }

        table.version += 1;
        state.tables.insert(self.kind, table);
        state.next_event_id = next_event_id;
        state.events.extend(appended.iter().cloned());

        Ok(CommitReceipt {
            rows_written: plan.changes.len(),
            events: appended,
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
