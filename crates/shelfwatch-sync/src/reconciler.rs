//! Pure reconciliation of one observation batch against a loaded snapshot.
//!
//! A pass is `begin_pass` → `observe`* → `end_pass`. Nothing here touches the
//! store; the resulting [`PassPlan`] is handed back to the ledger transaction
//! the snapshot was loaded from.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shelfwatch_core::{
    describe_changes, Canonicalizer, EntityKind, EntityRow, EventType, Observation,
};
use shelfwatch_ledger::{PassPlan, PlannedChange, PlannedEvent, RowWrite, StoreError};
use thiserror::Error;
use tracing::warn;

use crate::lease::LeaseError;

#[derive(Debug, Error)]
pub enum PassError {
    #[error(
        "sweep guard tripped for {kind}: saw {seen} keys against {active} active rows \
         (minimum fraction {min_fraction})"
    )]
    SweepGuard {
        kind: EntityKind,
        seen: usize,
        active: usize,
        min_fraction: f64,
    },
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("transaction failed: {0}")]
    Transaction(String),
    #[error("{kind} pass already running as {owner} until {expires_at}")]
    LeaseHeld {
        kind: EntityKind,
        owner: String,
        expires_at: DateTime<Utc>,
    },
    #[error("{kind} pass timed out after {timeout:?}")]
    Timeout { kind: EntityKind, timeout: Duration },
}

impl PassError {
    /// Whether the next trigger may simply try again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PassError::Transaction(_) | PassError::LeaseHeld { .. } | PassError::Timeout { .. }
        )
    }
}

impl From<StoreError> for PassError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Integrity(msg) => PassError::Integrity(msg),
            StoreError::Transaction(msg) | StoreError::Migration(msg) => PassError::Transaction(msg),
        }
    }
}

impl From<LeaseError> for PassError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Held {
                kind,
                owner,
                expires_at,
            } => PassError::LeaseHeld {
                kind,
                owner,
                expires_at,
            },
            LeaseError::Backend(msg) => PassError::Transaction(msg),
        }
    }
}

/// Natural keys observed during the current pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenSet(HashSet<String>);

impl SeenSet {
    pub fn insert(&mut self, key: &str) -> bool {
        self.0.insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a single observation resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    Created,
    Unchanged,
    Reactivated,
    Updated,
}

/// Working state of one open pass.
#[derive(Debug)]
pub struct PassState {
    kind: EntityKind,
    pass_time: DateTime<Utc>,
    rows: HashMap<String, EntityRow>,
    seen: SeenSet,
    // First-observation order, for a stable plan.
    order: Vec<String>,
    planned: HashMap<String, PlannedChange>,
    collisions: usize,
}

impl PassState {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn pass_time(&self) -> DateTime<Utc> {
        self.pass_time
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Observations that repeated a key already seen in this batch.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn active_count(&self) -> usize {
        self.rows.values().filter(|r| r.is_active).count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    canonicalizer: Canonicalizer,
    min_seen_fraction: f64,
}

impl Reconciler {
    pub const DEFAULT_MIN_SEEN_FRACTION: f64 = 0.5;

    /// `min_seen_fraction` is clamped to `[0, 1]`; zero disables the sweep guard.
    pub fn new(canonicalizer: Canonicalizer, min_seen_fraction: f64) -> Self {
        let min_seen_fraction = if min_seen_fraction.is_finite() {
            min_seen_fraction.clamp(0.0, 1.0)
        } else {
            Self::DEFAULT_MIN_SEEN_FRACTION
        };
        Self {
            canonicalizer,
            min_seen_fraction,
        }
    }

    pub fn canonicalizer(&self) -> &Canonicalizer {
        &self.canonicalizer
    }

    pub fn min_seen_fraction(&self) -> f64 {
        self.min_seen_fraction
    }

    pub fn begin_pass(
        &self,
        kind: EntityKind,
        snapshot: Vec<EntityRow>,
        pass_time: DateTime<Utc>,
    ) -> Result<PassState, PassError> {
        let mut rows = HashMap::with_capacity(snapshot.len());
        for row in snapshot {
            if row.kind() != kind {
                return Err(PassError::Integrity(format!(
                    "{} row {} in a {} snapshot",
                    row.kind(),
                    row.id,
                    kind
                )));
            }
            let key = row.key().to_string();
            if let Some(previous) = rows.insert(key.clone(), row) {
                return Err(PassError::Integrity(format!(
                    "natural key {key} appears twice in the {kind} snapshot (row {})",
                    previous.id
                )));
            }
        }
        Ok(PassState {
            kind,
            pass_time,
            rows,
            seen: SeenSet::default(),
            order: Vec::new(),
            planned: HashMap::new(),
            collisions: 0,
        })
    }

    pub fn observe(
        &self,
        state: &mut PassState,
        observation: Observation,
    ) -> Result<ObserveOutcome, PassError> {
        let kind = state.kind;
        if observation.record.kind() != kind {
            return Err(PassError::Integrity(format!(
                "{} observation {} in a {} pass",
                observation.record.kind(),
                observation.key(),
                kind
            )));
        }

        let key = observation.key().to_string();
        if !state.seen.insert(&key) {
            state.collisions += 1;
            warn!(%kind, %key, "key observed twice in one batch; keeping the last observation");
        } else {
            state.order.push(key.clone());
        }

        // Always judged against the persisted row, never an earlier observation.
        let (outcome, change) = match state.rows.get(&key) {
            None => (
                ObserveOutcome::Created,
                PlannedChange {
                    key: key.clone(),
                    event: Some(PlannedEvent {
                        event_type: EventType::Created,
                        description: format!(
                            "{} created: {}",
                            noun(kind),
                            observation.record.label()
                        ),
                    }),
                    write: RowWrite::Insert {
                        record: observation.record,
                        data_hash: observation.fingerprint,
                    },
                },
            ),
            Some(row) if row.data_hash == observation.fingerprint => {
                if row.is_active {
                    (
                        ObserveOutcome::Unchanged,
                        PlannedChange {
                            key: key.clone(),
                            write: RowWrite::Touch,
                            event: None,
                        },
                    )
                } else {
                    (
                        ObserveOutcome::Reactivated,
                        PlannedChange {
                            key: key.clone(),
                            write: RowWrite::Reactivate,
                            event: Some(PlannedEvent {
                                event_type: EventType::Reactivated,
                                description: format!(
                                    "{} reappeared: {}",
                                    noun(kind),
                                    row.record.label()
                                ),
                            }),
                        },
                    )
                }
            }
            // Same fields hashed under a different fingerprint configuration.
            Some(row) if row.record == observation.record => {
                let event = (!row.is_active).then(|| PlannedEvent {
                    event_type: EventType::Reactivated,
                    description: format!("{} reappeared: {}", noun(kind), row.record.label()),
                });
                (
                    if row.is_active {
                        ObserveOutcome::Unchanged
                    } else {
                        ObserveOutcome::Reactivated
                    },
                    PlannedChange {
                        key: key.clone(),
                        write: RowWrite::Rehash {
                            data_hash: observation.fingerprint,
                        },
                        event,
                    },
                )
            }
            Some(row) => {
                let changes = self.canonicalizer.diff(&row.record, &observation.record);
                let mut description = format!(
                    "{} {}: {}",
                    noun(kind),
                    if kind == EntityKind::File { "changed" } else { "updated" },
                    observation.record.label()
                );
                if !changes.is_empty() {
                    description.push_str(" (");
                    description.push_str(&describe_changes(&changes));
                    description.push(')');
                }
                if !row.is_active {
                    description.push_str("; reactivated");
                }
                let event_type = match kind {
                    EntityKind::Product => EventType::Updated,
                    EntityKind::File => EventType::FileChanged,
                };
                (
                    ObserveOutcome::Updated,
                    PlannedChange {
                        key: key.clone(),
                        event: Some(PlannedEvent {
                            event_type,
                            description,
                        }),
                        write: RowWrite::Update {
                            record: observation.record,
                            data_hash: observation.fingerprint,
                        },
                    },
                )
            }
        };

        state.planned.insert(key, change);
        Ok(outcome)
    }

    pub fn end_pass(&self, state: PassState) -> Result<PassPlan, PassError> {
        let PassState {
            kind,
            pass_time,
            rows,
            seen,
            order,
            mut planned,
            ..
        } = state;

        let active = rows.values().filter(|r| r.is_active).count();
        if active > 0 && (seen.len() as f64) < self.min_seen_fraction * active as f64 {
            return Err(PassError::SweepGuard {
                kind,
                seen: seen.len(),
                active,
                min_fraction: self.min_seen_fraction,
            });
        }

        let mut changes: Vec<PlannedChange> = order
            .iter()
            .filter_map(|key| planned.remove(key))
            .collect();

        let mut missing: Vec<&EntityRow> = rows
            .values()
            .filter(|r| r.is_active && !seen.contains(r.key()))
            .collect();
        missing.sort_by_key(|r| r.id);
        changes.extend(missing.into_iter().map(|row| PlannedChange {
            key: row.key().to_string(),
            write: RowWrite::Deactivate,
            event: Some(PlannedEvent {
                event_type: EventType::Deactivated,
                description: format!("{} no longer listed: {}", noun(kind), row.record.label()),
            }),
        }));

        Ok(PassPlan {
            kind,
            pass_time,
            changes,
        })
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(Canonicalizer::default(), Self::DEFAULT_MIN_SEEN_FRACTION)
    }
}

fn noun(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "Product",
        EntityKind::File => "File",
    }
}

/// Counts for one committed (or planned) pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub kind: Option<EntityKind>,
    pub pass_time: Option<DateTime<Utc>>,
    pub observed: usize,
    pub rejected: Vec<RejectedRecord>,
    pub collisions: usize,
    pub created: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    pub unchanged: usize,
    pub events_appended: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    /// Position in the incoming batch.
    pub index: usize,
    pub reason: String,
}

impl PassReport {
    pub fn from_plan(plan: &PassPlan) -> Self {
        let mut report = Self {
            kind: Some(plan.kind),
            pass_time: Some(plan.pass_time),
            ..Self::default()
        };
        for change in &plan.changes {
            match &change.write {
                RowWrite::Insert { .. } => report.created += 1,
                RowWrite::Update { .. } => report.updated += 1,
                RowWrite::Reactivate => report.reactivated += 1,
                RowWrite::Rehash { .. } if change.event.is_some() => report.reactivated += 1,
                RowWrite::Rehash { .. } => report.unchanged += 1,
                RowWrite::Deactivate => report.deactivated += 1,
                RowWrite::Touch => report.unchanged += 1,
            }
        }
        report.events_appended = plan.events().count();
        report
    }

    pub fn summary(&self) -> String {
        format!(
            "{} pass: observed={} rejected={} collisions={} created={} updated={} reactivated={} deactivated={} unchanged={}",
            self.kind.map(EntityKind::as_str).unwrap_or("empty"),
            self.observed,
            self.rejected.len(),
            self.collisions,
            self.created,
            self.updated,
            self.reactivated,
            self.deactivated,
            self.unchanged
        )
    }
}
