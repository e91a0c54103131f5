//! Local file audit: re-hash the stored bytes behind every active file row.
//!
//! The audit only sees files it could inspect, so it never sweeps. A row is
//! deactivated only when its bytes are positively gone.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use shelfwatch_core::{
    describe_changes, Canonicalizer, EntityKind, EntityRecord, EntityRow, EventType, FileFields,
};
use shelfwatch_ledger::{PassPlan, PlannedChange, PlannedEvent, RowWrite};
use shelfwatch_storage::AssetStore;
use tokio::fs;
use tracing::warn;

use crate::reconciler::PassError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalFileState {
    Missing,
    /// Present but could not be read; left alone this round.
    Unreadable(String),
    Hashed(String),
}

pub async fn inspect_local_file(path: &Path) -> LocalFileState {
    match fs::read(path).await {
        Ok(bytes) => LocalFileState::Hashed(AssetStore::sha256_hex(&bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => LocalFileState::Missing,
        Err(err) => LocalFileState::Unreadable(err.to_string()),
    }
}

/// Plan for the active rows of a file snapshot given what was found on disk.
/// Rows without an entry in `states` are not touched.
pub fn plan_local_file_audit(
    snapshot: &[EntityRow],
    states: &HashMap<String, LocalFileState>,
    pass_time: DateTime<Utc>,
) -> Result<PassPlan, PassError> {
    let mut rows: Vec<&EntityRow> = snapshot.iter().filter(|r| r.is_active).collect();
    rows.sort_by_key(|r| r.id);

    let mut changes = Vec::new();
    for row in rows {
        let EntityRecord::File(file) = &row.record else {
            return Err(PassError::Integrity(format!(
                "{} row {} in a file audit",
                row.kind(),
                row.id
            )));
        };
        let key = row.key().to_string();
        match states.get(&key) {
            None => {}
            Some(LocalFileState::Unreadable(reason)) => {
                warn!(%key, path = %file.local_path, %reason, "cannot read local file; skipping");
            }
            Some(LocalFileState::Missing) => changes.push(PlannedChange {
                key,
                write: RowWrite::Deactivate,
                event: Some(PlannedEvent {
                    event_type: EventType::Deactivated,
                    description: format!("File missing from disk: {}", file.filename),
                }),
            }),
            Some(LocalFileState::Hashed(hash)) if *hash == file.hash => {}
            Some(LocalFileState::Hashed(hash)) => {
                let record = EntityRecord::File(FileFields {
                    hash: hash.clone(),
                    ..file.clone()
                });
                let diff = Canonicalizer::default().diff(&row.record, &record);
                changes.push(PlannedChange {
                    key,
                    write: RowWrite::Update {
                        record,
                        data_hash: hash.clone(),
                    },
                    event: Some(PlannedEvent {
                        event_type: EventType::FileChanged,
                        description: format!(
                            "File changed on disk: {} ({})",
                            file.filename,
                            describe_changes(&diff)
                        ),
                    }),
                });
            }
        }
    }

    Ok(PassPlan {
        kind: EntityKind::File,
        pass_time,
        changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, hour, 0, 0).single().unwrap()
    }

    fn file_row(id: i64, name: &str, hash: &str, active: bool) -> EntityRow {
        EntityRow {
            id,
            record: EntityRecord::File(FileFields {
                url: format!("https://s.example/{name}"),
                filename: name.to_string(),
                local_path: format!("/srv/assets/{name}"),
                mime_type: None,
                hash: hash.to_string(),
            }),
            data_hash: hash.to_string(),
            first_seen_at: t(1),
            last_seen_at: t(1),
            last_change_at: None,
            is_active: active,
        }
    }

    #[test]
    fn audit_flags_changed_and_missing_files_only() {
        let rows = vec![
            file_row(1, "same.pdf", "aaaa", true),
            file_row(2, "edited.pdf", "bbbb1111bbbb2222", true),
            file_row(3, "gone.pdf", "cccc", true),
            file_row(4, "locked.pdf", "dddd", true),
            file_row(5, "unchecked.pdf", "eeee", true),
            file_row(6, "retired.pdf", "ffff", false),
        ];
        let states = HashMap::from([
            ("https://s.example/same.pdf".to_string(), LocalFileState::Hashed("aaaa".into())),
            (
                "https://s.example/edited.pdf".to_string(),
                LocalFileState::Hashed("9999888877776666".into()),
            ),
            ("https://s.example/gone.pdf".to_string(), LocalFileState::Missing),
            (
                "https://s.example/locked.pdf".to_string(),
                LocalFileState::Unreadable("permission denied".into()),
            ),
            ("https://s.example/retired.pdf".to_string(), LocalFileState::Missing),
        ]);

        let plan = plan_local_file_audit(&rows, &states, t(2)).unwrap();
        assert_eq!(plan.changes.len(), 2);
        assert_eq!(plan.event_count(EventType::FileChanged), 1);
        assert_eq!(plan.event_count(EventType::Deactivated), 1);

        let edited = &plan.changes[0];
        assert_eq!(edited.key, "https://s.example/edited.pdf");
        let RowWrite::Update { data_hash, .. } = &edited.write else {
            panic!("expected an update");
        };
        assert_eq!(data_hash, "9999888877776666");
        let description = &edited.event.as_ref().unwrap().description;
        assert!(description.contains("hash: bbbb1111bbbb → 999988887777"), "{description}");

        assert_eq!(plan.changes[1].key, "https://s.example/gone.pdf");
        assert_eq!(plan.changes[1].write, RowWrite::Deactivate);
    }

    #[tokio::test]
    async fn inspection_distinguishes_missing_from_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        assert_eq!(inspect_local_file(&path).await, LocalFileState::Missing);

        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            inspect_local_file(&path).await,
            LocalFileState::Hashed(
                "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".into()
            )
        );
    }
}
