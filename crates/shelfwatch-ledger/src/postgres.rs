use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shelfwatch_core::{
    EntityKind, EntityRecord, EntityRow, Event, EventTarget, EventType, FileFields, ProductFields,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{
    check_plan_kind, CommitReceipt, EventQuery, Ledger, LedgerTx, PassPlan, RowWrite, StoreError,
};

const PRODUCT_COLUMNS: &str = "id, url, name, brand, category, image_url, price, currency, page, \
     data_hash, first_seen_at, last_seen_at, last_change_at, is_active";
const FILE_COLUMNS: &str = "id, url, filename, local_path, mime_type, hash, \
     first_seen_at, last_seen_at, last_change_at, is_active";

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "products",
        EntityKind::File => "files",
    }
}

fn columns(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => PRODUCT_COLUMNS,
        EntityKind::File => FILE_COLUMNS,
    }
}

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Migration(err.to_string()))
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self, kind: EntityKind) -> Result<Box<dyn LedgerTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Serializes passes per kind even when no lease is in play.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("shelfwatch:{kind}"))
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTx { tx, kind }))
    }

    async fn active_keys(&self, kind: EntityKind) -> Result<BTreeSet<String>, StoreError> {
        let sql = format!("SELECT url FROM {} WHERE is_active", table(kind));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("url").map_err(StoreError::from))
            .collect()
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        active: Option<bool>,
    ) -> Result<Vec<EntityRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE ($1::boolean IS NULL OR is_active = $1) \
             ORDER BY last_seen_at DESC, id DESC",
            columns(kind),
            table(kind)
        );
        let rows = sqlx::query(&sql).bind(active).fetch_all(&self.pool).await?;
        rows.iter().map(|row| entity_from_row(kind, row)).collect()
    }

    async fn get_entity(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRow>, StoreError> {
        let sql = format!("SELECT {} FROM {} WHERE id = $1", columns(kind), table(kind));
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| entity_from_row(kind, &row)).transpose()
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let kind = match (query.target.map(EventTarget::kind), query.entity_kind) {
            (Some(a), Some(b)) if a != b => return Ok(Vec::new()),
            (Some(k), _) | (None, Some(k)) => Some(k),
            (None, None) => None,
        };
        let rows = sqlx::query(
            r#"
            SELECT id, entity_type, entity_id, event_type, description, created_at
            FROM events
            WHERE ($1::text IS NULL OR entity_type = $1)
              AND ($2::bigint IS NULL OR entity_id = $2)
              AND ($3::text IS NULL OR event_type = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at < $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6
            "#,
        )
        .bind(kind.map(EntityKind::as_str))
        .bind(query.target.map(EventTarget::entity_id))
        .bind(query.event_type.map(EventType::as_str))
        .bind(query.since)
        .bind(query.until)
        .bind(query.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
    kind: EntityKind,
}

#[async_trait]
impl LedgerTx for PgTx {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn load(&mut self) -> Result<Vec<EntityRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id FOR UPDATE",
            columns(self.kind),
            table(self.kind)
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.iter().map(|row| entity_from_row(self.kind, row)).collect()
    }

    async fn apply(self: Box<Self>, plan: PassPlan) -> Result<CommitReceipt, StoreError> {
        check_plan_kind(self.kind, &plan)?;
        let PgTx { mut tx, kind } = *self;
        let pass_time = plan.pass_time;
        let mut events = Vec::new();

        for change in &plan.changes {
            let id = write_row(&mut tx, kind, &change.key, &change.write, pass_time)
                .await?
                .ok_or_else(|| {
                    StoreError::Integrity(format!(
                        "{} write for {} touched no row",
                        kind, change.key
                    ))
                })?;

            if let Some(planned) = &change.event {
                let row = sqlx::query(
                    "INSERT INTO events (entity_type, entity_id, event_type, description, created_at) \
                     VALUES ($1, $2, $3, $4, $5) RETURNING id, created_at",
                )
                .bind(kind.as_str())
                .bind(id)
                .bind(planned.event_type.as_str())
                .bind(&planned.description)
                .bind(pass_time)
                .fetch_one(&mut *tx)
                .await?;
                events.push(Event {
                    id: row.try_get("id")?,
                    target: EventTarget::new(kind, id),
                    event_type: planned.event_type,
                    description: planned.description.clone(),
                    created_at: row.try_get("created_at")?,
                });
            }
        }

        tx.commit().await?;
        debug!(%kind, rows = plan.changes.len(), events = events.len(), "pass committed");
        Ok(CommitReceipt {
            rows_written: plan.changes.len(),
            events,
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn write_row(
    tx: &mut Transaction<'static, Postgres>,
    kind: EntityKind,
    key: &str,
    write: &RowWrite,
    pass_time: DateTime<Utc>,
) -> Result<Option<i64>, StoreError> {
    let table = table(kind);
    let row = match write {
        RowWrite::Insert { record, data_hash } => match record {
            EntityRecord::Product(p) => {
                sqlx::query(
                    "INSERT INTO products (url, name, brand, category, image_url, price, currency, page, \
                     data_hash, first_seen_at, last_seen_at, last_change_at, is_active) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, NULL, TRUE) \
                     ON CONFLICT (url) DO NOTHING RETURNING id",
                )
                .bind(&p.url)
                .bind(&p.name)
                .bind(&p.brand)
                .bind(&p.category)
                .bind(&p.image_url)
                .bind(p.price)
                .bind(&p.currency)
                .bind(p.page)
                .bind(data_hash)
                .bind(pass_time)
                .fetch_optional(&mut **tx)
                .await?
            }
            EntityRecord::File(f) => {
                sqlx::query(
                    "INSERT INTO files (url, filename, local_path, mime_type, hash, \
                     first_seen_at, last_seen_at, last_change_at, is_active) \
                     VALUES ($1, $2, $3, $4, $5, $6, $6, NULL, TRUE) \
                     ON CONFLICT (url) DO NOTHING RETURNING id",
                )
                .bind(&f.url)
                .bind(&f.filename)
                .bind(&f.local_path)
                .bind(&f.mime_type)
                .bind(&f.hash)
                .bind(pass_time)
                .fetch_optional(&mut **tx)
                .await?
            }
        },
        RowWrite::Touch => {
            let sql = format!(
                "UPDATE {table} SET last_seen_at = GREATEST(last_seen_at, $2) \
                 WHERE url = $1 RETURNING id"
            );
            sqlx::query(&sql)
                .bind(key)
                .bind(pass_time)
                .fetch_optional(&mut **tx)
                .await?
        }
        RowWrite::Reactivate => {
            let sql = format!(
                "UPDATE {table} SET is_active = TRUE, last_seen_at = GREATEST(last_seen_at, $2) \
                 WHERE url = $1 RETURNING id"
            );
            sqlx::query(&sql)
                .bind(key)
                .bind(pass_time)
                .fetch_optional(&mut **tx)
                .await?
        }
        RowWrite::Rehash { data_hash } => match kind {
            EntityKind::Product => {
                sqlx::query(
                    "UPDATE products SET data_hash = $2, is_active = TRUE, \
                     last_seen_at = GREATEST(last_seen_at, $3) WHERE url = $1 RETURNING id",
                )
                .bind(key)
                .bind(data_hash)
                .bind(pass_time)
                .fetch_optional(&mut **tx)
                .await?
            }
            EntityKind::File => {
                return Err(StoreError::Integrity(format!(
                    "file {key} is fingerprinted by its content hash and cannot be rehashed"
                )))
            }
        },
        RowWrite::Update { record, data_hash } => match record {
            EntityRecord::Product(p) => {
                sqlx::query(
                    "UPDATE products SET name = $2, brand = $3, category = $4, image_url = $5, \
                     price = $6, currency = $7, page = $8, data_hash = $9, \
                     last_seen_at = GREATEST(last_seen_at, $10), last_change_at = $10, is_active = TRUE \
                     WHERE url = $1 RETURNING id",
                )
                .bind(key)
                .bind(&p.name)
                .bind(&p.brand)
                .bind(&p.category)
                .bind(&p.image_url)
                .bind(p.price)
                .bind(&p.currency)
                .bind(p.page)
                .bind(data_hash)
                .bind(pass_time)
                .fetch_optional(&mut **tx)
                .await?
            }
            EntityRecord::File(f) => {
                sqlx::query(
                    "UPDATE files SET filename = $2, local_path = $3, mime_type = $4, hash = $5, \
                     last_seen_at = GREATEST(last_seen_at, $6), last_change_at = $6, is_active = TRUE \
                     WHERE url = $1 RETURNING id",
                )
                .bind(key)
                .bind(&f.filename)
                .bind(&f.local_path)
                .bind(&f.mime_type)
                .bind(&f.hash)
                .bind(pass_time)
                .fetch_optional(&mut **tx)
                .await?
            }
        },
        RowWrite::Deactivate => {
            let sql = format!("UPDATE {table} SET is_active = FALSE WHERE url = $1 RETURNING id");
            sqlx::query(&sql).bind(key).fetch_optional(&mut **tx).await?
        }
    };
    row.map(|row| row.try_get::<i64, _>("id").map_err(StoreError::from))
        .transpose()
}

fn entity_from_row(kind: EntityKind, row: &PgRow) -> Result<EntityRow, StoreError> {
    let url: String = row.try_get("url")?;
    let (record, data_hash) = match kind {
        EntityKind::Product => (
            EntityRecord::Product(ProductFields {
                url,
                name: row.try_get("name")?,
                brand: row.try_get("brand")?,
                category: row.try_get("category")?,
                image_url: row.try_get("image_url")?,
                price: row.try_get("price")?,
                currency: row.try_get("currency")?,
                page: row.try_get("page")?,
            }),
            row.try_get("data_hash")?,
        ),
        EntityKind::File => {
            let hash: String = row.try_get("hash")?;
            (
                EntityRecord::File(FileFields {
                    url,
                    filename: row.try_get("filename")?,
                    local_path: row.try_get("local_path")?,
                    mime_type: row.try_get("mime_type")?,
                    hash: hash.clone(),
                }),
                hash,
            )
        }
    };
    Ok(EntityRow {
        id: row.try_get("id")?,
        record,
        data_hash,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        last_change_at: row.try_get("last_change_at")?,
        is_active: row.try_get("is_active")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let entity_type: String = row.try_get("entity_type")?;
    let event_type: String = row.try_get("event_type")?;
    let kind: EntityKind = entity_type
        .parse()
        .map_err(|err: shelfwatch_core::ParseTagError| StoreError::Integrity(err.to_string()))?;
    Ok(Event {
        id: row.try_get("id")?,
        target: EventTarget::new(kind, row.try_get("entity_id")?),
        event_type: event_type
            .parse()
            .map_err(|err: shelfwatch_core::ParseTagError| StoreError::Integrity(err.to_string()))?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}
