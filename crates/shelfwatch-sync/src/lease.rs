//! Single-writer leases, one per entity kind.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shelfwatch_core::EntityKind;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub kind: EntityKind,
    pub owner: String,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    fn grant(kind: EntityKind, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Self, LeaseError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| LeaseError::Backend(format!("lease ttl out of range: {err}")))?;
        Ok(Self {
            kind,
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + ttl,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("{kind} lease held by {owner} until {expires_at}")]
    Held {
        kind: EntityKind,
        owner: String,
        expires_at: DateTime<Utc>,
    },
    #[error("lease backend: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for LeaseError {
    fn from(err: sqlx::Error) -> Self {
        LeaseError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait PassCoordinator: Send + Sync {
    /// Take the lease for `kind`, or fail with [`LeaseError::Held`] while an
    /// unexpired one belongs to someone else.
    async fn acquire(&self, kind: EntityKind, owner: &str, ttl: Duration) -> Result<Lease, LeaseError>;

    /// Give the lease back. Returns false when it was already taken over.
    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError>;
}

#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    leases: Mutex<HashMap<EntityKind, Lease>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self, kind: EntityKind) -> Option<Lease> {
        self.leases.lock().await.get(&kind).cloned()
    }
}

#[async_trait]
impl PassCoordinator for MemoryCoordinator {
    async fn acquire(&self, kind: EntityKind, owner: &str, ttl: Duration) -> Result<Lease, LeaseError> {
        let now = Utc::now();
        let mut leases = self.leases.lock().await;
        if let Some(held) = leases.get(&kind) {
            if !held.is_expired_at(now) {
                return Err(LeaseError::Held {
                    kind,
                    owner: held.owner.clone(),
                    expires_at: held.expires_at,
                });
            }
        }
        let lease = Lease::grant(kind, owner, ttl, now)?;
        leases.insert(kind, lease.clone());
        Ok(lease)
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock().await;
        match leases.get(&lease.kind) {
            Some(held) if held.token == lease.token => {
                leases.remove(&lease.kind);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Leases stored in the `pass_leases` table, shared by every process on the database.
#[derive(Debug, Clone)]
pub struct PgCoordinator {
    pool: PgPool,
}

impl PgCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PassCoordinator for PgCoordinator {
    async fn acquire(&self, kind: EntityKind, owner: &str, ttl: Duration) -> Result<Lease, LeaseError> {
        let lease = Lease::grant(kind, owner, ttl, Utc::now())?;
        // Takes over only a missing or expired row.
        let granted = sqlx::query(
            r#"
            INSERT INTO pass_leases (kind, owner, token, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (kind) DO UPDATE
               SET owner = EXCLUDED.owner,
                   token = EXCLUDED.token,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE pass_leases.expires_at <= EXCLUDED.acquired_at
            RETURNING token
            "#,
        )
        .bind(kind.as_str())
        .bind(&lease.owner)
        .bind(lease.token)
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .fetch_optional(&self.pool)
        .await?;

        if granted.is_some() {
            return Ok(lease);
        }

        let row = sqlx::query("SELECT owner, expires_at FROM pass_leases WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Err(LeaseError::Held {
                kind,
                owner: row.try_get("owner")?,
                expires_at: row.try_get("expires_at")?,
            }),
            // Released between the two statements.
            None => Err(LeaseError::Backend(format!("{kind} lease vanished while acquiring"))),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let result = sqlx::query("DELETE FROM pass_leases WHERE kind = $1 AND token = $2")
            .bind(lease.kind.as_str())
            .bind(lease.token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
