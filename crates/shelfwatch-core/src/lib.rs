//! Core domain model, canonicalization and fingerprinting for shelfwatch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "shelfwatch-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    File,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Product, EntityKind::File];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::File => "file",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} {value:?}")]
pub struct ParseTagError {
    pub what: &'static str,
    pub value: String,
}

impl FromStr for EntityKind {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "product" | "products" => Ok(EntityKind::Product),
            "file" | "files" => Ok(EntityKind::File),
            other => Err(ParseTagError {
                what: "entity kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Reactivated,
    Deactivated,
    FileChanged,
    /// Emitted by operator tooling outside the reconciliation engine.
    Deleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Reactivated => "reactivated",
            EventType::Deactivated => "deactivated",
            EventType::FileChanged => "file_changed",
            EventType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "created" => Ok(EventType::Created),
            "updated" => Ok(EventType::Updated),
            "reactivated" => Ok(EventType::Reactivated),
            "deactivated" => Ok(EventType::Deactivated),
            "file_changed" => Ok(EventType::FileChanged),
            "deleted" => Ok(EventType::Deleted),
            other => Err(ParseTagError {
                what: "event type",
                value: other.to_string(),
            }),
        }
    }
}

/// Weak reference from an event to the entity it describes.
///
/// Persisted as an `(entity_type, entity_id)` pair; the id is only meaningful
/// together with its tag since products and files live in separate tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "entity_id", rename_all = "lowercase")]
pub enum EventTarget {
    Product(i64),
    File(i64),
}

impl EventTarget {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        match kind {
            EntityKind::Product => EventTarget::Product(id),
            EntityKind::File => EventTarget::File(id),
        }
    }

    pub fn kind(self) -> EntityKind {
        match self {
            EventTarget::Product(_) => EntityKind::Product,
            EventTarget::File(_) => EntityKind::File,
        }
    }

    pub fn entity_id(self) -> i64 {
        match self {
            EventTarget::Product(id) | EventTarget::File(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    #[serde(flatten)]
    pub target: EventTarget,
    pub event_type: EventType,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Product record as handed over by the scraping collaborator. Nothing is trusted yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProduct {
    pub url: Option<String>,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub page: Option<i32>,
    /// Decode error for a record the source could not parse; it is rejected
    /// at canonicalization while keeping its place in the batch.
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl RawProduct {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            malformed: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Downloaded asset record as handed over by the scraping collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFile {
    pub url: Option<String>,
    pub filename: Option<String>,
    pub local_path: Option<String>,
    pub mime_type: Option<String>,
    pub hash: Option<String>,
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl RawFile {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            malformed: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// A complete, bounded batch for one entity kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationBatch {
    Products(Vec<RawProduct>),
    Files(Vec<RawFile>),
}

impl ObservationBatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            ObservationBatch::Products(_) => EntityKind::Product,
            ObservationBatch::Files(_) => EntityKind::File,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ObservationBatch::Products(items) => items.len(),
            ObservationBatch::Files(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Product => ObservationBatch::Products(Vec::new()),
            EntityKind::File => ObservationBatch::Files(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductFields {
    pub url: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub page: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFields {
    pub url: String,
    pub filename: String,
    pub local_path: String,
    pub mime_type: Option<String>,
    /// Lower-case sha256 hex of the file contents.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "lowercase")]
pub enum EntityRecord {
    Product(ProductFields),
    File(FileFields),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Product(_) => EntityKind::Product,
            EntityRecord::File(_) => EntityKind::File,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            EntityRecord::Product(p) => &p.url,
            EntityRecord::File(f) => &f.url,
        }
    }

    /// Human-facing name used in event descriptions.
    pub fn label(&self) -> &str {
        match self {
            EntityRecord::Product(p) => &p.name,
            EntityRecord::File(f) => &f.filename,
        }
    }
}

/// Canonicalized observation ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub record: EntityRecord,
    pub fingerprint: String,
}

impl Observation {
    pub fn key(&self) -> &str {
        self.record.url()
    }
}

/// Current persisted state of one product or file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: i64,
    #[serde(flatten)]
    pub record: EntityRecord,
    pub data_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl EntityRow {
    pub fn key(&self) -> &str {
        self.record.url()
    }

    pub fn kind(&self) -> EntityKind {
        self.record.kind()
    }

    pub fn target(&self) -> EventTarget {
        EventTarget::new(self.kind(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} observation could not be decoded: {reason}")]
    Malformed { kind: EntityKind, reason: String },
    #[error("{kind} observation is missing mandatory field `{field}`")]
    MissingField {
        kind: EntityKind,
        field: &'static str,
    },
    #[error("{kind} observation has invalid url {url:?}: {reason}")]
    InvalidUrl {
        kind: EntityKind,
        url: String,
        reason: String,
    },
    #[error("product {url} has a non-finite price")]
    InvalidPrice { url: String },
    #[error("file {url} has a non-hexadecimal content hash")]
    InvalidHash { url: String },
}

/// One tracked field that differs between two versions of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub old: String,
    pub new: String,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} → {}", self.field, self.old, self.new)
    }
}

pub fn describe_changes(changes: &[FieldChange]) -> String {
    changes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerprintConfig {
    /// Pagination position is scrape metadata; excluded unless explicitly enabled.
    pub include_page: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Canonicalizer {
    config: FingerprintConfig,
}

impl Canonicalizer {
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> FingerprintConfig {
        self.config
    }

    pub fn canonicalize_product(&self, raw: &RawProduct) -> Result<Observation, ValidationError> {
        let kind = EntityKind::Product;
        if let Some(reason) = &raw.malformed {
            return Err(ValidationError::Malformed {
                kind,
                reason: reason.clone(),
            });
        }
        let url = normalize_url(kind, raw.url.as_deref())?;
        let name = normalize_text(raw.name.as_deref())
            .ok_or(ValidationError::MissingField { kind, field: "name" })?;
        let price = match raw.price {
            Some(p) if !p.is_finite() => return Err(ValidationError::InvalidPrice { url }),
            // -0.0 and 0.0 must hash the same
            Some(p) if p == 0.0 => Some(0.0),
            other => other,
        };

        let record = EntityRecord::Product(ProductFields {
            url,
            name,
            brand: normalize_text(raw.brand.as_deref()),
            category: normalize_text(raw.category.as_deref()),
            image_url: normalize_text(raw.image_url.as_deref()),
            price,
            currency: normalize_text(raw.currency.as_deref()).map(|c| c.to_uppercase()),
            page: raw.page,
        });
        let fingerprint = self.fingerprint(&record);
        Ok(Observation { record, fingerprint })
    }

    pub fn canonicalize_file(&self, raw: &RawFile) -> Result<Observation, ValidationError> {
        let kind = EntityKind::File;
        if let Some(reason) = &raw.malformed {
            return Err(ValidationError::Malformed {
                kind,
                reason: reason.clone(),
            });
        }
        let url = normalize_url(kind, raw.url.as_deref())?;
        let filename = normalize_text(raw.filename.as_deref())
            .ok_or(ValidationError::MissingField { kind, field: "filename" })?;
        let local_path = raw
            .local_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ToString::to_string)
            .ok_or(ValidationError::MissingField { kind, field: "local_path" })?;
        let hash = raw
            .hash
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_ascii_lowercase)
            .ok_or(ValidationError::MissingField { kind, field: "hash" })?;
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ValidationError::InvalidHash { url });
        }

        let record = EntityRecord::File(FileFields {
            url,
            filename,
            local_path,
            mime_type: normalize_text(raw.mime_type.as_deref()).map(|m| m.to_ascii_lowercase()),
            hash,
        });
        let fingerprint = self.fingerprint(&record);
        Ok(Observation { record, fingerprint })
    }

    /// Digest over the business fields of a canonical record.
    ///
    /// Files are content-addressed: their fingerprint is the content hash itself.
    pub fn fingerprint(&self, record: &EntityRecord) -> String {
        match record {
            EntityRecord::Product(p) => {
                let mut parts: Vec<(&str, Option<String>)> = vec![
                    ("name", Some(p.name.clone())),
                    ("brand", p.brand.clone()),
                    ("category", p.category.clone()),
                    ("image_url", p.image_url.clone()),
                    ("price", p.price.map(format_price)),
                    ("currency", p.currency.clone()),
                ];
                if self.config.include_page {
                    parts.push(("page", p.page.map(|page| page.to_string())));
                }
                digest_fields(&parts)
            }
            EntityRecord::File(f) => f.hash.clone(),
        }
    }

    /// Fields that differ between two canonical records of the same kind.
    pub fn diff(&self, old: &EntityRecord, new: &EntityRecord) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        match (old, new) {
            (EntityRecord::Product(a), EntityRecord::Product(b)) => {
                push_change(&mut changes, "name", Some(a.name.clone()), Some(b.name.clone()));
                push_change(&mut changes, "brand", a.brand.clone(), b.brand.clone());
                push_change(&mut changes, "category", a.category.clone(), b.category.clone());
                push_change(&mut changes, "image_url", a.image_url.clone(), b.image_url.clone());
                push_change(
                    &mut changes,
                    "price",
                    a.price.map(format_price),
                    b.price.map(format_price),
                );
                push_change(&mut changes, "currency", a.currency.clone(), b.currency.clone());
                push_change(
                    &mut changes,
                    "page",
                    a.page.map(|p| p.to_string()),
                    b.page.map(|p| p.to_string()),
                );
            }
            (EntityRecord::File(a), EntityRecord::File(b)) => {
                push_change(&mut changes, "filename", Some(a.filename.clone()), Some(b.filename.clone()));
                push_change(
                    &mut changes,
                    "local_path",
                    Some(a.local_path.clone()),
                    Some(b.local_path.clone()),
                );
                push_change(&mut changes, "mime_type", a.mime_type.clone(), b.mime_type.clone());
                push_change(
                    &mut changes,
                    "hash",
                    Some(short_hash(&a.hash)),
                    Some(short_hash(&b.hash)),
                );
            }
            _ => {}
        }
        changes
    }
}

pub fn format_price(price: f64) -> String {
    format!("{price}")
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}

fn push_change(
    changes: &mut Vec<FieldChange>,
    field: &'static str,
    old: Option<String>,
    new: Option<String>,
) {
    if old != new {
        changes.push(FieldChange {
            field,
            old: old.unwrap_or_else(|| "(none)".to_string()),
            new: new.unwrap_or_else(|| "(none)".to_string()),
        });
    }
}

fn digest_fields(parts: &[(&str, Option<String>)]) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in parts {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        match value {
            Some(v) => {
                hasher.update([0x01]);
                hasher.update(v.as_bytes());
            }
            None => hasher.update([0x00]),
        }
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// Trim, collapse inner whitespace, and map empty to absent.
pub fn normalize_text(value: Option<&str>) -> Option<String> {
    let collapsed = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Natural-key normalization: absolute http(s) URL with a host, fragment dropped.
pub fn normalize_url(kind: EntityKind, value: Option<&str>) -> Result<String, ValidationError> {
    let raw = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField { kind, field: "url" })?;
    let invalid = |reason: String| ValidationError::InvalidUrl {
        kind,
        url: raw.to_string(),
        reason,
    };

    let mut parsed = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    parsed.set_fragment(None);
    Ok(parsed.into())
}
