//! Read-only JSON API over the entity store and event log.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelfwatch_core::{EntityKind, EntityRow, Event, EventTarget, EventType};
use shelfwatch_ledger::{calendar, CalendarDay, EventQuery, Ledger, PgLedger};
use shelfwatch_sync::SyncConfig;
use tokio::net::TcpListener;
use tracing::info;

mod error;

pub use error::ApiError;

pub const CRATE_NAME: &str = "shelfwatch-web";

const DEFAULT_EVENT_LIMIT: usize = 200;
const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
}

impl AppState {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/products", get(products_handler))
        .route("/api/products/{id}", get(product_detail_handler))
        .route("/api/files", get(files_handler))
        .route("/api/files/{id}", get(file_detail_handler))
        .route("/api/events", get(events_handler))
        .route("/api/events/calendar", get(calendar_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let ledger = PgLedger::connect(&config.database_url).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving read api");
    axum::serve(listener, app(AppState::new(Arc::new(ledger)))).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> Json<Health> {
    Json(Health {
        status: "ok",
        service: CRATE_NAME,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub active: Option<bool>,
}

// Extractor rejections are taken as values so they render as JSON errors too.
type QueryResult<T> = Result<Query<T>, QueryRejection>;
type IdResult = Result<Path<i64>, PathRejection>;

async fn products_handler(
    State(state): State<Arc<AppState>>,
    query: QueryResult<ListQuery>,
) -> Result<Json<Vec<EntityRow>>, ApiError> {
    list(&state, EntityKind::Product, query?.0).await
}

async fn files_handler(
    State(state): State<Arc<AppState>>,
    query: QueryResult<ListQuery>,
) -> Result<Json<Vec<EntityRow>>, ApiError> {
    list(&state, EntityKind::File, query?.0).await
}

async fn list(
    state: &AppState,
    kind: EntityKind,
    query: ListQuery,
) -> Result<Json<Vec<EntityRow>>, ApiError> {
    Ok(Json(state.ledger.list_entities(kind, query.active).await?))
}

/// An entity with its full history, newest event first.
#[derive(Debug, Serialize)]
pub struct EntityDetail {
    #[serde(flatten)]
    pub row: EntityRow,
    pub events: Vec<Event>,
}

async fn product_detail_handler(
    State(state): State<Arc<AppState>>,
    id: IdResult,
) -> Result<Json<EntityDetail>, ApiError> {
    detail(&state, EntityKind::Product, id?.0).await
}

async fn file_detail_handler(
    State(state): State<Arc<AppState>>,
    id: IdResult,
) -> Result<Json<EntityDetail>, ApiError> {
    detail(&state, EntityKind::File, id?.0).await
}

async fn detail(state: &AppState, kind: EntityKind, id: i64) -> Result<Json<EntityDetail>, ApiError> {
    let row = state
        .ledger
        .get_entity(kind, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{kind} {id}")))?;
    let events = state
        .ledger
        .query_events(&EventQuery::for_target(row.target()))
        .await?;
    Ok(Json(EntityDetail { row, events }))
}

/// Tags stay strings here so an unknown tag is reported by name.
#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventsParams {
    fn into_query(self) -> Result<EventQuery, ApiError> {
        let entity_kind = self
            .entity_type
            .as_deref()
            .map(parse_tag::<EntityKind>)
            .transpose()?;
        let target = match (entity_kind, self.entity_id) {
            (Some(kind), Some(id)) => Some(EventTarget::new(kind, id)),
            (None, Some(_)) => {
                return Err(ApiError::Validation(
                    "entity_id requires entity_type".to_string(),
                ))
            }
            _ => None,
        };
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since >= until {
                return Err(ApiError::Validation("since must be before until".to_string()));
            }
        }
        Ok(EventQuery {
            target,
            entity_kind,
            event_type: self
                .event_type
                .as_deref()
                .map(parse_tag::<EventType>)
                .transpose()?,
            since: self.since,
            until: self.until,
            limit: Some(self.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT)),
        })
    }
}

fn parse_tag<T>(value: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err: T::Err| ApiError::Validation(err.to_string()))
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    params: QueryResult<EventsParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let query = params?.0.into_query()?;
    Ok(Json(state.ledger.query_events(&query).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CalendarParams {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CalendarResponse {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub total: usize,
    pub days: Vec<CalendarDay>,
}

async fn calendar_handler(
    State(state): State<Arc<AppState>>,
    params: QueryResult<CalendarParams>,
) -> Result<Json<CalendarResponse>, ApiError> {
    let Query(params) = params?;
    let query = EventQuery {
        since: params.since,
        until: params.until,
        ..EventQuery::default()
    };
    let events = state.ledger.query_events(&query).await?;
    let days = calendar(&events);
    Ok(Json(CalendarResponse {
        since: params.since,
        until: params.until,
        total: events.len(),
        days,
    }))
}
