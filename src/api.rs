//! Authority HTTP surface.
//!
//! Routes:
//! - `GET /health`
//! - `GET /export/blacklist`, `GET /export/whitelist` (`format`, `source`,
//!   `from`, `to`, `order` query parameters)
//! - `GET /export/iptables[?source=]`: the block set agents reconcile against
//! - `GET /export/iptables/rules?dialect=`
//! - `POST /import/single`, `POST /import/bulk`, `POST /import/{feed}`
//!
//! Store access is synchronous, so handlers hop onto the blocking pool.

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{BlocksyncError, ExportError, ImportError, StoreError};
use crate::exporter::{Dialect, EffectiveBlockSet, ExportFormat, ExportView, Exporter, RuleSet};
use crate::feeds::Feed;
use crate::model::{ListFilter, ListKind, ListOrder};
use crate::normalizer::BatchMeta;
use crate::service::{ImportSummary, ListService};
use crate::signal::ShutdownToken;

#[derive(Clone)]
pub struct AppState {
    pub service: ListService,
    pub exporter: Exporter,
    pub feeds: Arc<Vec<Feed>>,
    /// Table number used when rendering the ipfw dialect
    pub ipfw_table: u32,
}

impl AppState {
    pub fn new(service: ListService, feeds: Vec<Feed>, ipfw_table: u32) -> Self {
        let exporter = Exporter::new(service.store().clone());
        Self {
            service,
            exporter,
            feeds: Arc::new(feeds),
            ipfw_table,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(StoreError),
    FeedFailed(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Unavailable(e)
    }
}

impl From<ImportError> for ApiError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Validation(e) => ApiError::BadRequest(e.to_string()),
            ImportError::Store(e) => ApiError::Unavailable(e),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        match e {
            ExportError::Store(e) => ApiError::Unavailable(e),
            ExportError::Render(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(e) => {
                error!("{}", e);
                (StatusCode::SERVICE_UNAVAILABLE, e.public_message().to_string())
            }
            ApiError::FeedFailed(feed) => (StatusCode::BAD_GATEWAY, format!("Feed {} failed", feed)),
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Run store work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
    pub source: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub order: Option<String>,
    pub dialect: Option<String>,
}

fn parse_bound(value: Option<&str>, name: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| ApiError::BadRequest(format!("Invalid '{}' timestamp: {}", name, v)))
        })
        .transpose()
}

impl ExportQuery {
    pub fn filter(&self) -> Result<ListFilter, ApiError> {
        let order = match self.order.as_deref() {
            Some(order) => order.parse::<ListOrder>().map_err(ApiError::BadRequest)?,
            None => ListOrder::default(),
        };
        Ok(ListFilter {
            source: self.source.clone().filter(|s| !s.is_empty()),
            from: parse_bound(self.from.as_deref(), "from")?,
            to: parse_bound(self.to.as_deref(), "to")?,
            order,
        })
    }

    fn format(&self) -> Result<ExportFormat, ApiError> {
        match self.format.as_deref() {
            Some(format) => format.parse().map_err(ApiError::BadRequest),
            None => Ok(ExportFormat::default()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SingleImport {
    pub ip: String,
    #[serde(rename = "type", default)]
    pub list: ListKind,
    pub source: Option<String>,
    pub reason: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkImport {
    pub ips: Vec<String>,
    #[serde(rename = "type", default)]
    pub list: ListKind,
    pub source: Option<String>,
    pub reason: Option<String>,
    pub comment: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/export/blacklist", get(export_blacklist))
        .route("/export/whitelist", get(export_whitelist))
        .route("/export/iptables", get(export_block_set))
        .route("/export/iptables/rules", get(export_rules))
        .route("/import/single", post(import_single))
        .route("/import/bulk", post(import_bulk))
        .route("/import/{feed}", post(import_feed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled; in-flight requests are drained.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: ShutdownToken) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Authority API listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;
    info!("Authority API stopped");
    Ok(())
}

async fn health() -> &'static str {
    "healthy"
}

async fn export_blacklist(State(state): State<AppState>, Query(query): Query<ExportQuery>) -> Result<Response, ApiError> {
    export_view(state, ExportView::EffectiveBlacklist, query).await
}

async fn export_whitelist(State(state): State<AppState>, Query(query): Query<ExportQuery>) -> Result<Response, ApiError> {
    export_view(state, ExportView::Whitelist, query).await
}

async fn export_view(state: AppState, view: ExportView, query: ExportQuery) -> Result<Response, ApiError> {
    let filter = query.filter()?;
    match query.format()? {
        ExportFormat::Json => {
            let records = blocking(move || Ok(state.exporter.records(view, &filter)?)).await?;
            Ok(Json(records).into_response())
        }
        ExportFormat::Csv => {
            let body = blocking(move || Ok(state.exporter.csv(view, &filter)?)).await?;
            Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response())
        }
    }
}

async fn export_block_set(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<EffectiveBlockSet>, ApiError> {
    let filter = query.filter()?;
    let set = blocking(move || Ok(state.exporter.block_set(&filter)?)).await?;
    Ok(Json(set))
}

async fn export_rules(State(state): State<AppState>, Query(query): Query<ExportQuery>) -> Result<Json<RuleSet>, ApiError> {
    let filter = query.filter()?;
    let dialect = Dialect::parse(query.dialect.as_deref().unwrap_or("iptables"), state.ipfw_table)
        .map_err(ApiError::BadRequest)?;
    let rules = blocking(move || Ok(state.exporter.rules(&filter, dialect)?)).await?;
    Ok(Json(rules))
}

fn batch_meta(source: Option<String>, default_source: &str, reason: Option<String>, comment: Option<String>) -> BatchMeta {
    BatchMeta {
        source: source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| default_source.to_string()),
        reason,
        comment,
    }
}

async fn import_single(
    State(state): State<AppState>,
    Json(body): Json<SingleImport>,
) -> Result<(StatusCode, Json<ImportSummary>), ApiError> {
    let meta = batch_meta(body.source, "manual", body.reason, body.comment);
    let list = body.list;
    let ip = body.ip;
    let summary = blocking(move || Ok(state.service.import_single(list, &ip, &meta)?)).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn import_bulk(
    State(state): State<AppState>,
    Json(body): Json<BulkImport>,
) -> Result<(StatusCode, Json<ImportSummary>), ApiError> {
    let meta = batch_meta(body.source, "bulk-import", body.reason, body.comment);
    let list = body.list;
    let ips = body.ips;
    let summary = blocking(move || Ok(state.service.import_bulk(list, ips, &meta)?)).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn import_feed(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<ImportSummary>), ApiError> {
    let feed = state
        .feeds
        .iter()
        .find(|feed| feed.name == name)
        .ok_or_else(|| ApiError::NotFound(BlocksyncError::UnknownFeed(name.clone()).to_string()))?;

    match feed.import(&state.service).await {
        Ok(summary) => Ok((StatusCode::CREATED, Json(summary))),
        Err(e) => {
            warn!("On-demand import of {} failed: {:#}", name, e);
            Err(ApiError::FeedFailed(name))
        }
    }
}
