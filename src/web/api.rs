use crate::record::LogLevel;
use crate::service::{LogService, NewLog, ServiceError};
use crate::storage::{LogStatistics, OrderBy, SearchQuery, SearchResults};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LogService>,
}

/// Raw query string for `GET /api/logs`. Every value is taken as text so a
/// malformed one falls back to its default instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    pub unique_id: Option<String>,
    pub search_text: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub level_id: Option<String>,
    pub source: Option<String>,
    pub correlation_id: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
    pub order_by: Option<String>,
    pub descending: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// RFC 3339, `YYYY-MM-DDTHH:MM:SS` (UTC) or a bare date (midnight UTC).
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl From<LogsQuery> for SearchQuery {
    fn from(q: LogsQuery) -> Self {
        let defaults = SearchQuery::default();
        SearchQuery {
            unique_id: q.unique_id.as_deref().and_then(|id| Uuid::parse_str(id.trim()).ok()),
            search_text: non_blank(q.search_text),
            start: q.start_date.as_deref().and_then(parse_date),
            end: q.end_date.as_deref().and_then(parse_date),
            level: q
                .level_id
                .as_deref()
                .and_then(|id| id.trim().parse::<i64>().ok())
                .and_then(LogLevel::from_id),
            source: non_blank(q.source),
            correlation_id: non_blank(q.correlation_id),
            page: q
                .page
                .as_deref()
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.page),
            page_size: q
                .page_size
                .as_deref()
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.page_size),
            order_by: q.order_by.as_deref().map(OrderBy::parse).unwrap_or_default(),
            descending: q
                .descending
                .as_deref()
                .and_then(|d| d.trim().to_lowercase().parse().ok())
                .unwrap_or(defaults.descending),
        }
    }
}

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/logs
pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<SearchResults>, ApiError> {
    let query = SearchQuery::from(query);
    Ok(Json(state.service.search(&query).await?))
}

/// GET /api/logs/stats
pub async fn log_stats(State(state): State<AppState>) -> Result<Json<LogStatistics>, ApiError> {
    Ok(Json(state.service.statistics().await?))
}

/// GET /api/logs/:id
pub async fn get_log(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let unique_id = Uuid::parse_str(&id).map_err(|_| ApiError::BadRequest(format!("invalid log id: {}", id)))?;
    match state.service.get(unique_id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(ApiError::NotFound(format!("log {} not found", unique_id))),
    }
}

/// POST /api/logs
pub async fn add_log(State(state): State<AppState>, Json(new): Json<NewLog>) -> Result<Response, ApiError> {
    let record = state.service.add_log(new).await?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalError(String),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let message = e.to_string();
        match e {
            ServiceError::Storage(_) => {
                tracing::error!(error = %message, "Storage request failed");
                ApiError::InternalError(message)
            }
            ServiceError::EmptyMessage | ServiceError::Duplicate(_) => ApiError::BadRequest(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Build the query the way the extractor does for plain string values.
    fn query(pairs: &[(&str, &str)]) -> SearchQuery {
        let map: serde_json::Map<String, serde_json::Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        let parsed: LogsQuery = serde_json::from_value(serde_json::Value::Object(map)).unwrap();
        SearchQuery::from(parsed)
    }

    #[test]
    fn test_empty_query_uses_defaults() {
        assert_eq!(query(&[]), SearchQuery::default());
    }

    #[test]
    fn test_camel_case_parameters() {
        let q = query(&[
            ("searchText", "timeout"),
            ("levelId", "4"),
            ("source", "api"),
            ("page", "3"),
            ("pageSize", "25"),
            ("orderBy", "level"),
            ("descending", "false"),
            ("startDate", "2024-01-02"),
            ("endDate", "2024-01-03T10:00:00Z"),
        ]);
        assert_eq!(q.search_text.as_deref(), Some("timeout"));
        assert_eq!(q.level, Some(LogLevel::Error));
        assert_eq!(q.source.as_deref(), Some("api"));
        assert_eq!(q.page, 3);
        assert_eq!(q.page_size, 25);
        assert_eq!(q.order_by, OrderBy::Level);
        assert!(!q.descending);
        assert_eq!(q.start, Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()));
        assert_eq!(q.end, Some(Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap()));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let q = query(&[
            ("startDate", "yesterday"),
            ("levelId", "9"),
            ("page", "abc"),
            ("descending", "maybe"),
            ("uniqueId", "nope"),
        ]);
        assert!(q.start.is_none());
        assert!(q.level.is_none());
        assert_eq!(q.page, 1);
        assert!(q.descending);
        assert!(q.unique_id.is_none());
    }
}
