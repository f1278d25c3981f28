//! Search request model, parameterized SQL assembly, paging and snippets.

use crate::record::{LogLevel, LogRecord};
use chrono::{DateTime, Duration, Utc};
use duckdb::types::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 1000;
pub const DEFAULT_WINDOW_DAYS: i64 = 7;
pub const SNIPPET_LEN: usize = 300;
pub const SNIPPET_LEAD: usize = 100;
const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    #[default]
    Timestamp,
    Level,
    Source,
}

impl OrderBy {
    /// Unrecognized keys fall back to `Timestamp`.
    pub fn parse(key: &str) -> Self {
        match key.trim().to_lowercase().as_str() {
            "level" | "levelid" => OrderBy::Level,
            "source" => OrderBy::Source,
            _ => OrderBy::Timestamp,
        }
    }

    fn column(self) -> &'static str {
        match self {
            OrderBy::Timestamp => "l.timestamp",
            OrderBy::Level => "l.level",
            OrderBy::Source => "l.source",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// Bypasses every other field and returns that record untruncated
    pub unique_id: Option<Uuid>,
    pub search_text: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
    /// Applied only when it parses as a UUID
    pub correlation_id: Option<String>,
    pub page: i64,
    pub page_size: i64,
    pub order_by: OrderBy,
    pub descending: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            unique_id: None,
            search_text: None,
            start: None,
            end: None,
            level: None,
            source: None,
            correlation_id: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            order_by: OrderBy::Timestamp,
            descending: true,
        }
    }
}

pub fn clamp_page(page: i64) -> i64 {
    page.max(1)
}

pub fn clamp_page_size(page_size: i64) -> i64 {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub page: i64,
    pub page_size: i64,
    pub total_count: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl PaginationInfo {
    pub fn new(page: i64, page_size: i64, total_count: u64) -> Self {
        let size = page_size.max(1) as u64;
        let total_pages = total_count.div_ceil(size);
        Self {
            page,
            page_size,
            total_count,
            total_pages,
            has_next: (page as u64) < total_pages,
            has_previous: page > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub records: Vec<LogRecord>,
    pub pagination: PaginationInfo,
}

/// Lowercase, split on non-alphanumeric, distinct in first-seen order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&token) {
            terms.push(token);
        }
    }
    terms
}

/// A search query after defaults and clamps are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    pub terms: Vec<String>,
    pub phrase: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub page: i64,
    pub page_size: i64,
}

impl ResolvedQuery {
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

pub fn resolve(query: &SearchQuery, now: DateTime<Utc>) -> ResolvedQuery {
    let text = query
        .search_text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let terms = text.map(tokenize).unwrap_or_default();
    let phrase = if terms.len() > 1 {
        text.map(str::to_lowercase)
    } else {
        None
    };

    ResolvedQuery {
        terms,
        phrase,
        start: query.start.unwrap_or(now - Duration::days(DEFAULT_WINDOW_DAYS)),
        end: query.end.unwrap_or(now),
        page: clamp_page(query.page),
        page_size: clamp_page_size(query.page_size),
    }
}

/// Parameterized statements for one search. `select_params` extends
/// `params` with the limit and offset.
#[derive(Debug, Clone)]
pub struct SqlQuery {
    pub count_sql: String,
    pub select_sql: String,
    pub params: Vec<Value>,
    pub select_params: Vec<Value>,
}

pub const RECORD_COLUMNS: &str =
    "l.unique_id, l.correlation_id, l.message, l.source, l.level, l.timestamp, l.offset_minutes";

pub fn build_sql(query: &SearchQuery, resolved: &ResolvedQuery) -> SqlQuery {
    let mut params: Vec<Value> = Vec::new();

    let cte = match resolved.terms.as_slice() {
        [] => String::new(),
        [single] => {
            params.push(Value::Text(single.clone()));
            "WITH matched AS (SELECT DISTINCT log_id FROM logs_terms WHERE term LIKE ? || '%') ".to_string()
        }
        many => {
            let parts: Vec<&str> = many
                .iter()
                .map(|term| {
                    params.push(Value::Text(term.clone()));
                    "SELECT log_id FROM logs_terms WHERE term = ?"
                })
                .collect();
            format!("WITH matched AS ({}) ", parts.join(" INTERSECT "))
        }
    };

    let mut clauses = vec!["l.timestamp >= ?", "l.timestamp <= ?"];
    params.push(Value::BigInt(resolved.start.timestamp()));
    params.push(Value::BigInt(resolved.end.timestamp()));

    if let Some(phrase) = &resolved.phrase {
        clauses.push("strpos(lower(l.message), ?) > 0");
        params.push(Value::Text(phrase.clone()));
    }

    if let Some(level) = query.level {
        clauses.push("l.level = ?");
        params.push(Value::Int(level.id() as i32));
    }

    if let Some(source) = query.source.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push("strpos(lower(l.source), lower(?)) > 0");
        params.push(Value::Text(source.to_string()));
    }

    if let Some(correlation_id) = crate::record::parse_correlation_id(query.correlation_id.as_deref()) {
        clauses.push("l.correlation_id = ?");
        params.push(Value::Text(correlation_id.to_string()));
    }

    let join = if resolved.terms.is_empty() {
        ""
    } else {
        " JOIN matched m ON m.log_id = l.id"
    };
    let from_where = format!("FROM logs l{} WHERE {}", join, clauses.join(" AND "));

    let direction = if query.descending { "DESC" } else { "ASC" };
    let order = match query.order_by {
        OrderBy::Timestamp => format!("l.timestamp {}, l.id {}", direction, direction),
        other => format!("{} {}, l.timestamp DESC, l.id DESC", other.column(), direction),
    };

    let count_sql = format!("{}SELECT COUNT(*) {}", cte, from_where);
    let select_sql = format!(
        "{}SELECT {} {} ORDER BY {} LIMIT ? OFFSET ?",
        cte, RECORD_COLUMNS, from_where, order
    );

    let mut select_params = params.clone();
    select_params.push(Value::BigInt(resolved.page_size));
    select_params.push(Value::BigInt(resolved.offset()));

    SqlQuery {
        count_sql,
        select_sql,
        params,
        select_params,
    }
}

/// Bounded excerpt of `message`. With a term, the window starts up to
/// `SNIPPET_LEAD` characters before its first case-insensitive occurrence,
/// falling back to the first word of the term, then to the start.
pub fn snippet(message: &str, term: Option<&str>) -> String {
    let chars: Vec<char> = message.chars().collect();
    if chars.len() <= SNIPPET_LEN {
        return message.to_string();
    }

    let start = term
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .and_then(|t| {
            find_chars(&chars, t).or_else(|| tokenize(t).first().and_then(|first| find_chars(&chars, first)))
        })
        .map(|pos| pos.saturating_sub(SNIPPET_LEAD))
        .unwrap_or(0);

    let end = (start + SNIPPET_LEN).min(chars.len());
    let mut out = String::with_capacity(SNIPPET_LEN + 2 * ELLIPSIS.len());
    if start > 0 {
        out.push_str(ELLIPSIS);
    }
    out.extend(&chars[start..end]);
    if end < chars.len() {
        out.push_str(ELLIPSIS);
    }
    out
}

fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// Char index of the first case-insensitive occurrence of `needle`.
fn find_chars(haystack: &[char], needle: &str) -> Option<usize> {
    let needle: Vec<char> = needle.chars().map(fold).collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.iter().zip(&needle).all(|(a, b)| fold(*a) == *b))
}
