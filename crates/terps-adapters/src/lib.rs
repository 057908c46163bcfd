//! Source adapters: hours feed grid parsing + menu page scraping.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use terps_core::{ScrapedItem, VenueHours};
use terps_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "terps-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] FetchError),
    #[error("no column found for today ({wanted}) in hours feed")]
    ColumnNotFound { wanted: String },
    #[error("malformed hours feed: {0}")]
    MalformedFeed(String),
    #[error("invalid selector: {0}")]
    Selector(String),
}

/// Fetch seam for the two external sources. `HttpDiningSource` is the
/// production path; the pipeline tests substitute canned responses.
#[async_trait]
pub trait DiningSource: Send + Sync {
    /// The hours feed as a row-major grid of cells (header row included).
    async fn hours_grid(&self) -> Result<Vec<Vec<String>>, AdapterError>;

    /// All menu items for one (location, date, meal period) page, in
    /// document order. Duplicate names are returned as-is; deduplication
    /// belongs to the caller. An empty page is valid, not an error.
    async fn menu_items(
        &self,
        location_num: &str,
        date_str: &str,
        meal_period: &str,
    ) -> Result<Vec<ScrapedItem>, AdapterError>;
}

/// HTTP-backed source pair with per-source timeouts.
#[derive(Debug, Clone)]
pub struct HttpDiningSource {
    hours_http: HttpFetcher,
    menu_http: HttpFetcher,
    hours_url: String,
    menu_url: String,
}

impl HttpDiningSource {
    pub fn new(
        hours_url: &str,
        menu_url: &str,
        hours_timeout: Duration,
        menu_timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            hours_http: HttpFetcher::new(hours_timeout, user_agent)?,
            menu_http: HttpFetcher::new(menu_timeout, user_agent)?,
            hours_url: hours_url.to_string(),
            menu_url: menu_url.to_string(),
        })
    }
}

#[async_trait]
impl DiningSource for HttpDiningSource {
    async fn hours_grid(&self) -> Result<Vec<Vec<String>>, AdapterError> {
        let body = self.hours_http.fetch_text(&self.hours_url, &[]).await?;
        parse_gviz_grid(&body)
    }

    async fn menu_items(
        &self,
        location_num: &str,
        date_str: &str,
        meal_period: &str,
    ) -> Result<Vec<ScrapedItem>, AdapterError> {
        let body = self
            .menu_http
            .fetch_text(
                &self.menu_url,
                &[
                    ("locationNum", location_num),
                    ("dtdate", date_str),
                    ("mealName", meal_period),
                ],
            )
            .await?;
        parse_menu_page(&body)
    }
}

/// Strips the Google Visualization callback wrapper and flattens
/// `table.rows[].c[].v` into a grid. Absent and `null` cells become empty
/// strings so downstream indexing stays uniform.
pub fn parse_gviz_grid(body: &str) -> Result<Vec<Vec<String>>, AdapterError> {
    let start = body
        .find("setResponse(")
        .map(|i| i + "setResponse(".len())
        .ok_or_else(|| AdapterError::MalformedFeed("missing gviz callback wrapper".into()))?;
    let end = body
        .rfind(");")
        .filter(|&end| end > start)
        .ok_or_else(|| AdapterError::MalformedFeed("unterminated gviz callback".into()))?;

    let data: JsonValue = serde_json::from_str(&body[start..end])
        .map_err(|e| AdapterError::MalformedFeed(format!("invalid gviz JSON: {e}")))?;
    let rows = data
        .get("table")
        .and_then(|t| t.get("rows"))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::MalformedFeed("missing table.rows".into()))?;

    let mut grid = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row
            .get("c")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::MalformedFeed("row without cell array".into()))?;
        grid.push(cells.iter().map(cell_text).collect());
    }
    Ok(grid)
}

fn cell_text(cell: &JsonValue) -> String {
    if cell.is_null() {
        return String::new();
    }
    match cell.get("v") {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Today's header label prefix: month/day, no leading zeros, no year.
pub fn month_day_prefix(date: NaiveDate) -> String {
    use chrono::Datelike;
    format!("{}/{}", date.month(), date.day())
}

/// Extracts today's per-venue hours from the grid. Row 0 is the header of
/// date labels ("2/25/2025 0:00:00"); venue blocks of exactly three rows
/// (breakfast, lunch, dinner) follow. A short tail block is ignored.
pub fn extract_today_hours(
    grid: &[Vec<String>],
    venue_slugs: &[(String, String)],
    today: NaiveDate,
) -> Result<BTreeMap<String, VenueHours>, AdapterError> {
    let header = grid
        .first()
        .ok_or_else(|| AdapterError::MalformedFeed("empty grid".into()))?;
    let wanted = month_day_prefix(today);
    let col = header
        .iter()
        .position(|label| !label.is_empty() && label.starts_with(&wanted))
        .ok_or(AdapterError::ColumnNotFound { wanted })?;

    let mut result = BTreeMap::new();
    for block in grid[1..].chunks_exact(3) {
        let venue_raw = block[0]
            .first()
            .and_then(|cell| cell.split('|').next())
            .unwrap_or("")
            .trim();
        if venue_raw.is_empty() {
            continue;
        }
        let Some((_, slug)) = venue_slugs.iter().find(|(label, _)| label == venue_raw) else {
            warn!(venue = venue_raw, "unrecognized venue label in hours feed");
            continue;
        };
        result.insert(
            slug.clone(),
            VenueHours {
                breakfast: cell_or_closed(&block[0], col),
                lunch: cell_or_closed(&block[1], col),
                dinner: cell_or_closed(&block[2], col),
            },
        );
    }
    Ok(result)
}

fn cell_or_closed(row: &[String], col: usize) -> String {
    match row.get(col) {
        Some(cell) if !cell.is_empty() => cell.clone(),
        _ => "Closed".to_string(),
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(e.to_string()))
}

/// Parses one menu page. A `<tr>` is an item row iff it links to the item
/// detail page; anything else (section headers, dividers) is skipped.
/// Allergen icons carry "Contains X" alt text.
pub fn parse_menu_page(html: &str) -> Result<Vec<ScrapedItem>, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector("tr")?;
    let item_links = selector(r#"a[href*="label.aspx"]"#)?;
    let icons = selector("img.nutri-icon")?;

    let mut items = Vec::new();
    for row in document.select(&rows) {
        let Some(link) = row.select(&item_links).next() else {
            continue;
        };
        let name = link.text().collect::<String>().trim().to_string();
        let allergens = row
            .select(&icons)
            .filter_map(|img| img.value().attr("alt"))
            .filter(|alt| !alt.is_empty())
            .map(|alt| alt.strip_prefix("Contains ").unwrap_or(alt).to_lowercase())
            .collect();
        items.push(ScrapedItem { name, allergens });
    }
    Ok(items)
}
