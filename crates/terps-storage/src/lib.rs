//! HTTP fetch utility + PostgREST store client for the dining sync.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use terps_core::{FoodItem, HoursRecord, Location, MenuEntry};

pub const CRATE_NAME: &str = "terps-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin text-fetch wrapper over reqwest with a fixed per-source timeout.
/// One attempt per call; a timeout surfaces like any other transport
/// failure and the next scheduled run picks the work up again.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        debug!(url, "fetching source");
        let mut request = self.client.get(url);
        if !params.is_empty() {
            request = request.query(params);
        }
        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(response.text().await?)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned status {status} for {table}")]
    HttpStatus { status: u16, table: String },
}

const STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// PostgREST client over the store's REST surface. Every method issues
/// exactly one remote call; batching into chunks happens above this layer.
#[derive(Debug, Clone)]
pub struct StoreClient {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl StoreClient {
    /// `base_url` is the project root (e.g. `https://xxxx.supabase.co`);
    /// `service_key` is the service-role key and must stay out of logs.
    pub fn new(base_url: &str, service_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(STORE_TIMEOUT)
            .build()
            .context("building store client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    fn check(status: StatusCode, table: &str) -> Result<(), StoreError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::HttpStatus {
                status: status.as_u16(),
                table: table.to_string(),
            })
        }
    }

    /// GET the selected columns, optionally filtered with PostgREST
    /// operators (`("date", "lt.2025-01-01")`).
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        columns: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let mut request = self
            .authed(self.client.get(self.table_url(table)))
            .query(&[("select", columns)]);
        for (column, op) in filters {
            request = request.query(&[(column, op.as_str())]);
        }
        let response = request.send().await?;
        Self::check(response.status(), table)?;
        Ok(response.json().await?)
    }

    /// Idempotent merge on `on_conflict`: insert if absent, overwrite
    /// non-key columns if present. With `ignore_duplicates` the existing
    /// row wins instead and the conflicting insert is a no-op.
    pub async fn upsert<T: Serialize>(
        &self,
        table: &str,
        rows: &[T],
        on_conflict: &str,
        ignore_duplicates: bool,
    ) -> Result<(), StoreError> {
        let resolution = if ignore_duplicates {
            "resolution=ignore-duplicates"
        } else {
            "resolution=merge-duplicates"
        };
        let response = self
            .authed(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", format!("{resolution},return=minimal"))
            .json(&rows)
            .send()
            .await?;
        Self::check(response.status(), table)
    }

    /// DELETE every row matching the filters.
    pub async fn delete(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<(), StoreError> {
        let mut request = self.authed(self.client.delete(self.table_url(table)));
        for (column, op) in filters {
            request = request.query(&[(column, op.as_str())]);
        }
        let response = request.send().await?;
        Self::check(response.status(), table)
    }
}

/// Quote values for a PostgREST `in.(...)` filter. Double quotes guard
/// names containing commas; embedded quotes and backslashes are escaped.
fn postgrest_in_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Food id row returned by the post-upsert re-select.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FoodRef {
    pub id: Uuid,
    pub name: String,
}

/// Domain-level store surface the sync pipeline is written against. The
/// PostgREST client is the production implementation; tests substitute an
/// in-memory one. Each method is one remote call.
#[async_trait]
pub trait DiningStore: Send + Sync {
    async fn load_locations(&self) -> Result<Vec<Location>, StoreError>;

    async fn upsert_hours(&self, rows: &[HoursRecord]) -> Result<(), StoreError>;

    async fn upsert_foods(&self, rows: &[FoodItem]) -> Result<(), StoreError>;

    async fn select_food_ids(&self, names: &[String]) -> Result<Vec<FoodRef>, StoreError>;

    /// Insert-once semantics: rows already present under the conflict key
    /// are left untouched.
    async fn insert_menu_entries(&self, rows: &[MenuEntry]) -> Result<(), StoreError>;

    async fn delete_hours_before(&self, cutoff: NaiveDate) -> Result<(), StoreError>;

    async fn delete_menus_before(&self, cutoff: NaiveDate) -> Result<(), StoreError>;
}

#[async_trait]
impl DiningStore for StoreClient {
    async fn load_locations(&self) -> Result<Vec<Location>, StoreError> {
        self.select("dining_halls", "id,slug", &[]).await
    }

    async fn upsert_hours(&self, rows: &[HoursRecord]) -> Result<(), StoreError> {
        self.upsert("hours", rows, "date,dining_hall_id", false).await
    }

    async fn upsert_foods(&self, rows: &[FoodItem]) -> Result<(), StoreError> {
        self.upsert("foods", rows, "name", false).await
    }

    async fn select_food_ids(&self, names: &[String]) -> Result<Vec<FoodRef>, StoreError> {
        let filter = format!("in.({})", postgrest_in_list(names));
        self.select("foods", "id,name", &[("name", filter)]).await
    }

    async fn insert_menu_entries(&self, rows: &[MenuEntry]) -> Result<(), StoreError> {
        self.upsert("menus", rows, "date,meal_period,dining_hall_id,food_id", true)
            .await
    }

    async fn delete_hours_before(&self, cutoff: NaiveDate) -> Result<(), StoreError> {
        self.delete("hours", &[("date", format!("lt.{cutoff}"))]).await
    }

    async fn delete_menus_before(&self, cutoff: NaiveDate) -> Result<(), StoreError> {
        self.delete("menus", &[("date", format!("lt.{cutoff}"))]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_url_joins_rest_path() {
        let store = StoreClient::new("https://example.supabase.co/", "key").unwrap();
        assert_eq!(
            store.table_url("hours"),
            "https://example.supabase.co/rest/v1/hours"
        );
    }

    #[test]
    fn in_list_quotes_names_with_commas_and_quotes() {
        let list = postgrest_in_list(&[
            "Mac & Cheese".to_string(),
            "Chicken, Roasted".to_string(),
            "PB\"J".to_string(),
        ]);
        assert_eq!(list, "\"Mac & Cheese\",\"Chicken, Roasted\",\"PB\\\"J\"");
    }

    #[test]
    fn cutoff_filter_renders_calendar_date() {
        let cutoff = NaiveDate::from_ymd_opt(2025, 2, 25).unwrap();
        assert_eq!(format!("lt.{cutoff}"), "lt.2025-02-25");
    }
}
