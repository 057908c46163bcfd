//! Reconciliation and upsert pipeline: hours sync, menu sync, retention sweep.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use chrono::{Datelike, Days, NaiveDate};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use terps_adapters::{extract_today_hours, DiningSource, HttpDiningSource};
use terps_core::{FoodItem, HoursRecord, MealPeriod, MenuEntry, ScrapedItem, VenueHours};
use terps_storage::DiningStore;

pub const CRATE_NAME: &str = "terps-sync";

pub const HOURS_FEED_URL: &str = "https://docs.google.com/spreadsheets/d/1vdWskGO2-aJfKLSW8-3zMaj_nx4SBJHF3OvMEy4-ZNo/gviz/tq?gid=479022338";
pub const MENU_URL: &str = "http://nutrition.umd.edu/longmenu.aspx";
pub const BATCH_SIZE: usize = 100;
pub const RETENTION_DAYS: u64 = 90;
pub const HOURS_TIMEOUT: Duration = Duration::from_secs(10);
pub const MENU_TIMEOUT: Duration = Duration::from_secs(15);
pub const USER_AGENT: &str = "terps-dining-sync/0.1";

/// A dining hall as the menu site addresses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiningHall {
    pub slug: String,
    pub location_num: String,
}

impl DiningHall {
    fn new(slug: &str, location_num: &str) -> Self {
        Self {
            slug: slug.to_string(),
            location_num: location_num.to_string(),
        }
    }
}

/// Immutable run configuration. Built once (normally via `Default`, which
/// carries the compiled-in campus constants) and handed to the pipeline at
/// construction; nothing reads it as process-wide state.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub hours_feed_url: String,
    pub menu_url: String,
    pub dining_halls: Vec<DiningHall>,
    pub meal_periods: Vec<MealPeriod>,
    /// Hours-feed venue label → dining hall slug.
    pub venue_slugs: Vec<(String, String)>,
    pub batch_size: usize,
    pub retention_days: u64,
    pub hours_timeout: Duration,
    pub menu_timeout: Duration,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hours_feed_url: HOURS_FEED_URL.to_string(),
            menu_url: MENU_URL.to_string(),
            dining_halls: vec![
                DiningHall::new("south", "16"),
                DiningHall::new("yahentamitsi", "19"),
                DiningHall::new("251_north", "51"),
            ],
            meal_periods: MealPeriod::ALL.to_vec(),
            venue_slugs: vec![
                ("South Campus".to_string(), "south".to_string()),
                ("Yahentamitsi".to_string(), "yahentamitsi".to_string()),
                ("251 North".to_string(), "251_north".to_string()),
            ],
            batch_size: BATCH_SIZE,
            retention_days: RETENTION_DAYS,
            hours_timeout: HOURS_TIMEOUT,
            menu_timeout: MENU_TIMEOUT,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Result of one failure-isolation unit. Failures land here instead of
/// aborting the run; the next scheduled run is the retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UnitOutcome {
    Ok { rows_written: usize },
    Failed { reason: String },
}

/// One (location, meal period) scrape-and-write unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuUnit {
    pub slug: String,
    pub meal_period: MealPeriod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cutoff: NaiveDate,
    pub menus: Result<(), String>,
    pub hours: Result<(), String>,
}

/// Aggregate of a full run. The run "succeeds" whenever the sequence
/// completes; individual unit failures are visible here and in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub today: NaiveDate,
    pub hours: UnitOutcome,
    pub menu_units: Vec<(MenuUnit, UnitOutcome)>,
    pub sweep: SweepReport,
}

pub struct SyncPipeline<D, S> {
    config: SyncConfig,
    source: D,
    store: S,
}

impl<S: DiningStore> SyncPipeline<HttpDiningSource, S> {
    /// Production wiring: HTTP sources with the configured per-source
    /// timeouts.
    pub fn over_http(config: SyncConfig, store: S) -> anyhow::Result<Self> {
        let source = HttpDiningSource::new(
            &config.hours_feed_url,
            &config.menu_url,
            config.hours_timeout,
            config.menu_timeout,
            &config.user_agent,
        )?;
        Ok(Self::new(config, source, store))
    }
}

impl<D: DiningSource, S: DiningStore> SyncPipeline<D, S> {
    pub fn new(config: SyncConfig, source: D, store: S) -> Self {
        Self {
            config,
            source,
            store,
        }
    }

    /// Full sequence: identifiers → hours → menus → sweep. Only identifier
    /// loading can abort; every later failure is contained in its unit and
    /// recorded in the report. The sweep runs regardless of prior phases.
    pub async fn run(&self, today: NaiveDate) -> anyhow::Result<RunReport> {
        info!(%today, "starting sync");
        let hall_ids = self.load_location_ids().await?;

        let hours = self.sync_hours(&hall_ids, today).await;
        let menu_units = self.sync_menus(&hall_ids, today).await;
        let sweep = self.sweep(today).await;

        info!("sync sequence complete");
        Ok(RunReport {
            today,
            hours,
            menu_units,
            sweep,
        })
    }

    /// Slug → internal id mapping, loaded once per run. Fatal on failure:
    /// nothing downstream can resolve identifiers without it.
    pub async fn load_location_ids(&self) -> anyhow::Result<HashMap<String, Uuid>> {
        let rows = self
            .store
            .load_locations()
            .await
            .context("loading dining hall ids")?;
        Ok(rows.into_iter().map(|l| (l.slug, l.id)).collect())
    }

    /// Phase A: today's hours for every recognized venue, one merge-upsert
    /// batch. Best effort; a failure here never blocks the menu phase.
    pub async fn sync_hours(
        &self,
        hall_ids: &HashMap<String, Uuid>,
        today: NaiveDate,
    ) -> UnitOutcome {
        match self.sync_hours_inner(hall_ids, today).await {
            Ok(rows_written) => UnitOutcome::Ok { rows_written },
            Err(err) => {
                let reason = format!("{err:#}");
                error!(error = %reason, "hours sync failed");
                UnitOutcome::Failed { reason }
            }
        }
    }

    async fn sync_hours_inner(
        &self,
        hall_ids: &HashMap<String, Uuid>,
        today: NaiveDate,
    ) -> anyhow::Result<usize> {
        let grid = self.source.hours_grid().await.context("fetching hours feed")?;
        let by_slug = extract_today_hours(&grid, &self.config.venue_slugs, today)?;
        let records = hours_records(&by_slug, hall_ids, today);

        let mut rows_written = 0;
        for chunk in records.chunks(self.config.batch_size) {
            self.store
                .upsert_hours(chunk)
                .await
                .context("upserting hours")?;
            rows_written += chunk.len();
        }
        info!(rows = rows_written, "hours upserted");
        Ok(rows_written)
    }

    /// Phase B: every (hall, meal period) unit in sequence. Units are fully
    /// isolated; one failing scrape or write never stops the loop.
    pub async fn sync_menus(
        &self,
        hall_ids: &HashMap<String, Uuid>,
        today: NaiveDate,
    ) -> Vec<(MenuUnit, UnitOutcome)> {
        let date_str = menu_date_param(today);
        let mut reports = Vec::new();
        for hall in &self.config.dining_halls {
            for &period in &self.config.meal_periods {
                let unit = MenuUnit {
                    slug: hall.slug.clone(),
                    meal_period: period,
                };
                info!(slug = %hall.slug, period = %period, "syncing menu unit");
                let outcome = match self
                    .sync_menu_unit(hall_ids, hall, &date_str, period, today)
                    .await
                {
                    Ok(rows_written) => UnitOutcome::Ok { rows_written },
                    Err(err) => {
                        let reason = format!("{err:#}");
                        error!(slug = %hall.slug, period = %period, error = %reason, "menu unit failed");
                        UnitOutcome::Failed { reason }
                    }
                };
                reports.push((unit, outcome));
            }
        }
        reports
    }

    async fn sync_menu_unit(
        &self,
        hall_ids: &HashMap<String, Uuid>,
        hall: &DiningHall,
        date_str: &str,
        period: MealPeriod,
        today: NaiveDate,
    ) -> anyhow::Result<usize> {
        let Some(&hall_id) = hall_ids.get(&hall.slug) else {
            anyhow::bail!("dining hall slug {} not present in store", hall.slug);
        };

        let items = self
            .source
            .menu_items(&hall.location_num, date_str, period.as_str())
            .await
            .with_context(|| format!("scraping {} {}", hall.slug, period))?;
        if items.is_empty() {
            info!(slug = %hall.slug, period = %period, "no menu items");
            return Ok(0);
        }

        // Foods first: menu rows must never reference a food this run did
        // not upsert.
        let foods = dedup_foods(&items);
        for chunk in foods.chunks(self.config.batch_size) {
            self.store
                .upsert_foods(chunk)
                .await
                .context("upserting foods")?;
        }

        // Re-resolve every originally scraped name to its persisted id.
        let names: Vec<String> = items.iter().map(|i| i.name.clone()).collect();
        let mut food_ids: HashMap<String, Uuid> = HashMap::new();
        for chunk in names.chunks(self.config.batch_size) {
            for row in self
                .store
                .select_food_ids(chunk)
                .await
                .context("selecting food ids")?
            {
                food_ids.insert(row.name, row.id);
            }
        }

        let entries = menu_entries(&items, &food_ids, hall_id, period, today);
        let mut rows_written = 0;
        for chunk in entries.chunks(self.config.batch_size) {
            self.store
                .insert_menu_entries(chunk)
                .await
                .context("inserting menu rows")?;
            rows_written += chunk.len();
        }
        info!(slug = %hall.slug, period = %period, rows = rows_written, "menu rows inserted");
        Ok(rows_written)
    }

    /// Retention guardrail: drop menu and hours rows older than the
    /// horizon. The two deletes are independent best-effort calls.
    pub async fn sweep(&self, today: NaiveDate) -> SweepReport {
        let cutoff = today - Days::new(self.config.retention_days);
        info!(%cutoff, "sweeping rows past retention");

        let menus = self
            .store
            .delete_menus_before(cutoff)
            .await
            .map_err(|err| {
                error!(error = %err, "menus sweep failed");
                err.to_string()
            });
        let hours = self
            .store
            .delete_hours_before(cutoff)
            .await
            .map_err(|err| {
                error!(error = %err, "hours sweep failed");
                err.to_string()
            });

        SweepReport {
            cutoff,
            menus,
            hours,
        }
    }
}

/// The menu site's date query value: M/D/YYYY, no leading zeros.
pub fn menu_date_param(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.month(), date.day(), date.year())
}

/// Resolve venue slugs to internal ids. Slugs the store does not know are
/// dropped with a warning; the remaining rows form the write batch.
pub fn hours_records(
    by_slug: &BTreeMap<String, VenueHours>,
    hall_ids: &HashMap<String, Uuid>,
    today: NaiveDate,
) -> Vec<HoursRecord> {
    let mut records = Vec::with_capacity(by_slug.len());
    for (slug, hours) in by_slug {
        let Some(&hall_id) = hall_ids.get(slug) else {
            warn!(slug = %slug, "hours venue slug not present in store");
            continue;
        };
        records.push(HoursRecord {
            date: today,
            dining_hall_id: hall_id,
            breakfast: hours.breakfast.clone(),
            lunch: hours.lunch.clone(),
            dinner: hours.dinner.clone(),
        });
    }
    records
}

/// Collapse scraped items by name. The first occurrence's allergen set
/// wins within a batch; occurrences of one name on one page are expected
/// to agree on allergens.
pub fn dedup_foods(items: &[ScrapedItem]) -> Vec<FoodItem> {
    let mut seen = HashSet::new();
    let mut foods = Vec::new();
    for item in items {
        if seen.insert(item.name.as_str()) {
            foods.push(FoodItem {
                name: item.name.clone(),
                allergens: item.allergens.clone(),
            });
        }
    }
    foods
}

/// Menu rows for every originally scraped name that resolved to a
/// persisted food id. Unresolved names are excluded, never an error;
/// duplicate names yield duplicate rows the store no-ops on insert.
pub fn menu_entries(
    items: &[ScrapedItem],
    food_ids: &HashMap<String, Uuid>,
    hall_id: Uuid,
    period: MealPeriod,
    today: NaiveDate,
) -> Vec<MenuEntry> {
    items
        .iter()
        .filter_map(|item| {
            food_ids.get(&item.name).map(|&food_id| MenuEntry {
                date: today,
                meal_period: period,
                dining_hall_id: hall_id,
                food_id,
            })
        })
        .collect()
}
