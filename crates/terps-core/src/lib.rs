//! Core domain model for the Terps dining sync.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "terps-core";

/// Fixed serving windows, in the order the menu site lists them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MealPeriod {
    Breakfast,
    Lunch,
    Dinner,
}

impl MealPeriod {
    pub const ALL: [MealPeriod; 3] = [MealPeriod::Breakfast, MealPeriod::Lunch, MealPeriod::Dinner];

    /// The exact query value the menu site expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            MealPeriod::Breakfast => "Breakfast",
            MealPeriod::Lunch => "Lunch",
            MealPeriod::Dinner => "Dinner",
        }
    }
}

impl fmt::Display for MealPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dining facility as seeded in the store; read-only to the sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub slug: String,
}

/// One venue's display hours for a single day. Cells the feed leaves empty
/// are already normalized to `"Closed"` by the time this exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueHours {
    pub breakfast: String,
    pub lunch: String,
    pub dinner: String,
}

/// Persisted hours row; at most one per (date, hall).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoursRecord {
    pub date: NaiveDate,
    pub dining_hall_id: Uuid,
    pub breakfast: String,
    pub lunch: String,
    pub dinner: String,
}

/// A menu item as scraped, before any reconciliation. The same name may
/// appear more than once on a page (two serving stations).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedItem {
    pub name: String,
    pub allergens: Vec<String>,
}

/// Food row keyed by name; the allergen set is overwritten wholesale on
/// every upsert, last run wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodItem {
    pub name: String,
    pub allergens: Vec<String>,
}

/// Menu row; inserted once per appearance, duplicate inserts are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub date: NaiveDate,
    pub meal_period: MealPeriod,
    pub dining_hall_id: Uuid,
    pub food_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meal_period_serializes_as_site_query_value() {
        assert_eq!(
            serde_json::to_string(&MealPeriod::Breakfast).unwrap(),
            "\"Breakfast\""
        );
        assert_eq!(MealPeriod::Dinner.as_str(), "Dinner");
    }

    #[test]
    fn meal_periods_keep_serving_order() {
        assert_eq!(
            MealPeriod::ALL,
            [MealPeriod::Breakfast, MealPeriod::Lunch, MealPeriod::Dinner]
        );
    }

    #[test]
    fn hours_record_date_serializes_as_calendar_date() {
        let record = HoursRecord {
            date: NaiveDate::from_ymd_opt(2025, 2, 25).unwrap(),
            dining_hall_id: Uuid::nil(),
            breakfast: "7:00am-10:00am".into(),
            lunch: "Closed".into(),
            dinner: "4:00pm-8:00pm".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["date"], "2025-02-25");
    }
}
