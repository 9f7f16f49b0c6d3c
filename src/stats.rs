use crate::store::{Store, StoreError};
use chrono::{Datelike, NaiveDate, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::warn;

const DAILY_TTL: Duration = Duration::from_secs(35 * 24 * 3600);
const WEEKLY_TTL: Duration = Duration::from_secs(180 * 24 * 3600);

pub fn daily_key(day: NaiveDate) -> String {
    format!("stats:daily:{}", day.format("%Y-%m-%d"))
}

/// ISO week, so the first days of January may belong to the previous year.
pub fn weekly_key(day: NaiveDate) -> String {
    let week = day.iso_week();
    format!("stats:weekly:{}-{:02}", week.year(), week.week())
}

/// Per-principal completed-job counters.
#[derive(Clone)]
pub struct UsageStats {
    store: Arc<dyn Store>,
}

impl UsageStats {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn increment(&self, principal: u64) -> Result<(), StoreError> {
        self.increment_on(Utc::now().date_naive(), principal).await
    }

    pub async fn increment_on(&self, day: NaiveDate, principal: u64) -> Result<(), StoreError> {
        let field = principal.to_string();
        self.store.hash_incr(&daily_key(day), &field, DAILY_TTL).await?;
        self.store.hash_incr(&weekly_key(day), &field, WEEKLY_TTL).await
    }

    pub async fn daily(&self, day: NaiveDate) -> Result<Vec<(String, i64)>, StoreError> {
        self.read(&daily_key(day)).await
    }

    pub async fn weekly(&self, day: NaiveDate) -> Result<Vec<(String, i64)>, StoreError> {
        self.read(&weekly_key(day)).await
    }

    async fn read(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let raw = self.store.hash_get_all(key).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(field, value)| match value.parse::<i64>() {
                Ok(count) => Some((field, count)),
                Err(_) => {
                    warn!(target = "listing_bot.stats", key, field = %field, "non-numeric counter skipped");
                    None
                }
            })
            .collect())
    }
}

/// Sorts strictly descending by count; ties keep their input order. Known
/// principals are labelled with their alias.
pub fn rank(items: Vec<(String, i64)>, labels: &HashMap<String, String>) -> Vec<(String, i64)> {
    let mut items = items;
    items.sort_by(|a, b| b.1.cmp(&a.1));
    items
        .into_iter()
        .map(|(principal, count)| {
            let label = labels.get(&principal).cloned().unwrap_or(principal);
            (label, count)
        })
        .collect()
}
