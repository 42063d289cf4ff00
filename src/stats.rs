use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::errors::AppResult;
use crate::models::Category;
use crate::store::{CategoryRollup, SpatialStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub category: Category,
    pub count: u64,
    pub avg_rating: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapStats {
    #[serde(rename = "totalPOIs")]
    pub total_pois: u64,
    pub avg_rating: f64,
    pub categories: Vec<Category>,
    pub by_category: Vec<CategoryStats>,
}

impl MapStats {
    pub fn empty() -> Self {
        Self {
            total_pois: 0,
            avg_rating: 0.0,
            categories: Vec::new(),
            by_category: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn SpatialStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn SpatialStore>) -> Self {
        Self { store }
    }

    pub async fn map_stats(&self) -> AppResult<MapStats> {
        let rollup = self.store.category_rollup().await?;
        let stats = summarize(rollup);
        debug!(
            target: "map_stats",
            total = stats.total_pois,
            categories = stats.categories.len(),
            "map stats computed"
        );
        Ok(stats)
    }
}

/// Folds per-category rollups into map-wide figures. Categories are ordered
/// by descending count, ties by declaration order.
pub fn summarize(rollup: Vec<CategoryRollup>) -> MapStats {
    let mut by_category = rollup
        .into_iter()
        .filter(|entry| entry.count > 0)
        .map(|entry| CategoryStats {
            category: entry.category,
            count: entry.count,
            avg_rating: entry.avg_rating,
        })
        .collect::<Vec<_>>();
    if by_category.is_empty() {
        return MapStats::empty();
    }

    by_category.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.category.declaration_rank().cmp(&b.category.declaration_rank()))
    });

    let total_pois = by_category.iter().map(|entry| entry.count).sum::<u64>();
    let weighted = by_category
        .iter()
        .map(|entry| entry.avg_rating * entry.count as f64)
        .sum::<f64>();
    let avg_rating = if total_pois == 0 {
        0.0
    } else {
        weighted / total_pois as f64
    };

    MapStats {
        total_pois,
        avg_rating,
        categories: by_category.iter().map(|entry| entry.category).collect(),
        by_category,
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::db::bootstrap;
    use crate::geo::Coordinate;
    use crate::models::NewPoi;
    use crate::secrets::SecretVault;
    use crate::store::SqliteSpatialStore;

    fn rollup(category: Category, count: u64, avg_rating: f64) -> CategoryRollup {
        CategoryRollup {
            category,
            count,
            avg_rating,
        }
    }

    #[test]
    fn empty_rollup_yields_zeros() {
        let stats = summarize(Vec::new());
        assert_eq!(stats, MapStats::empty());
        assert_eq!(stats.avg_rating, 0.0);
    }

    #[test]
    fn orders_by_count_then_declaration() {
        let stats = summarize(vec![
            rollup(Category::Nature, 2, 3.0),
            rollup(Category::Restaurant, 2, 4.0),
            rollup(Category::Hotel, 5, 4.4),
        ]);
        assert_eq!(
            stats.categories,
            vec![Category::Hotel, Category::Restaurant, Category::Nature]
        );
        assert_eq!(stats.total_pois, 9);
        let expected = (5.0 * 4.4 + 2.0 * 4.0 + 2.0 * 3.0) / 9.0;
        assert!((stats.avg_rating - expected).abs() < 1e-9);
    }

    #[test]
    fn serializes_with_public_field_names() {
        let stats = summarize(vec![rollup(Category::Sport, 1, 5.0)]);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalPOIs"], 1);
        assert_eq!(json["avgRating"], 5.0);
        assert_eq!(json["categories"][0], "SPORT");
        assert_eq!(json["byCategory"][0]["category"], "SPORT");
        assert_eq!(json["byCategory"][0]["avgRating"], 5.0);
    }

    #[tokio::test]
    async fn aggregates_active_pois_from_store() {
        let dir = tempdir().unwrap();
        let vault = SecretVault::in_memory();
        let ctx = bootstrap(dir.path(), "stats.db", &vault).unwrap().context;
        let store = SqliteSpatialStore::new(Arc::new(Mutex::new(ctx.connection)));
        let aggregator = StatsAggregator::new(Arc::new(store.clone()));

        assert_eq!(aggregator.map_stats().await.unwrap(), MapStats::empty());

        let here = Coordinate::new(39.7125, 47.2357).unwrap();
        store
            .insert_poi(NewPoi::new("A", here, Category::Restaurant).with_rating(4.0))
            .unwrap();
        store
            .insert_poi(NewPoi::new("B", here, Category::Restaurant).with_rating(2.0))
            .unwrap();
        let hidden = store
            .insert_poi(NewPoi::new("C", here, Category::Culture).with_rating(5.0))
            .unwrap();
        store.set_active(&hidden.id, false).unwrap();

        let stats = aggregator.map_stats().await.unwrap();
        assert_eq!(stats.total_pois, 2);
        assert_eq!(stats.categories, vec![Category::Restaurant]);
        assert!((stats.avg_rating - 3.0).abs() < 1e-9);
    }
}
