use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::classifier::classify;
use crate::errors::{AppError, AppResult};
use crate::geo::Coordinate;
use crate::models::{Category, Poi, RecommendationResult, RecommendedPoi};
use crate::provider::MapProvider;
use crate::store::SpatialStore;

/// Local-first recommendation engine. The provider is consulted only to fill
/// the gap between what the store returns and the requested limit.
#[derive(Clone)]
pub struct RecommendationEngine {
    store: Arc<dyn SpatialStore>,
    provider: Arc<dyn MapProvider>,
    type_hint: String,
}

impl RecommendationEngine {
    pub fn new(
        store: Arc<dyn SpatialStore>,
        provider: Arc<dyn MapProvider>,
        type_hint: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            type_hint: type_hint.into(),
        }
    }

    pub async fn recommended_pois(
        &self,
        latitude: f64,
        longitude: f64,
        radius_meters: f64,
        limit: usize,
    ) -> AppResult<RecommendationResult> {
        let center = Coordinate::new(longitude, latitude)?;
        validate_radius(radius_meters)?;

        if limit == 0 {
            return Ok(RecommendationResult {
                pois: Vec::new(),
                local_count: 0,
                external_count: 0,
            });
        }

        let local = self
            .store
            .find_nearby(center, radius_meters, Some(limit))
            .await?;
        let local_count = local.len();
        if local_count >= limit {
            debug!(
                target: "recommendations",
                local_count,
                limit,
                "local results satisfy limit; skipping provider"
            );
            return Ok(RecommendationResult {
                pois: local
                    .into_iter()
                    .map(|poi| RecommendedPoi::from_local(poi, &center))
                    .collect(),
                local_count,
                external_count: 0,
            });
        }

        let deficit = limit - local_count;
        let hint = Some(self.type_hint.trim()).filter(|hint| !hint.is_empty());
        let candidates = self
            .provider
            .find_nearby_places(center, radius_meters, hint)
            .await?;
        let candidate_count = candidates.len();

        let mut seen = linked_place_ids(&local);
        let external = candidates
            .into_iter()
            .filter_map(|mut place| {
                place.place_id = place.place_id.trim().to_string();
                (!place.place_id.is_empty() && seen.insert(place.place_id.clone())).then_some(place)
            })
            .take(deficit)
            .map(|place| {
                let category = classify(&place.native_types);
                RecommendedPoi::from_provider(place, category, &center)
            })
            .collect::<Vec<_>>();
        let external_count = external.len();

        info!(
            target: "recommendations",
            local_count,
            external_count,
            candidate_count,
            deficit,
            "recommendations assembled"
        );

        let mut pois = Vec::with_capacity(local_count + external_count);
        pois.extend(
            local
                .into_iter()
                .map(|poi| RecommendedPoi::from_local(poi, &center)),
        );
        pois.extend(external);
        Ok(RecommendationResult {
            pois,
            local_count,
            external_count,
        })
    }

    pub async fn recommended_near_address(
        &self,
        address: &str,
        radius_meters: f64,
        limit: usize,
    ) -> AppResult<RecommendationResult> {
        if address.trim().is_empty() {
            return Err(AppError::Validation("address cannot be empty".into()));
        }
        let center = self.provider.geocode(address).await?;
        self.recommended_pois(center.latitude, center.longitude, radius_meters, limit)
            .await
    }

    pub async fn search(&self, query: &str, limit: usize) -> AppResult<Vec<Poi>> {
        self.store.search_text(query, limit).await
    }

    pub async fn by_category(&self, category: Category) -> AppResult<Vec<Poi>> {
        self.store.find_by_category(category).await
    }
}

fn validate_radius(radius_meters: f64) -> AppResult<()> {
    if !radius_meters.is_finite() || radius_meters <= 0.0 {
        return Err(AppError::Validation(format!(
            "radius {radius_meters} must be a positive number of meters"
        )));
    }
    Ok(())
}

fn linked_place_ids(local: &[Poi]) -> HashSet<String> {
    local
        .iter()
        .filter_map(Poi::linked_place_id)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::db::bootstrap;
    use crate::errors::ProviderError;
    use crate::models::{NewPoi, PoiOrigin};
    use crate::provider::mock::{place, MockProvider};
    use crate::secrets::SecretVault;
    use crate::store::SqliteSpatialStore;

    const LAT: f64 = 47.2357;
    const LON: f64 = 39.7125;

    fn fixture(provider: Arc<MockProvider>) -> (TempDir, SqliteSpatialStore, RecommendationEngine) {
        let dir = tempdir().unwrap();
        let vault = SecretVault::in_memory();
        let ctx = bootstrap(dir.path(), "recommend.db", &vault).unwrap().context;
        let store = SqliteSpatialStore::new(Arc::new(Mutex::new(ctx.connection)));
        let engine = RecommendationEngine::new(
            Arc::new(store.clone()),
            provider,
            "tourist_attraction",
        );
        (dir, store, engine)
    }

    fn seed(store: &SqliteSpatialStore, name: &str, lon_offset: f64) -> Poi {
        let location = Coordinate::new(LON + lon_offset, LAT).unwrap();
        store
            .insert_poi(NewPoi::new(name, location, Category::Culture).with_rating(4.0))
            .unwrap()
    }

    #[tokio::test]
    async fn skips_provider_when_local_results_suffice() {
        let mock = Arc::new(MockProvider::with_nearby(vec![place(
            "x", "Extra", LON, LAT, &["museum"],
        )]));
        let (_dir, store, engine) = fixture(mock.clone());
        seed(&store, "One", 0.001);
        seed(&store, "Two", 0.002);

        let result = engine.recommended_pois(LAT, LON, 1000.0, 2).await.unwrap();
        assert_eq!(result.local_count, 2);
        assert_eq!(result.external_count, 0);
        assert_eq!(mock.nearby_calls(), 0);

        let empty = engine.recommended_pois(LAT, LON, 1000.0, 0).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(mock.nearby_calls(), 0);
    }

    #[tokio::test]
    async fn drops_provider_places_already_linked_locally() {
        let mock = Arc::new(MockProvider::with_nearby(vec![
            place("p1", "Linked", LON + 0.001, LAT, &["museum"]),
            place("p2", "Fresh park", LON + 0.003, LAT, &["park"]),
            place("p2", "Fresh park duplicate", LON + 0.003, LAT, &["park"]),
        ]));
        let (_dir, store, engine) = fixture(mock.clone());
        let location = Coordinate::new(LON + 0.001, LAT).unwrap();
        store
            .insert_poi(NewPoi::new("Local museum", location, Category::Culture).linked_to("p1"))
            .unwrap();

        let result = engine.recommended_pois(LAT, LON, 1000.0, 5).await.unwrap();
        assert_eq!(mock.nearby_calls(), 1);
        assert_eq!(
            mock.last_type_hint.lock().as_deref(),
            Some("tourist_attraction")
        );
        assert_eq!(result.local_count, 1);
        assert_eq!(result.external_count, 1);
        let external = result.external().collect::<Vec<_>>();
        assert_eq!(external[0].provider_place_id.as_deref(), Some("p2"));
        assert_eq!(external[0].category, Category::Nature);
        assert_eq!(external[0].rating, 0.0);
        assert!(external[0].id.is_none());
    }

    #[tokio::test]
    async fn padded_place_ids_still_deduplicate() {
        let mock = Arc::new(MockProvider::with_nearby(vec![
            place(" p1 ", "Linked with padding", LON + 0.001, LAT, &["museum"]),
            place("p2", "Fresh park", LON + 0.003, LAT, &["park"]),
            place("p2\t", "Fresh park again", LON + 0.003, LAT, &["park"]),
            place("  ", "Blank id", LON + 0.004, LAT, &["park"]),
        ]));
        let (_dir, store, engine) = fixture(mock);
        let location = Coordinate::new(LON + 0.001, LAT).unwrap();
        store
            .insert_poi(NewPoi::new("Local museum", location, Category::Culture).linked_to("p1 "))
            .unwrap();

        let result = engine.recommended_pois(LAT, LON, 1000.0, 5).await.unwrap();
        let external = result.external().collect::<Vec<_>>();
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].provider_place_id.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn external_results_fill_only_the_deficit_after_locals() {
        let mut rated = place("e1", "Rated", LON, LAT + 0.001, &["tourist_attraction"]);
        rated.rating = Some(9.0);
        let mock = Arc::new(MockProvider::with_nearby(vec![
            rated,
            place("e2", "Second", LON, LAT + 0.002, &["restaurant"]),
            place("e3", "Third", LON, LAT + 0.003, &["lodging"]),
        ]));
        let (_dir, store, engine) = fixture(mock);
        seed(&store, "Near", 0.001);

        let result = engine.recommended_pois(LAT, LON, 1000.0, 3).await.unwrap();
        let origins = result.pois.iter().map(|poi| poi.origin).collect::<Vec<_>>();
        assert_eq!(
            origins,
            vec![PoiOrigin::Local, PoiOrigin::External, PoiOrigin::External]
        );
        assert_eq!(result.pois[1].provider_place_id.as_deref(), Some("e1"));
        assert_eq!(result.pois[1].rating, 5.0);
        assert_eq!(result.pois[1].category, Category::Attraction);
        assert_eq!(result.pois[2].category, Category::Restaurant);
    }

    #[tokio::test]
    async fn validates_inputs_before_querying() {
        let mock = Arc::new(MockProvider::default());
        let (_dir, _store, engine) = fixture(mock.clone());
        for (lat, lon, radius) in [(91.0, 0.0, 100.0), (0.0, 200.0, 100.0), (0.0, 0.0, 0.0), (0.0, 0.0, f64::NAN)] {
            assert!(matches!(
                engine.recommended_pois(lat, lon, radius, 5).await,
                Err(AppError::Validation(_))
            ));
        }
        assert_eq!(mock.nearby_calls(), 0);
    }

    #[tokio::test]
    async fn provider_failures_propagate() {
        let mock = Arc::new(MockProvider::default());
        mock.fail_next_nearby(ProviderError::RateLimited);
        let (_dir, _store, engine) = fixture(mock);
        let result = engine.recommended_pois(LAT, LON, 500.0, 3).await;
        assert!(matches!(
            result,
            Err(AppError::Provider(ProviderError::RateLimited))
        ));
    }

    #[tokio::test]
    async fn geocodes_address_before_recommending() {
        let mock = Arc::new(MockProvider::default());
        *mock.geocoded.lock() = Some(Coordinate::new(LON, LAT).unwrap());
        let (_dir, store, engine) = fixture(mock.clone());
        seed(&store, "Near", 0.001);

        let result = engine
            .recommended_near_address("Ростов-на-Дону, Большая Садовая", 1000.0, 1)
            .await
            .unwrap();
        assert_eq!(result.local_count, 1);
        assert!(matches!(
            engine.recommended_near_address("  ", 1000.0, 1).await,
            Err(AppError::Validation(_))
        ));
    }
}
