use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::{tempdir, TempDir};

use poi_aggregator::{
    AppConfig, Category, Coordinate, NewPoi, PoiOrigin, PoiServices, SecretVault, SyncOutcome,
};

const LAT: f64 = 47.2357;
const LON: f64 = 39.7125;

fn services_for(server: &Server) -> (TempDir, PoiServices) {
    let dir = tempdir().unwrap();
    let config = AppConfig {
        places_api_key: Some(SecretString::new("test-key".into())),
        places_api_base: server.url("/maps/api/place").to_string(),
        geocode_api_url: server.url("/maps/api/geocode/json").to_string(),
        places_rate_limit_qps: 20,
        telemetry_batch_size: 1,
        ..AppConfig::default()
    };
    let services = PoiServices::initialize_with(dir.path(), config, SecretVault::in_memory())
        .expect("services");
    (dir, services)
}

fn near(lon_offset: f64, lat_offset: f64) -> Coordinate {
    Coordinate::new(LON + lon_offset, LAT + lat_offset).unwrap()
}

#[tokio::test]
async fn rostov_recommendations_fill_deficit_after_local_results() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/maps/api/place/nearbysearch/json"),
            request::query(url_decoded(contains(("type", "tourist_attraction")))),
            request::query(url_decoded(contains(("radius", "1000")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({
            "status": "OK",
            "results": [
                {
                    "place_id": "p-linked",
                    "name": "Парк Горького",
                    "geometry": {"location": {"lat": LAT + 0.002, "lng": LON}},
                    "types": ["park"]
                },
                {
                    "place_id": "p-museum",
                    "name": "Музей изобразительных искусств",
                    "geometry": {"location": {"lat": LAT + 0.004, "lng": LON}},
                    "types": ["museum", "tourist_attraction"],
                    "rating": 4.6
                },
                {
                    "place_id": "p-cinema",
                    "name": "Кинотеатр Победа",
                    "geometry": {"location": {"lat": LAT - 0.003, "lng": LON}},
                    "types": ["кинотеатр"]
                },
                {
                    "place_id": "p-extra",
                    "name": "Лишний",
                    "geometry": {"location": {"lat": LAT - 0.005, "lng": LON}},
                    "types": ["store"]
                }
            ]
        }))),
    );

    let (_dir, services) = services_for(&server);
    let store = services.store();
    store
        .insert_poi(
            NewPoi::new("Парк Горького", near(0.0, 0.002), Category::Nature)
                .with_rating(4.5)
                .linked_to("p-linked"),
        )
        .unwrap();
    store
        .insert_poi(NewPoi::new("Кофейня на Пушкинской", near(0.001, 0.0), Category::Restaurant))
        .unwrap();
    store
        .insert_poi(NewPoi::new("Городской сквер", near(-0.006, 0.0), Category::Nature))
        .unwrap();
    store
        .insert_poi(NewPoi::new("Левбердон", near(0.0, -0.05), Category::Nature))
        .unwrap();

    let result = services
        .engine()
        .recommended_pois(LAT, LON, 1000.0, 5)
        .await
        .expect("recommendations");

    assert_eq!(result.local_count, 3);
    assert_eq!(result.external_count, 2);
    let names = result.pois.iter().map(|poi| poi.name.as_str()).collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            "Кофейня на Пушкинской",
            "Парк Горького",
            "Городской сквер",
            "Музей изобразительных искусств",
            "Кинотеатр Победа",
        ]
    );
    assert!(result.pois[..3]
        .iter()
        .all(|poi| poi.origin == PoiOrigin::Local));
    let external = result.external().collect::<Vec<_>>();
    assert_eq!(external[0].category, Category::Culture);
    assert_eq!(external[0].rating, 4.6);
    assert_eq!(external[1].category, Category::Entertainment);
    assert!(external
        .iter()
        .all(|poi| poi.provider_place_id.as_deref() != Some("p-linked")));
}

#[tokio::test]
async fn satisfied_limit_never_reaches_the_provider() {
    // Any request to the server would fail verification on drop.
    let server = Server::run();
    let (_dir, services) = services_for(&server);
    for offset in [0.001, 0.002, 0.003] {
        services
            .store()
            .insert_poi(NewPoi::new(
                format!("Точка {offset}"),
                near(offset, 0.0),
                Category::Attraction,
            ))
            .unwrap();
    }

    let result = services
        .engine()
        .recommended_pois(LAT, LON, 1000.0, 3)
        .await
        .expect("recommendations");
    assert_eq!(result.len(), 3);
    assert_eq!(result.external_count, 0);
}

#[tokio::test]
async fn sync_links_close_match_and_ignores_distant_one() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/maps/api/place/nearbysearch/json"),
            request::query(url_decoded(contains(("radius", "100")))),
        ])
        .times(2)
        .respond_with(json_encoded(json!({
            "status": "OK",
            "results": [{
                "place_id": "p-library",
                "name": "Донская публичная библиотека",
                "geometry": {"location": {"lat": LAT, "lng": LON + 0.0006}},
                "types": ["library"]
            }]
        }))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/maps/api/place/details/json"),
            request::query(url_decoded(contains(("place_id", "p-library")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({
            "status": "OK",
            "result": {
                "place_id": "p-library",
                "name": "Донская публичная библиотека",
                "geometry": {"location": {"lat": LAT, "lng": LON + 0.0006}},
                "types": ["library", "point_of_interest"],
                "rating": 4.7
            }
        }))),
    );

    let (_dir, services) = services_for(&server);
    let close = services
        .store()
        .insert_poi(NewPoi::new("Библиотека", near(0.0, 0.0), Category::Culture))
        .unwrap();
    // 0.002° of longitude at this latitude is roughly 150 m from the candidate.
    let distant = services
        .store()
        .insert_poi(NewPoi::new("Сквер", near(0.0026, 0.0), Category::Nature))
        .unwrap();

    let linked = services
        .sync()
        .sync_poi_report(&close.id)
        .await
        .expect("sync close");
    assert_eq!(linked.outcome, SyncOutcome::Linked);
    assert_eq!(linked.poi.linked_place_id(), Some("p-library"));
    assert_eq!(linked.poi.rating, 4.7);

    let untouched = services.sync().sync_poi(&distant.id).await.expect("sync distant");
    assert!(!untouched.is_linked());
    assert_eq!(untouched.version, distant.version);

    services.telemetry().flush().unwrap();
    let audit = std::fs::read_to_string(services.telemetry().buffer_path()).unwrap();
    assert!(audit.contains("poi_linked"));
}

#[tokio::test]
async fn stats_reflect_active_pois() {
    let server = Server::run();
    let (_dir, services) = services_for(&server);

    let empty = services.stats().map_stats().await.expect("stats");
    assert_eq!(empty.total_pois, 0);
    assert_eq!(empty.avg_rating, 0.0);
    assert!(empty.by_category.is_empty());

    let store = services.store();
    store
        .insert_poi(NewPoi::new("Отель Дон", near(0.0, 0.0), Category::Hotel).with_rating(4.0))
        .unwrap();
    store
        .insert_poi(NewPoi::new("Хостел", near(0.001, 0.0), Category::Hotel).with_rating(3.0))
        .unwrap();
    store
        .insert_poi(NewPoi::new("Стадион", near(0.002, 0.0), Category::Sport).with_rating(5.0))
        .unwrap();

    let stats = services.stats().map_stats().await.expect("stats");
    assert_eq!(stats.total_pois, 3);
    assert_eq!(stats.categories, vec![Category::Hotel, Category::Sport]);
    assert!((stats.avg_rating - 4.0).abs() < 1e-9);

    let health = services.health().expect("health");
    assert!(health.has_encryption_key);
    assert!(health.config.has_places_api_key);
}
