use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, ProviderError};
use crate::geo::Coordinate;
use crate::models::{ProviderPlace, ProviderPlaceDetails};
use crate::provider::MapProvider;

const MAX_SEARCH_RADIUS_METERS: f64 = 50_000.0;
const DETAILS_FIELDS: &str = "place_id,name,geometry,types,rating,formatted_address,\
    formatted_phone_number,website,user_ratings_total";

/// Google Places / Geocoding web-service adapter.
#[derive(Clone)]
pub struct GooglePlacesClient {
    http: Client,
    api_key: SecretString,
    places_base: Url,
    geocode_url: Url,
    language: String,
}

#[derive(Debug, Deserialize)]
struct NearbyResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlaceDto>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    status: String,
    result: Option<PlaceDto>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResultDto>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceDto {
    place_id: Option<String>,
    name: Option<String>,
    geometry: Option<GeometryDto>,
    #[serde(default)]
    types: Vec<String>,
    rating: Option<f64>,
    vicinity: Option<String>,
    formatted_address: Option<String>,
    formatted_phone_number: Option<String>,
    website: Option<String>,
    user_ratings_total: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResultDto {
    formatted_address: Option<String>,
    geometry: Option<GeometryDto>,
}

#[derive(Debug, Deserialize)]
struct GeometryDto {
    location: Option<LatLngDto>,
}

#[derive(Debug, Deserialize)]
struct LatLngDto {
    lat: f64,
    lng: f64,
}

impl GeometryDto {
    fn coordinate(&self) -> Option<Coordinate> {
        let location = self.location.as_ref()?;
        Coordinate::new(location.lng, location.lat).ok()
    }
}

fn normalized_id(id: Option<String>) -> Option<String> {
    id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty())
}

impl PlaceDto {
    /// Drops entries without an id or usable geometry.
    fn into_place(self) -> Option<ProviderPlace> {
        let Some(place_id) = normalized_id(self.place_id) else {
            trace!(target: "google_places", name = ?self.name, "dropping result without place_id");
            return None;
        };
        let Some(location) = self.geometry.as_ref().and_then(GeometryDto::coordinate) else {
            trace!(target: "google_places", %place_id, "dropping result without valid geometry");
            return None;
        };
        Some(ProviderPlace {
            name: self.name.unwrap_or_default(),
            place_id,
            location,
            native_types: self.types,
            rating: self.rating,
            vicinity: self.vicinity.or(self.formatted_address),
        })
    }

    fn into_details(self) -> Result<ProviderPlaceDetails, ProviderError> {
        let place_id = normalized_id(self.place_id)
            .ok_or_else(|| ProviderError::Malformed("details result missing place_id".into()))?;
        let location = self
            .geometry
            .as_ref()
            .and_then(GeometryDto::coordinate)
            .ok_or_else(|| ProviderError::Malformed(format!("place {place_id} missing geometry")))?;
        Ok(ProviderPlaceDetails {
            name: self.name.unwrap_or_default(),
            place_id,
            location,
            native_types: self.types,
            rating: self.rating,
            formatted_address: self.formatted_address,
            phone: self.formatted_phone_number,
            website: self.website,
            user_ratings_total: self.user_ratings_total,
        })
    }
}

impl GooglePlacesClient {
    pub fn new(config: &AppConfig, api_key: SecretString) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("poi-aggregator/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.provider_timeout_secs.max(1)))
            .build()?;
        let places_base = parse_url("PLACES_API_BASE", config.places_api_base.trim_end_matches('/'))?;
        let geocode_url = parse_url("GEOCODE_API_URL", &config.geocode_api_url)?;
        Ok(Self {
            http,
            api_key,
            places_base,
            geocode_url,
            language: config.provider_language.clone(),
        })
    }

    fn places_url(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.places_base.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("invalid places API base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        mut url: Url,
        params: &[(&str, String)],
    ) -> AppResult<T> {
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(key, value)| (*key, value.as_str())))
            .append_pair("language", &self.language)
            .append_pair("key", self.api_key.expose_secret());

        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(map_status_error(status, &body).into());
        }
        serde_json::from_str(&body).map_err(|err| {
            ProviderError::Malformed(format!("invalid provider JSON payload: {err}")).into()
        })
    }
}

#[async_trait]
impl MapProvider for GooglePlacesClient {
    async fn geocode(&self, address: &str) -> AppResult<Coordinate> {
        let response: GeocodeResponse = self
            .get_json(
                self.geocode_url.clone(),
                &[("address", address.trim().to_string())],
            )
            .await?;
        check_api_status(&response.status, response.error_message)?;
        let location = response
            .results
            .iter()
            .find_map(|result| result.geometry.as_ref().and_then(GeometryDto::coordinate))
            .ok_or(ProviderError::NoResults)?;
        debug!(target: "google_places", ?location, "geocoded address");
        Ok(location)
    }

    async fn reverse_geocode(&self, coordinate: Coordinate) -> AppResult<String> {
        coordinate.validate()?;
        let response: GeocodeResponse = self
            .get_json(
                self.geocode_url.clone(),
                &[(
                    "latlng",
                    format!("{},{}", coordinate.latitude, coordinate.longitude),
                )],
            )
            .await?;
        check_api_status(&response.status, response.error_message)?;
        response
            .results
            .into_iter()
            .find_map(|result| result.formatted_address.filter(|addr| !addr.trim().is_empty()))
            .ok_or_else(|| ProviderError::NoResults.into())
    }

    async fn find_nearby_places(
        &self,
        center: Coordinate,
        radius_meters: f64,
        type_hint: Option<&str>,
    ) -> AppResult<Vec<ProviderPlace>> {
        center.validate()?;
        if !radius_meters.is_finite() || radius_meters <= 0.0 {
            return Err(AppError::Validation(format!(
                "radius {radius_meters} must be a positive number of meters"
            )));
        }
        let radius = radius_meters.round().clamp(1.0, MAX_SEARCH_RADIUS_METERS) as u32;
        let mut params = vec![
            (
                "location",
                format!("{},{}", center.latitude, center.longitude),
            ),
            ("radius", radius.to_string()),
        ];
        if let Some(hint) = type_hint.map(str::trim).filter(|hint| !hint.is_empty()) {
            params.push(("type", hint.to_string()));
        }

        let url = self.places_url(&["nearbysearch", "json"])?;
        let response: NearbyResponse = self.get_json(url, &params).await?;
        match check_api_status(&response.status, response.error_message) {
            Ok(()) => {}
            Err(ProviderError::NoResults) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }

        let total = response.results.len();
        let places = response
            .results
            .into_iter()
            .filter_map(PlaceDto::into_place)
            .collect::<Vec<_>>();
        debug!(
            target: "google_places",
            total,
            kept = places.len(),
            radius,
            "nearby search complete"
        );
        Ok(places)
    }

    async fn place_details(&self, place_id: &str) -> AppResult<ProviderPlaceDetails> {
        let place_id = place_id.trim();
        if place_id.is_empty() {
            return Err(AppError::Validation("place id cannot be empty".into()));
        }
        let url = self.places_url(&["details", "json"])?;
        let response: DetailsResponse = self
            .get_json(
                url,
                &[
                    ("place_id", place_id.to_string()),
                    ("fields", DETAILS_FIELDS.to_string()),
                ],
            )
            .await?;
        check_api_status(&response.status, response.error_message)?;
        let result = response.result.ok_or(ProviderError::NoResults)?;
        Ok(result.into_details()?)
    }
}

fn parse_url(name: &str, value: &str) -> AppResult<Url> {
    Url::parse(value).map_err(|err| AppError::Config(format!("invalid {name} URL: {err}")))
}

/// Maps the web-service `status` field onto provider errors.
fn check_api_status(status: &str, message: Option<String>) -> Result<(), ProviderError> {
    let detail = || message.clone().unwrap_or_else(|| status.to_string());
    match status {
        "OK" => Ok(()),
        "ZERO_RESULTS" | "NOT_FOUND" => Err(ProviderError::NoResults),
        "OVER_QUERY_LIMIT" => Err(ProviderError::RateLimited),
        "REQUEST_DENIED" => Err(ProviderError::Unauthorized(detail())),
        _ => Err(ProviderError::Rejected(detail())),
    }
}

fn map_status_error(status: StatusCode, body: &str) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Unauthorized(body_excerpt(body))
        }
        other => ProviderError::Status(other.as_u16()),
    }
}

fn body_excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".into();
    }
    trimmed.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_api_statuses() {
        assert!(check_api_status("OK", None).is_ok());
        assert!(matches!(
            check_api_status("ZERO_RESULTS", None),
            Err(ProviderError::NoResults)
        ));
        assert!(matches!(
            check_api_status("OVER_QUERY_LIMIT", None),
            Err(ProviderError::RateLimited)
        ));
        assert!(matches!(
            check_api_status("REQUEST_DENIED", Some("The provided API key is invalid.".into())),
            Err(ProviderError::Unauthorized(msg)) if msg.contains("invalid")
        ));
        assert!(matches!(
            check_api_status("INVALID_REQUEST", None),
            Err(ProviderError::Rejected(msg)) if msg == "INVALID_REQUEST"
        ));
    }

    #[test]
    fn maps_http_statuses() {
        assert!(matches!(
            map_status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimited
        ));
        assert!(matches!(
            map_status_error(StatusCode::FORBIDDEN, ""),
            ProviderError::Unauthorized(msg) if msg == "empty response body"
        ));
        assert!(matches!(
            map_status_error(StatusCode::BAD_GATEWAY, "oops"),
            ProviderError::Status(502)
        ));
    }

    #[test]
    fn drops_results_without_id_or_geometry() {
        let payload = r#"{
            "status": "OK",
            "results": [
                {"place_id": " p1 ", "name": "Собор", "geometry": {"location": {"lat": 47.22, "lng": 39.71}}, "types": ["church"]},
                {"place_id": "   ", "name": "Blank id", "geometry": {"location": {"lat": 47.22, "lng": 39.71}}},
                {"name": "No id", "geometry": {"location": {"lat": 47.22, "lng": 39.71}}},
                {"place_id": "p3", "name": "No geometry"},
                {"place_id": "p4", "name": "Bad geometry", "geometry": {"location": {"lat": 123.0, "lng": 39.71}}}
            ]
        }"#;
        let response: NearbyResponse = serde_json::from_str(payload).unwrap();
        let places = response
            .results
            .into_iter()
            .filter_map(PlaceDto::into_place)
            .collect::<Vec<_>>();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].place_id, "p1");
        assert_eq!(places[0].native_types, vec!["church".to_string()]);
        assert!((places[0].location.latitude - 47.22).abs() < 1e-9);
    }

    #[test]
    fn builds_endpoint_urls_under_configured_base() {
        let config = AppConfig {
            places_api_base: "http://127.0.0.1:9/maps/api/place/".into(),
            ..AppConfig::default()
        };
        let client = GooglePlacesClient::new(&config, SecretString::new("k".into())).unwrap();
        let url = client.places_url(&["nearbysearch", "json"]).unwrap();
        assert_eq!(url.path(), "/maps/api/place/nearbysearch/json");
    }
}
