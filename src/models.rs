use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::geo::Coordinate;

pub const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Attraction,
    Restaurant,
    Hotel,
    Shopping,
    Entertainment,
    Transport,
    Health,
    Education,
    Religious,
    Nature,
    Culture,
    Sport,
    Other,
}

impl Category {
    pub const ALL: [Category; 13] = [
        Category::Attraction,
        Category::Restaurant,
        Category::Hotel,
        Category::Shopping,
        Category::Entertainment,
        Category::Transport,
        Category::Health,
        Category::Education,
        Category::Religious,
        Category::Nature,
        Category::Culture,
        Category::Sport,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Attraction => "ATTRACTION",
            Category::Restaurant => "RESTAURANT",
            Category::Hotel => "HOTEL",
            Category::Shopping => "SHOPPING",
            Category::Entertainment => "ENTERTAINMENT",
            Category::Transport => "TRANSPORT",
            Category::Health => "HEALTH",
            Category::Education => "EDUCATION",
            Category::Religious => "RELIGIOUS",
            Category::Nature => "NATURE",
            Category::Culture => "CULTURE",
            Category::Sport => "SPORT",
            Category::Other => "OTHER",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        let normalized = value.trim().to_ascii_uppercase();
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| AppError::Validation(format!("unknown category: {value}")))
    }

    /// Lenient decoding for values read back from storage.
    pub(crate) fn from_stored(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|_| {
            warn!(target: "spatial_store", value, "unknown stored category; using OTHER");
            Category::Other
        })
    }

    pub(crate) fn declaration_rank(&self) -> usize {
        Category::ALL
            .iter()
            .position(|candidate| candidate == self)
            .unwrap_or(Category::ALL.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub id: String,
    pub name: String,
    pub description: String,
    pub address: Option<String>,
    pub location: Coordinate,
    pub category: Category,
    pub rating: f64,
    pub provider_place_id: Option<String>,
    pub provider_types: Vec<String>,
    pub is_active: bool,
    pub version: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Poi {
    pub fn is_linked(&self) -> bool {
        self.linked_place_id().is_some()
    }

    pub fn linked_place_id(&self) -> Option<&str> {
        self.provider_place_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Input for seeding a POI into the local store.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPoi {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub address: Option<String>,
    pub location: Coordinate,
    pub category: Category,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub provider_place_id: Option<String>,
}

impl NewPoi {
    pub fn new(name: impl Into<String>, location: Coordinate, category: Category) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            address: None,
            location,
            category,
            rating: 0.0,
            provider_place_id: None,
        }
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = rating;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn linked_to(mut self, place_id: impl Into<String>) -> Self {
        self.provider_place_id = Some(place_id.into());
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("poi name cannot be empty".into()));
        }
        self.location.validate()?;
        if !self.rating.is_finite() || !(0.0..=MAX_RATING).contains(&self.rating) {
            return Err(AppError::Validation(format!(
                "rating {} outside [0, 5]",
                self.rating
            )));
        }
        Ok(())
    }
}

/// Place returned by a provider nearby search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderPlace {
    pub place_id: String,
    pub name: String,
    pub location: Coordinate,
    pub native_types: Vec<String>,
    pub rating: Option<f64>,
    pub vicinity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderPlaceDetails {
    pub place_id: String,
    pub name: String,
    pub location: Coordinate,
    pub native_types: Vec<String>,
    pub rating: Option<f64>,
    pub formatted_address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub user_ratings_total: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoiOrigin {
    Local,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedPoi {
    pub origin: PoiOrigin,
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub address: Option<String>,
    pub location: Coordinate,
    pub category: Category,
    pub rating: f64,
    pub provider_place_id: Option<String>,
    pub distance_km: f64,
}

impl RecommendedPoi {
    pub fn from_local(poi: Poi, center: &Coordinate) -> Self {
        let distance_km = center.distance_km(&poi.location);
        Self {
            origin: PoiOrigin::Local,
            id: Some(poi.id),
            name: poi.name,
            description: poi.description,
            address: poi.address,
            location: poi.location,
            category: poi.category,
            rating: poi.rating,
            provider_place_id: poi.provider_place_id,
            distance_km,
        }
    }

    pub fn from_provider(place: ProviderPlace, category: Category, center: &Coordinate) -> Self {
        let distance_km = center.distance_km(&place.location);
        Self {
            origin: PoiOrigin::External,
            id: None,
            name: place.name,
            description: String::new(),
            address: place.vicinity,
            location: place.location,
            category,
            rating: clamp_rating(place.rating.unwrap_or(0.0)),
            provider_place_id: Some(place.place_id),
            distance_km,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResult {
    pub pois: Vec<RecommendedPoi>,
    pub local_count: usize,
    pub external_count: usize,
}

impl RecommendationResult {
    pub fn len(&self) -> usize {
        self.pois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pois.is_empty()
    }

    pub fn external(&self) -> impl Iterator<Item = &RecommendedPoi> {
        self.pois
            .iter()
            .filter(|poi| poi.origin == PoiOrigin::External)
    }
}

pub fn clamp_rating(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, MAX_RATING)
    } else {
        0.0
    }
}
