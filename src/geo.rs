use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 position stored as `(longitude, latitude)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinate {
    pub fn new(longitude: f64, latitude: f64) -> AppResult<Self> {
        let coordinate = Self {
            longitude,
            latitude,
        };
        coordinate.validate()?;
        Ok(coordinate)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(AppError::Validation(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(AppError::Validation(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        Ok(())
    }

    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        haversine_distance_km(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }
}

/// Great-circle distance between two points given in degrees.
pub fn haversine_distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = degrees_to_radians(lat1);
    let phi2 = degrees_to_radians(lat2);
    let delta_phi = degrees_to_radians(lat2 - lat1);
    let delta_lambda = degrees_to_radians(lon2 - lon1);

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_KM * c
}

pub fn degrees_to_radians(degrees: f64) -> f64 {
    degrees * std::f64::consts::PI / 180.0
}

pub fn radians_to_degrees(radians: f64) -> f64 {
    radians * 180.0 / std::f64::consts::PI
}

/// Axis-aligned box used to prefilter index scans before exact distance checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Box that contains every point within `radius_km` of `center`. Near the
    /// poles or across the antimeridian the longitude span covers the globe.
    pub fn around(center: Coordinate, radius_km: f64) -> Self {
        let lat_delta = radians_to_degrees(radius_km / EARTH_RADIUS_KM);
        let min_lat = (center.latitude - lat_delta).max(-90.0);
        let max_lat = (center.latitude + lat_delta).min(90.0);

        let widest_lat = center.latitude.abs() + lat_delta;
        if widest_lat >= 90.0 {
            return Self {
                min_lat,
                max_lat,
                min_lon: -180.0,
                max_lon: 180.0,
            };
        }

        let lon_delta = lat_delta / degrees_to_radians(widest_lat).cos();
        let min_lon = center.longitude - lon_delta;
        let max_lon = center.longitude + lon_delta;
        if min_lon < -180.0 || max_lon > 180.0 {
            return Self {
                min_lat,
                max_lat,
                min_lon: -180.0,
                max_lon: 180.0,
            };
        }

        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    pub fn contains(&self, point: &Coordinate) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lon
            && point.longitude <= self.max_lon
    }
}
