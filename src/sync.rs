use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::models::{clamp_rating, Poi, ProviderPlace};
use crate::provider::MapProvider;
use crate::store::{LinkUpdate, SpatialStore};
use crate::telemetry::TelemetryClient;

/// Radius of the provider search around a POI being synced.
pub const SYNC_SEARCH_RADIUS_METERS: f64 = 100.0;
/// Candidates must be strictly closer than this to be linked.
pub const MATCH_THRESHOLD_KM: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Link created or moved to a new provider place.
    Linked,
    /// Existing link confirmed and its provider data refreshed.
    Refreshed,
    NoConfidentMatch,
    /// Nearest confident candidate disagreed with the current link.
    LinkRetained,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub poi: Poi,
    pub outcome: SyncOutcome,
    pub matched_place_id: Option<String>,
    pub matched_distance_km: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatchStats {
    pub attempted: usize,
    pub linked: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Links local POIs to provider places and refreshes their provider data.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn SpatialStore>,
    provider: Arc<dyn MapProvider>,
    telemetry: Option<TelemetryClient>,
}

impl SyncService {
    pub fn new(store: Arc<dyn SpatialStore>, provider: Arc<dyn MapProvider>) -> Self {
        Self {
            store,
            provider,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryClient) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub async fn sync_poi(&self, poi_id: &str) -> AppResult<Poi> {
        self.sync_poi_report(poi_id).await.map(|report| report.poi)
    }

    pub async fn sync_poi_report(&self, poi_id: &str) -> AppResult<SyncReport> {
        let report = self.sync_one(poi_id).await;
        self.flush_audit();
        report
    }

    async fn sync_one(&self, poi_id: &str) -> AppResult<SyncReport> {
        let poi = self.load_active(poi_id).await?;
        self.store.record_sync_attempt(&poi.id).await?;
        let candidates = self
            .provider
            .find_nearby_places(poi.location, SYNC_SEARCH_RADIUS_METERS, None)
            .await?;
        let scanned = candidates.len();
        let confident = confident_matches(&poi, candidates);

        let Some((nearest_km, nearest)) = confident.first() else {
            debug!(target: "poi_sync", poi_id, scanned, "no confident provider match");
            return Ok(unchanged(poi, SyncOutcome::NoConfidentMatch, None));
        };

        let current_link = poi.linked_place_id().map(str::to_string);
        let (distance_km, chosen) = match current_link.as_deref() {
            Some(current) => match confident.iter().find(|(_, place)| place.place_id == current) {
                Some((distance, place)) => (distance, place),
                None => {
                    info!(
                        target: "poi_sync",
                        poi_id,
                        current,
                        candidate = %nearest.place_id,
                        distance_km = nearest_km,
                        "nearest match differs from existing link; keeping link"
                    );
                    let matched = (nearest.place_id.clone(), *nearest_km);
                    return Ok(unchanged(poi, SyncOutcome::LinkRetained, Some(matched)));
                }
            },
            None => (nearest_km, nearest),
        };

        let details = self.provider.place_details(&chosen.place_id).await?;
        let provider_types = if details.native_types.is_empty() {
            chosen.native_types.clone()
        } else {
            details.native_types
        };
        let update = LinkUpdate {
            poi_id: poi.id.clone(),
            provider_place_id: Some(chosen.place_id.clone()),
            rating: details.rating.map(clamp_rating).unwrap_or(poi.rating),
            provider_types,
        };
        let updated = self.store.update_provider_link(&update, poi.version).await?;

        let outcome = if current_link.is_some() {
            SyncOutcome::Refreshed
        } else {
            SyncOutcome::Linked
        };
        info!(
            target: "poi_sync",
            poi_id,
            place_id = %chosen.place_id,
            distance_km = *distance_km,
            outcome = ?outcome,
            "provider link stored"
        );
        if outcome == SyncOutcome::Linked {
            self.audit(
                "poi_linked",
                json!({
                    "poi_id": updated.id,
                    "place_id": chosen.place_id,
                    "distance_km": distance_km,
                }),
            );
        }

        Ok(SyncReport {
            poi: updated,
            outcome,
            matched_place_id: Some(chosen.place_id.clone()),
            matched_distance_km: Some(*distance_km),
        })
    }

    /// Clears the provider link so the next sync may choose a new place.
    pub async fn unlink_poi(&self, poi_id: &str) -> AppResult<Poi> {
        let poi = self.load_active(poi_id).await?;
        let previous = poi.linked_place_id().map(str::to_string);
        let update = LinkUpdate {
            poi_id: poi.id.clone(),
            provider_place_id: None,
            rating: poi.rating,
            provider_types: Vec::new(),
        };
        let updated = self.store.update_provider_link(&update, poi.version).await?;
        info!(target: "poi_sync", poi_id, previous = ?previous, "provider link cleared");
        self.audit(
            "poi_unlinked",
            json!({ "poi_id": updated.id, "previous_place_id": previous }),
        );
        self.flush_audit();
        Ok(updated)
    }

    /// Attempts to link up to `batch_size` unlinked POIs. Individual failures
    /// are counted and logged; the batch keeps going.
    pub async fn sync_unlinked(&self, batch_size: usize) -> AppResult<SyncBatchStats> {
        let pending = self.store.list_unlinked(batch_size).await?;
        let mut stats = SyncBatchStats::default();
        for poi in pending {
            stats.attempted += 1;
            match self.sync_one(&poi.id).await {
                Ok(report) if report.outcome == SyncOutcome::Linked => stats.linked += 1,
                Ok(_) => stats.unchanged += 1,
                Err(err) => {
                    warn!(target: "poi_sync", ?err, poi_id = %poi.id, "failed to sync poi");
                    stats.failed += 1;
                }
            }
        }
        self.flush_audit();
        info!(
            target: "poi_sync",
            attempted = stats.attempted,
            linked = stats.linked,
            unchanged = stats.unchanged,
            failed = stats.failed,
            "sync batch finished"
        );
        Ok(stats)
    }

    async fn load_active(&self, poi_id: &str) -> AppResult<Poi> {
        self.store
            .get_poi(poi_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("poi {poi_id}")))
    }

    fn flush_audit(&self) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.flush() {
                warn!(target: "poi_sync", ?err, "failed to flush audit events");
            }
        }
    }

    fn audit(&self, event: &str, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_quietly(event, payload);
        }
    }
}

/// Candidates strictly inside the match threshold, nearest first.
fn confident_matches(poi: &Poi, candidates: Vec<ProviderPlace>) -> Vec<(f64, ProviderPlace)> {
    let mut matches = candidates
        .into_iter()
        .filter_map(|mut place| {
            place.place_id = place.place_id.trim().to_string();
            (!place.place_id.is_empty()).then_some(place)
        })
        .map(|place| (poi.location.distance_km(&place.location), place))
        .filter(|(distance, _)| *distance < MATCH_THRESHOLD_KM)
        .collect::<Vec<_>>();
    matches.sort_by(|(a_dist, a), (b_dist, b)| {
        a_dist
            .partial_cmp(b_dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.place_id.cmp(&b.place_id))
    });
    matches
}

fn unchanged(poi: Poi, outcome: SyncOutcome, matched: Option<(String, f64)>) -> SyncReport {
    let (matched_place_id, matched_distance_km) = match matched {
        Some((id, distance)) => (Some(id), Some(distance)),
        None => (None, None),
    };
    SyncReport {
        poi,
        outcome,
        matched_place_id,
        matched_distance_km,
    }
}
