use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, trace};

use crate::errors::{AppError, AppResult};
use crate::geo::{BoundingBox, Coordinate};
use crate::models::{Category, NewPoi, Poi};

const POI_COLUMNS: &str = "id, name, description, address, lat, lng, category, rating, \
     provider_place_id, provider_types, is_active, version, last_synced_at";

const NAME_MATCH_SCORE: u32 = 3;
const ADDRESS_MATCH_SCORE: u32 = 2;
const DESCRIPTION_MATCH_SCORE: u32 = 1;
const PHRASE_MATCH_BONUS: u32 = 5;

/// Provider link fields written by the sync service.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkUpdate {
    pub poi_id: String,
    pub provider_place_id: Option<String>,
    pub rating: f64,
    pub provider_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRollup {
    pub category: Category,
    pub count: u64,
    pub avg_rating: f64,
}

/// Persistence boundary for POIs. Every read excludes inactive rows.
#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Active POIs within `radius_meters` of `center`, nearest first.
    async fn find_nearby(
        &self,
        center: Coordinate,
        radius_meters: f64,
        limit: Option<usize>,
    ) -> AppResult<Vec<Poi>>;

    async fn find_by_category(&self, category: Category) -> AppResult<Vec<Poi>>;

    async fn search_text(&self, query: &str, limit: usize) -> AppResult<Vec<Poi>>;

    async fn get_poi(&self, id: &str) -> AppResult<Option<Poi>>;

    /// Writes the link only when the stored version still equals
    /// `expected_version`; a stale version yields `AppError::Conflict`.
    async fn update_provider_link(
        &self,
        update: &LinkUpdate,
        expected_version: i64,
    ) -> AppResult<Poi>;

    /// Unlinked active POIs, never-attempted first, then least recently
    /// attempted, then oldest.
    async fn list_unlinked(&self, limit: usize) -> AppResult<Vec<Poi>>;

    /// Stamps a sync attempt on the POI without touching its version.
    async fn record_sync_attempt(&self, poi_id: &str) -> AppResult<()>;

    async fn category_rollup(&self) -> AppResult<Vec<CategoryRollup>>;
}

#[derive(Clone)]
pub struct SqliteSpatialStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteSpatialStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn insert_poi(&self, poi: NewPoi) -> AppResult<Poi> {
        poi.validate()?;
        let id = generate_poi_id();
        let provider_place_id = poi
            .provider_place_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        {
            let conn = self.db.lock();
            conn.execute(
                "INSERT INTO pois (id, name, description, address, lat, lng, category, rating, provider_place_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    poi.name.trim(),
                    poi.description,
                    poi.address,
                    poi.location.latitude,
                    poi.location.longitude,
                    poi.category.as_str(),
                    poi.rating,
                    provider_place_id,
                ],
            )?;
        }
        debug!(target: "spatial_store", poi_id = %id, category = poi.category.as_str(), "inserted poi");
        self.load(&id, false)?
            .ok_or_else(|| AppError::NotFound(format!("poi {id}")))
    }

    pub fn set_active(&self, id: &str, active: bool) -> AppResult<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE pois
            SET is_active = ?2, version = version + 1, updated_at = DATETIME('now')
            WHERE id = ?1",
            params![id, active],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("poi {id}")));
        }
        Ok(())
    }

    fn load(&self, id: &str, active_only: bool) -> AppResult<Option<Poi>> {
        let conn = self.db.lock();
        let sql = if active_only {
            format!("SELECT {POI_COLUMNS} FROM pois WHERE id = ?1 AND is_active = 1")
        } else {
            format!("SELECT {POI_COLUMNS} FROM pois WHERE id = ?1")
        };
        conn.query_row(&sql, [id], map_poi_row)
            .optional()
            .map_err(AppError::from)
    }

    fn query_pois<P: rusqlite::Params>(&self, sql: &str, params: P) -> AppResult<Vec<Poi>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, map_poi_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl SpatialStore for SqliteSpatialStore {
    async fn find_nearby(
        &self,
        center: Coordinate,
        radius_meters: f64,
        limit: Option<usize>,
    ) -> AppResult<Vec<Poi>> {
        center.validate()?;
        if !radius_meters.is_finite() || radius_meters <= 0.0 {
            return Err(AppError::Validation(format!(
                "radius {radius_meters} must be a positive number of meters"
            )));
        }
        if limit == Some(0) {
            return Ok(Vec::new());
        }

        let radius_km = radius_meters / 1000.0;
        let bbox = BoundingBox::around(center, radius_km);
        let candidates = self.query_pois(
            &format!(
                "SELECT {POI_COLUMNS} FROM pois
                WHERE is_active = 1 AND lat BETWEEN ?1 AND ?2 AND lng BETWEEN ?3 AND ?4"
            ),
            params![bbox.min_lat, bbox.max_lat, bbox.min_lon, bbox.max_lon],
        )?;
        let scanned = candidates.len();

        let mut within = candidates
            .into_iter()
            .map(|poi| (center.distance_km(&poi.location), poi))
            .filter(|(distance, _)| *distance <= radius_km)
            .collect::<Vec<_>>();
        within.sort_by(|(a_dist, a), (b_dist, b)| {
            a_dist
                .partial_cmp(b_dist)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = limit {
            within.truncate(limit);
        }

        trace!(
            target: "spatial_store",
            scanned,
            matched = within.len(),
            radius_km,
            "radius query complete"
        );
        Ok(within.into_iter().map(|(_, poi)| poi).collect())
    }

    async fn find_by_category(&self, category: Category) -> AppResult<Vec<Poi>> {
        self.query_pois(
            &format!(
                "SELECT {POI_COLUMNS} FROM pois
                WHERE is_active = 1 AND category = ?1
                ORDER BY name ASC, id ASC"
            ),
            [category.as_str()],
        )
    }

    async fn search_text(&self, query: &str, limit: usize) -> AppResult<Vec<Poi>> {
        let phrase = query.trim().to_lowercase();
        let tokens = phrase.split_whitespace().collect::<Vec<_>>();
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(fts_query) = prefix_match_query(&tokens) else {
            return Ok(Vec::new());
        };

        let active = self.query_pois(
            &format!(
                "SELECT {POI_COLUMNS} FROM pois
                WHERE is_active = 1
                  AND rowid IN (SELECT rowid FROM pois_fts WHERE pois_fts MATCH ?1)"
            ),
            [&fts_query],
        )?;
        trace!(target: "spatial_store", candidates = active.len(), "text index matched");
        let mut scored = active
            .into_iter()
            .filter_map(|poi| {
                let score = relevance(&poi, &phrase, &tokens);
                (score > 0).then_some((score, poi))
            })
            .collect::<Vec<_>>();
        scored.sort_by(|(a_score, a), (b_score, b)| {
            b_score
                .cmp(a_score)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(_, poi)| poi).collect())
    }

    async fn get_poi(&self, id: &str) -> AppResult<Option<Poi>> {
        self.load(id, true)
    }

    async fn update_provider_link(
        &self,
        update: &LinkUpdate,
        expected_version: i64,
    ) -> AppResult<Poi> {
        let provider_types = if update.provider_types.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&update.provider_types)?)
        };
        let changed = {
            let conn = self.db.lock();
            conn.execute(
                "UPDATE pois
                SET provider_place_id = ?3,
                    rating = ?4,
                    provider_types = ?5,
                    version = version + 1,
                    updated_at = DATETIME('now'),
                    last_synced_at = ?6,
                    last_sync_attempt_at = ?6
                WHERE id = ?1 AND version = ?2 AND is_active = 1",
                params![
                    update.poi_id,
                    expected_version,
                    update.provider_place_id,
                    update.rating,
                    provider_types,
                    sortable_now(),
                ],
            )?
        };

        if changed == 0 {
            return match self.load(&update.poi_id, true)? {
                Some(current) => Err(AppError::Conflict(format!(
                    "poi {} is at version {}, expected {}",
                    update.poi_id, current.version, expected_version
                ))),
                None => Err(AppError::NotFound(format!("poi {}", update.poi_id))),
            };
        }

        self.load(&update.poi_id, true)?
            .ok_or_else(|| AppError::NotFound(format!("poi {}", update.poi_id)))
    }

    async fn list_unlinked(&self, limit: usize) -> AppResult<Vec<Poi>> {
        self.query_pois(
            &format!(
                "SELECT {POI_COLUMNS} FROM pois
                WHERE is_active = 1
                  AND (provider_place_id IS NULL OR TRIM(provider_place_id) = '')
                ORDER BY last_sync_attempt_at IS NOT NULL,
                         last_sync_attempt_at ASC,
                         created_at ASC,
                         id ASC
                LIMIT ?1"
            ),
            [limit as i64],
        )
    }

    async fn record_sync_attempt(&self, poi_id: &str) -> AppResult<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE pois SET last_sync_attempt_at = ?2 WHERE id = ?1 AND is_active = 1",
            params![poi_id, sortable_now()],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("poi {poi_id}")));
        }
        Ok(())
    }

    async fn category_rollup(&self) -> AppResult<Vec<CategoryRollup>> {
        let rows = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(
                "SELECT category, COUNT(*), AVG(rating)
                FROM pois
                WHERE is_active = 1
                GROUP BY category",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let category: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    let avg: Option<f64> = row.get(2)?;
                    Ok((category, count, avg.unwrap_or(0.0)))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        // Unknown stored labels collapse into OTHER, so merge by category.
        let mut rollups: Vec<CategoryRollup> = Vec::with_capacity(rows.len());
        for (label, count, avg) in rows {
            let category = Category::from_stored(&label);
            let count = count.max(0) as u64;
            match rollups.iter_mut().find(|entry| entry.category == category) {
                Some(entry) => {
                    let total = entry.count + count;
                    if total > 0 {
                        entry.avg_rating = (entry.avg_rating * entry.count as f64
                            + avg * count as f64)
                            / total as f64;
                    }
                    entry.count = total;
                }
                None => rollups.push(CategoryRollup {
                    category,
                    count,
                    avg_rating: avg,
                }),
            }
        }
        Ok(rollups)
    }
}

fn relevance(poi: &Poi, phrase: &str, tokens: &[&str]) -> u32 {
    let name = poi.name.to_lowercase();
    let address = poi.address.as_deref().unwrap_or_default().to_lowercase();
    let description = poi.description.to_lowercase();

    let mut score = 0;
    for token in tokens {
        if name.contains(token) {
            score += NAME_MATCH_SCORE;
        }
        if address.contains(token) {
            score += ADDRESS_MATCH_SCORE;
        }
        if description.contains(token) {
            score += DESCRIPTION_MATCH_SCORE;
        }
    }
    if score > 0 && name.contains(phrase) {
        score += PHRASE_MATCH_BONUS;
    }
    score
}

/// FTS5 expression matching any word that starts with one of `tokens`.
/// Tokens without letters or digits are skipped.
fn prefix_match_query(tokens: &[&str]) -> Option<String> {
    let terms = tokens
        .iter()
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect::<Vec<_>>();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

/// UTC timestamp with fixed-width microseconds, so text order is time order.
fn sortable_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn generate_poi_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("poi_{suffix}")
}

fn map_poi_row(row: &Row<'_>) -> rusqlite::Result<Poi> {
    let category: String = row.get(6)?;
    let provider_types: Option<String> = row.get(9)?;
    let last_synced_at: Option<String> = row.get(12)?;
    Ok(Poi {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        address: row.get(3)?,
        location: Coordinate {
            latitude: row.get(4)?,
            longitude: row.get(5)?,
        },
        category: Category::from_stored(&category),
        rating: row.get(7)?,
        provider_place_id: row.get(8)?,
        provider_types: parse_types(provider_types),
        is_active: row.get(10)?,
        version: row.get(11)?,
        last_synced_at: last_synced_at.as_deref().and_then(parse_timestamp),
    })
}

fn parse_types(value: Option<String>) -> Vec<String> {
    value
        .and_then(|text| serde_json::from_str::<Vec<String>>(&text).ok())
        .unwrap_or_default()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .ok()
}
