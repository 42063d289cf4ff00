mod classifier;
mod config;
mod db;
mod errors;
mod geo;
mod google;
mod models;
mod provider;
mod recommend;
mod secrets;
mod stats;
mod store;
mod sync;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::classifier::{classify, classify_token, CATEGORY_RULES};
pub use crate::config::{AppConfig, PublicAppConfig, SecretBackendKind};
pub use crate::db::{bootstrap, DatabaseBootstrap, DatabaseContext, DB_KEY_ALIAS};
pub use crate::errors::{AppError, AppResult, ProviderError};
pub use crate::geo::{
    degrees_to_radians, haversine_distance_km, radians_to_degrees, BoundingBox, Coordinate,
    EARTH_RADIUS_KM,
};
pub use crate::google::GooglePlacesClient;
pub use crate::models::{
    clamp_rating, Category, NewPoi, Poi, PoiOrigin, ProviderPlace, ProviderPlaceDetails,
    RecommendationResult, RecommendedPoi, MAX_RATING,
};
pub use crate::provider::{MapProvider, PlacesService, UnconfiguredProvider};
pub use crate::recommend::RecommendationEngine;
pub use crate::secrets::{SecretLifecycle, SecretMaterial, SecretVault, PLACES_KEY_ALIAS};
pub use crate::stats::{summarize, CategoryStats, MapStats, StatsAggregator};
pub use crate::store::{CategoryRollup, LinkUpdate, SpatialStore, SqliteSpatialStore};
pub use crate::sync::{
    SyncBatchStats, SyncOutcome, SyncReport, SyncService, MATCH_THRESHOLD_KM,
    SYNC_SEARCH_RADIUS_METERS,
};
pub use crate::telemetry::{TelemetryClient, TelemetryEvent};

const VAULT_SERVICE_NAME: &str = "PoiAggregator";

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub db_path: String,
    pub telemetry_buffer_path: String,
    pub telemetry_queue_depth: usize,
    pub has_encryption_key: bool,
    pub config: PublicAppConfig,
    pub db_bootstrap_recovered: bool,
    pub db_key_lifecycle: String,
}

/// Wired-up engine: encrypted store, provider, recommendation, sync and
/// stats services sharing one database connection.
pub struct PoiServices {
    db_path: PathBuf,
    vault: SecretVault,
    config: AppConfig,
    telemetry: TelemetryClient,
    store: SqliteSpatialStore,
    provider: PlacesService,
    engine: RecommendationEngine,
    sync: SyncService,
    stats: StatsAggregator,
    db_bootstrap_recovered: bool,
    db_key_lifecycle: SecretLifecycle,
}

impl PoiServices {
    /// Reads configuration from the environment and opens the store under
    /// `data_dir`.
    pub fn initialize<P: AsRef<Path>>(data_dir: P) -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        let vault = SecretVault::for_backend(VAULT_SERVICE_NAME, config.secret_backend);
        Self::initialize_with(data_dir, config, vault)
    }

    pub fn initialize_with<P: AsRef<Path>>(
        data_dir: P,
        config: AppConfig,
        vault: SecretVault,
    ) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            key_lifecycle,
            recovered,
        } = bootstrap(data_dir, &config.database_file_name, &vault)?;
        let telemetry = TelemetryClient::new(data_dir, &config)?;

        telemetry.record_quietly(
            "vault_audit",
            json!({
                "account": DB_KEY_ALIAS,
                "lifecycle": key_lifecycle.as_str(),
                "recovered": recovered,
            }),
        );
        telemetry.record_quietly(
            "service_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "provider_configured": config.places_api_key.is_some(),
            }),
        );
        if let Err(err) = telemetry.flush() {
            warn!(?err, "failed to flush telemetry queue");
        }

        let api_key = vault.resolve_places_key(config.places_api_key.as_ref())?;
        let provider = PlacesService::new(&config, api_key)?;
        let store = SqliteSpatialStore::new(Arc::new(Mutex::new(connection)));

        let shared_store: Arc<dyn SpatialStore> = Arc::new(store.clone());
        let shared_provider: Arc<dyn MapProvider> = Arc::new(provider.clone());
        let engine = RecommendationEngine::new(
            Arc::clone(&shared_store),
            Arc::clone(&shared_provider),
            config.recommendation_type_hint.clone(),
        );
        let sync = SyncService::new(Arc::clone(&shared_store), shared_provider)
            .with_telemetry(telemetry.clone());
        let stats = StatsAggregator::new(shared_store);

        info!(
            target: "poi_services",
            path = %path.display(),
            recovered,
            "poi services initialized"
        );

        Ok(Self {
            db_path: path,
            vault,
            config,
            telemetry,
            store,
            provider,
            engine,
            sync,
            stats,
            db_bootstrap_recovered: recovered,
            db_key_lifecycle: key_lifecycle,
        })
    }

    pub fn store(&self) -> &SqliteSpatialStore {
        &self.store
    }

    pub fn provider(&self) -> &PlacesService {
        &self.provider
    }

    pub fn engine(&self) -> &RecommendationEngine {
        &self.engine
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryClient {
        &self.telemetry
    }

    pub fn health(&self) -> AppResult<ServiceHealth> {
        Ok(ServiceHealth {
            db_path: self.db_path.to_string_lossy().to_string(),
            telemetry_buffer_path: self.telemetry.buffer_path().to_string_lossy().to_string(),
            telemetry_queue_depth: self.telemetry.queue_depth(),
            has_encryption_key: self.vault.has(DB_KEY_ALIAS)?,
            config: self.config.public_profile(),
            db_bootstrap_recovered: self.db_bootstrap_recovered,
            db_key_lifecycle: self.db_key_lifecycle.as_str().to_string(),
        })
    }
}

/// Installs the global `tracing` subscriber once; later calls are no-ops.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,poi_aggregator=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
