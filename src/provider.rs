use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::SecretString;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppResult, ProviderError};
use crate::geo::Coordinate;
use crate::google::GooglePlacesClient;
use crate::models::{ProviderPlace, ProviderPlaceDetails};

const BASE_BACKOFF_MS: u64 = 250;

/// External map/places data source.
#[async_trait]
pub trait MapProvider: Send + Sync {
    async fn geocode(&self, address: &str) -> AppResult<Coordinate>;

    async fn reverse_geocode(&self, coordinate: Coordinate) -> AppResult<String>;

    async fn find_nearby_places(
        &self,
        center: Coordinate,
        radius_meters: f64,
        type_hint: Option<&str>,
    ) -> AppResult<Vec<ProviderPlace>>;

    async fn place_details(&self, place_id: &str) -> AppResult<ProviderPlaceDetails>;
}

/// Rate-limited front for whichever provider the deployment is configured
/// with. Transient failures are retried only when more than one attempt is
/// configured.
#[derive(Clone)]
pub struct PlacesService {
    inner: Arc<dyn MapProvider>,
    rate_limiter: Arc<RateLimiter>,
    jitter_rng: Arc<Mutex<StdRng>>,
    max_attempts: u32,
}

impl PlacesService {
    pub fn new(config: &AppConfig, api_key: Option<SecretString>) -> AppResult<Self> {
        let inner: Arc<dyn MapProvider> = match api_key {
            Some(key) => Arc::new(GooglePlacesClient::new(config, key)?),
            None => {
                warn!(
                    target: "places_service",
                    "no places api key configured; external recommendations are disabled"
                );
                Arc::new(UnconfiguredProvider)
            }
        };
        Ok(Self::with_policy(
            inner,
            config.places_rate_limit_qps,
            config.provider_max_attempts,
        ))
    }

    pub fn from_provider(provider: Arc<dyn MapProvider>) -> Self {
        Self::with_policy(provider, 3, 1)
    }

    pub fn with_policy(provider: Arc<dyn MapProvider>, qps: u32, max_attempts: u32) -> Self {
        Self {
            inner: provider,
            rate_limiter: Arc::new(RateLimiter::new(qps.max(1))),
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn set_rate_limit(&self, qps: u32) {
        self.rate_limiter.set_qps(qps.max(1));
    }

    pub fn rate_limit_qps(&self) -> u32 {
        self.rate_limiter.qps()
    }

    async fn call_with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> AppResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = AppResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.wait().await;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && err.is_transient_provider_failure() => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "places_service",
                        ?err,
                        operation,
                        attempt,
                        "provider call failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    debug!(target: "places_service", %err, operation, attempt, "provider call failed");
                    return Err(err);
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..BASE_BACKOFF_MS))
        };
        base + jitter
    }
}

#[async_trait]
impl MapProvider for PlacesService {
    async fn geocode(&self, address: &str) -> AppResult<Coordinate> {
        self.call_with_retry("geocode", || self.inner.geocode(address))
            .await
    }

    async fn reverse_geocode(&self, coordinate: Coordinate) -> AppResult<String> {
        self.call_with_retry("reverse_geocode", || self.inner.reverse_geocode(coordinate))
            .await
    }

    async fn find_nearby_places(
        &self,
        center: Coordinate,
        radius_meters: f64,
        type_hint: Option<&str>,
    ) -> AppResult<Vec<ProviderPlace>> {
        self.call_with_retry("find_nearby_places", || {
            self.inner.find_nearby_places(center, radius_meters, type_hint)
        })
        .await
    }

    async fn place_details(&self, place_id: &str) -> AppResult<ProviderPlaceDetails> {
        self.call_with_retry("place_details", || self.inner.place_details(place_id))
            .await
    }
}

/// Stand-in used when no API key is available; every call fails.
pub struct UnconfiguredProvider;

#[async_trait]
impl MapProvider for UnconfiguredProvider {
    async fn geocode(&self, _address: &str) -> AppResult<Coordinate> {
        Err(ProviderError::NotConfigured.into())
    }

    async fn reverse_geocode(&self, _coordinate: Coordinate) -> AppResult<String> {
        Err(ProviderError::NotConfigured.into())
    }

    async fn find_nearby_places(
        &self,
        _center: Coordinate,
        _radius_meters: f64,
        _type_hint: Option<&str>,
    ) -> AppResult<Vec<ProviderPlace>> {
        Err(ProviderError::NotConfigured.into())
    }

    async fn place_details(&self, _place_id: &str) -> AppResult<ProviderPlaceDetails> {
        Err(ProviderError::NotConfigured.into())
    }
}

struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn set_qps(&self, qps: u32) {
        self.min_interval_ms
            .store(Self::interval_ms(qps), Ordering::SeqCst);
    }

    fn qps(&self) -> u32 {
        let interval = self.min_interval_ms.load(Ordering::SeqCst).max(1);
        ((1000_f64 / interval as f64).round() as u32).max(1)
    }

    fn interval_ms(qps: u32) -> u64 {
        let interval_ms = (1000_f64 / qps.max(1) as f64).ceil() as u64;
        interval_ms.max(50)
    }

    async fn wait(&self) {
        let interval = Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst));
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{place, MockProvider};
    use super::*;
    use crate::errors::AppError;

    fn center() -> Coordinate {
        Coordinate::new(39.7125, 47.2357).unwrap()
    }

    #[tokio::test]
    async fn single_attempt_policy_surfaces_first_failure() {
        let mock = Arc::new(MockProvider::with_nearby(vec![place(
            "p1", "Park", 39.71, 47.23, &["park"],
        )]));
        mock.fail_next_nearby(ProviderError::Status(503));
        let service = PlacesService::with_policy(mock.clone(), 1000, 1);

        let result = service.find_nearby_places(center(), 1000.0, None).await;
        assert!(matches!(
            result,
            Err(AppError::Provider(ProviderError::Status(503)))
        ));
        assert_eq!(mock.nearby_calls(), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_when_enabled() {
        let mock = Arc::new(MockProvider::with_nearby(vec![place(
            "p1", "Park", 39.71, 47.23, &["park"],
        )]));
        mock.fail_next_nearby(ProviderError::RateLimited);
        let service = PlacesService::with_policy(mock.clone(), 1000, 3);
        *service.jitter_rng.lock() = StdRng::seed_from_u64(7);

        let places = service
            .find_nearby_places(center(), 1000.0, Some("tourist_attraction"))
            .await
            .unwrap();
        assert_eq!(places.len(), 1);
        assert_eq!(mock.nearby_calls(), 2);
        assert_eq!(
            mock.last_type_hint.lock().as_deref(),
            Some("tourist_attraction")
        );
    }

    #[tokio::test]
    async fn does_not_retry_permanent_failures() {
        let mock = Arc::new(MockProvider::default());
        mock.fail_next_nearby(ProviderError::Unauthorized("REQUEST_DENIED".into()));
        let service = PlacesService::with_policy(mock.clone(), 1000, 3);

        let result = service.find_nearby_places(center(), 500.0, None).await;
        assert!(matches!(
            result,
            Err(AppError::Provider(ProviderError::Unauthorized(_)))
        ));
        assert_eq!(mock.nearby_calls(), 1);
    }

    #[tokio::test]
    async fn missing_key_yields_unconfigured_provider() {
        let service = PlacesService::new(&AppConfig::default(), None).unwrap();
        let result = service.geocode("Ростов-на-Дону").await;
        assert!(matches!(
            result,
            Err(AppError::Provider(ProviderError::NotConfigured))
        ));
    }

    #[test]
    fn rate_limit_is_adjustable() {
        let service = PlacesService::from_provider(Arc::new(MockProvider::default()));
        assert_eq!(service.rate_limit_qps(), 3);
        service.set_rate_limit(10);
        assert_eq!(service.rate_limit_qps(), 10);
        service.set_rate_limit(0);
        assert_eq!(service.rate_limit_qps(), 1);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let service = PlacesService::from_provider(Arc::new(MockProvider::default()));
        let first = service.backoff_delay(1);
        let third = service.backoff_delay(3);
        assert!(first >= Duration::from_millis(BASE_BACKOFF_MS));
        assert!(first < Duration::from_millis(2 * BASE_BACKOFF_MS));
        assert!(third >= Duration::from_millis(4 * BASE_BACKOFF_MS));
    }
}
