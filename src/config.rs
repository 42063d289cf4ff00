use std::str::FromStr;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_PLACES_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_GEOCODE_API_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_TYPE_HINT: &str = "tourist_attraction";
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackendKind {
    Keyring,
    Memory,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub places_api_key: Option<SecretString>,
    pub places_api_base: String,
    pub geocode_api_url: String,
    pub provider_language: String,
    pub provider_timeout_secs: u64,
    pub provider_max_attempts: u32,
    pub places_rate_limit_qps: u32,
    pub recommendation_type_hint: String,
    pub database_file_name: String,
    pub secret_backend: SecretBackendKind,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub places_api_base: String,
    pub geocode_api_url: String,
    pub provider_language: String,
    pub provider_timeout_secs: u64,
    pub provider_max_attempts: u32,
    pub places_rate_limit_qps: u32,
    pub recommendation_type_hint: String,
    pub database_file_name: String,
    pub secret_backend: SecretBackendKind,
    pub telemetry_enabled_by_default: bool,
    pub has_places_api_key: bool,
}

impl AppConfig {
    /// Environment overrides on top of [`AppConfig::default`]. Unparseable
    /// values fall back to the default; counts are floored at one.
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let base = Self::default();
        Self {
            places_api_key: env_text("GOOGLE_PLACES_API_KEY").map(|v| SecretString::new(v.into())),
            places_api_base: env_text("PLACES_API_BASE").unwrap_or(base.places_api_base),
            geocode_api_url: env_text("GEOCODE_API_URL").unwrap_or(base.geocode_api_url),
            provider_language: env_text("PROVIDER_LANGUAGE").unwrap_or(base.provider_language),
            provider_timeout_secs: env_parsed("PROVIDER_TIMEOUT_SECS", base.provider_timeout_secs)
                .max(1),
            provider_max_attempts: env_parsed("PROVIDER_MAX_ATTEMPTS", base.provider_max_attempts)
                .max(1),
            places_rate_limit_qps: env_parsed("PLACES_RATE_LIMIT_QPS", base.places_rate_limit_qps)
                .max(1),
            recommendation_type_hint: env_text("RECOMMENDATION_TYPE_HINT")
                .unwrap_or(base.recommendation_type_hint),
            database_file_name: env_text("DATABASE_FILE_NAME").unwrap_or(base.database_file_name),
            secret_backend: env_text("SECRET_BACKEND")
                .and_then(|value| SecretBackendKind::from_label(&value))
                .unwrap_or(base.secret_backend),
            telemetry_enabled_by_default: env_flag("TELEMETRY_ENABLED")
                .unwrap_or(base.telemetry_enabled_by_default),
            telemetry_batch_size: env_parsed("TELEMETRY_BATCH_SIZE", base.telemetry_batch_size)
                .max(1),
            telemetry_buffer_max_bytes: env_parsed(
                "TELEMETRY_BUFFER_MAX_BYTES",
                base.telemetry_buffer_max_bytes,
            ),
            telemetry_buffer_max_files: env_parsed(
                "TELEMETRY_BUFFER_MAX_FILES",
                base.telemetry_buffer_max_files,
            )
            .max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            places_api_base: self.places_api_base.clone(),
            geocode_api_url: self.geocode_api_url.clone(),
            provider_language: self.provider_language.clone(),
            provider_timeout_secs: self.provider_timeout_secs,
            provider_max_attempts: self.provider_max_attempts,
            places_rate_limit_qps: self.places_rate_limit_qps,
            recommendation_type_hint: self.recommendation_type_hint.clone(),
            database_file_name: self.database_file_name.clone(),
            secret_backend: self.secret_backend,
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
            has_places_api_key: self.places_api_key.is_some(),
        }
    }
}

impl SecretBackendKind {
    fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "keyring" => Some(Self::Keyring),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            places_api_key: None,
            places_api_base: DEFAULT_PLACES_API_BASE.to_string(),
            geocode_api_url: DEFAULT_GEOCODE_API_URL.to_string(),
            provider_language: "ru".to_string(),
            provider_timeout_secs: 10,
            provider_max_attempts: 1,
            places_rate_limit_qps: 3,
            recommendation_type_hint: DEFAULT_TYPE_HINT.to_string(),
            database_file_name: "poi-aggregator.db".to_string(),
            secret_backend: SecretBackendKind::Keyring,
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            telemetry_buffer_max_files: DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !cfg!(debug_assertions) && env_flag("ALLOW_DOTENV") != Some(true) {
        debug!("release build without ALLOW_DOTENV, .env ignored");
        return;
    }
    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), ".env loaded"),
        Err(dotenvy::Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!(?err, ".env present but unreadable"),
    }
}

/// Trimmed, non-empty value of `key`.
fn env_text(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    env_text(key).map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    env_text(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GOOGLE_PLACES_API_KEY", "secret");
        env::set_var("DATABASE_FILE_NAME", "custom.db");
        env::set_var("PROVIDER_MAX_ATTEMPTS", "0");
        env::set_var("SECRET_BACKEND", "Memory");
        env::set_var("TELEMETRY_ENABLED", "false");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_file_name, "custom.db");
        assert_eq!(public.provider_max_attempts, 1);
        assert_eq!(public.secret_backend, SecretBackendKind::Memory);
        assert!(!public.telemetry_enabled_by_default);
        assert!(public.has_places_api_key);
        assert!(config.places_api_key.is_some());
        assert_eq!(public.recommendation_type_hint, DEFAULT_TYPE_HINT);

        let json = serde_json::to_string(&public).unwrap();
        assert!(!json.contains(":\"secret\""));
    }

    #[test]
    fn default_config_keeps_single_attempt_policy() {
        let config = AppConfig::default();
        assert_eq!(config.provider_max_attempts, 1);
        assert!(config.places_api_key.is_none());
        assert_eq!(config.places_rate_limit_qps, 3);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        env::set_var("POI_TEST_UNPARSEABLE", "twelve");
        env::set_var("POI_TEST_PADDED", "  7 ");
        assert_eq!(env_parsed("POI_TEST_UNPARSEABLE", 25_usize), 25);
        assert_eq!(env_parsed("POI_TEST_PADDED", 25_usize), 7);
        assert_eq!(SecretBackendKind::from_label("KEYRING"), Some(SecretBackendKind::Keyring));
        assert_eq!(SecretBackendKind::from_label("vault"), None);
    }
}
