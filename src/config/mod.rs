/// Application configuration module
use crate::errors::{ApiError, ApiResult};
use crate::timeindex::{DEFAULT_RECENT_WINDOW_DAYS, MAX_RECENT_WINDOW_DAYS};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub cache_db_path: PathBuf,
    pub cdn_base_url: String,
    /// S3-compatible endpoint override; AWS itself when unset
    pub archive_endpoint_url: Option<String>,
    pub render_command: Option<String>,
    pub http_timeout: Duration,
    pub listen_addr: String,
    pub reconcile: ReconcileSettings,
}

/// Tunables handed to the reconciler at construction
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileSettings {
    pub recent_window_days: i64,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            recent_window_days: DEFAULT_RECENT_WINDOW_DAYS,
            max_concurrency: 5,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl ReconcileSettings {
    pub fn validate(&self) -> ApiResult<()> {
        if self.max_concurrency == 0 {
            return Err(ApiError::Config("MAX_CONCURRENCY must be at least 1".to_string()));
        }
        if !(0..=MAX_RECENT_WINDOW_DAYS).contains(&self.recent_window_days) {
            return Err(ApiError::Config(format!(
                "RECENT_WINDOW_DAYS must be between 0 and {}",
                MAX_RECENT_WINDOW_DAYS
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> ApiResult<Self> {
        dotenvy::dotenv().ok();

        let cache_db_path = env::var("CACHE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/reconcile_cache.db"));

        let cdn_base_url = env::var("CDN_BASE_URL")
            .unwrap_or_else(|_| "https://cdn.star.nesdis.noaa.gov".to_string());

        let archive_endpoint_url = env::var("ARCHIVE_ENDPOINT_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let render_command = env::var("RENDER_COMMAND")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let defaults = ReconcileSettings::default();
        let reconcile = ReconcileSettings {
            recent_window_days: env_parse("RECENT_WINDOW_DAYS", defaults.recent_window_days),
            max_concurrency: env_parse("MAX_CONCURRENCY", defaults.max_concurrency),
            max_retries: env_parse("FETCH_MAX_RETRIES", defaults.max_retries),
            retry_backoff: Duration::from_millis(env_parse("FETCH_RETRY_BACKOFF_MS", 500u64)),
        };
        reconcile.validate()?;

        Ok(Self {
            cache_db_path,
            cdn_base_url,
            archive_endpoint_url,
            render_command,
            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECONDS", 30u64)),
            listen_addr,
            reconcile,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = ReconcileSettings::default();
        assert_eq!(settings.recent_window_days, 7);
        assert_eq!(settings.max_concurrency, 5);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let settings = ReconcileSettings {
            max_concurrency: 0,
            ..ReconcileSettings::default()
        };
        assert!(matches!(settings.validate(), Err(ApiError::Config(_))));
    }

    #[test]
    fn test_window_out_of_bounds_rejected() {
        for days in [-1, MAX_RECENT_WINDOW_DAYS + 1, i64::MAX] {
            let settings = ReconcileSettings {
                recent_window_days: days,
                ..ReconcileSettings::default()
            };
            assert!(matches!(settings.validate(), Err(ApiError::Config(_))), "{}", days);
        }
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        assert_eq!(env_parse("GOES_RECONCILE_TEST_UNSET_KEY", 42u32), 42);
    }
}
