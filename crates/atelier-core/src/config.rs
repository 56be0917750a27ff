//! Pipeline configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! feature = "asset-extraction"
//! credits_per_output = 1
//! max_part_concurrency = 3
//!
//! [generation]
//! models = ["image-pro", "image-flash"]
//! endpoint = "https://generativelanguage.googleapis.com/v1beta"
//! ```

use crate::error::ConfigError;
use atelier_asset::Feature;
use atelier_gen::{GenerationMode, MAX_PART_CONCURRENCY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Generation endpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Candidate models, in fallback order
    pub models: Vec<String>,
    /// Base URL of the endpoint
    pub endpoint: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            models: vec![
                "gemini-2.5-flash-image".to_string(),
                "gemini-2.0-flash-preview-image-generation".to_string(),
            ],
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key_env: "ATELIER_API_KEY".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Feature the pipeline serves
    pub feature: Feature,
    /// Credits charged per produced output
    pub credits_per_output: u64,
    /// Concurrent calls for the parts of one multi-part item
    pub max_part_concurrency: usize,
    /// Accept a multi-part item when only some parts were produced
    pub accept_partial_outputs: bool,
    /// Lifetime of issued access URLs
    pub access_url_ttl_secs: u64,
    /// Interval of the proactive URL refresh
    pub url_refresh_interval_secs: u64,
    /// URLs this close to expiry are treated as stale
    pub url_refresh_margin_secs: u64,
    /// Memory budget of the local cache
    pub local_cache_capacity_bytes: u64,
    /// On-disk tier of the local cache
    pub local_cache_dir: Option<PathBuf>,
    /// Halt the pass when every backend is unreachable
    pub halt_on_outage: bool,
    /// Generation endpoint
    pub generation: GenerationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feature: Feature::AssetExtraction,
            credits_per_output: 1,
            max_part_concurrency: 3,
            accept_partial_outputs: true,
            access_url_ttl_secs: 3600,
            url_refresh_interval_secs: 300,
            url_refresh_margin_secs: 60,
            local_cache_capacity_bytes: 256 * 1024 * 1024,
            local_cache_dir: None,
            halt_on_outage: false,
            generation: GenerationConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns `ConfigError` for malformed TOML or out-of-range values
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or is invalid
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credits_per_output == 0 {
            return Err(ConfigError::Invalid {
                field: "credits_per_output",
                reason: "must be at least 1".into(),
            });
        }
        if self.access_url_ttl_secs <= self.url_refresh_margin_secs {
            return Err(ConfigError::Invalid {
                field: "access_url_ttl_secs",
                reason: format!(
                    "must exceed url_refresh_margin_secs ({})",
                    self.url_refresh_margin_secs
                ),
            });
        }
        if self.url_refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "url_refresh_interval_secs",
                reason: "must be positive".into(),
            });
        }
        if self.generation.models.is_empty() {
            return Err(ConfigError::Invalid {
                field: "generation.models",
                reason: "at least one model is required".into(),
            });
        }
        Ok(())
    }

    /// Part concurrency clamped to `1..=MAX_PART_CONCURRENCY`
    #[inline]
    #[must_use]
    pub fn part_concurrency(&self) -> usize {
        self.max_part_concurrency.clamp(1, MAX_PART_CONCURRENCY)
    }

    /// Refresh interval as a duration
    #[inline]
    #[must_use]
    pub fn url_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.url_refresh_interval_secs)
    }

    /// Default batch mode for the configured feature
    #[must_use]
    pub fn default_mode(&self) -> GenerationMode {
        match self.feature {
            Feature::AssetExtraction => GenerationMode::extraction(),
            Feature::CatalogForge => GenerationMode::catalog(1),
        }
    }

    /// With feature
    #[inline]
    #[must_use]
    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.feature = feature;
        self
    }

    /// With credits per output
    #[inline]
    #[must_use]
    pub fn with_credits_per_output(mut self, credits: u64) -> Self {
        self.credits_per_output = credits;
        self
    }

    /// With part concurrency
    #[inline]
    #[must_use]
    pub fn with_part_concurrency(mut self, n: usize) -> Self {
        self.max_part_concurrency = n;
        self
    }

    /// With partial-output acceptance
    #[inline]
    #[must_use]
    pub fn with_accept_partial_outputs(mut self, accept: bool) -> Self {
        self.accept_partial_outputs = accept;
        self
    }

    /// With halt-on-outage
    #[inline]
    #[must_use]
    pub fn with_halt_on_outage(mut self, halt: bool) -> Self {
        self.halt_on_outage = halt;
        self
    }

    /// With access URL lifetime and staleness margin
    #[inline]
    #[must_use]
    pub fn with_url_ttl(mut self, ttl_secs: u64, margin_secs: u64) -> Self {
        self.access_url_ttl_secs = ttl_secs;
        self.url_refresh_margin_secs = margin_secs;
        self
    }

    /// With local cache spill directory
    #[inline]
    #[must_use]
    pub fn with_local_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_cache_dir = Some(dir.into());
        self
    }
}
