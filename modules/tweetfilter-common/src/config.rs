use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

/// TOML-backed settings. Every section and field is optional.
/// The API key stays in the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub model: ModelConfig,
    pub rating: RatingConfig,
    pub timing: TimingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelConfig {
    pub id: String,
    pub image_model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    pub provider_sort: Option<String>,
    /// The rating model accepts image parts directly.
    pub supports_images: bool,
    pub web_search: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: "google/gemini-flash-1.5-8b".to_string(),
            image_model: "google/gemini-flash-1.5-8b".to_string(),
            temperature: 0.5,
            top_p: 0.9,
            max_tokens: None,
            provider_sort: None,
            supports_images: false,
            web_search: false,
        }
    }
}

impl ModelConfig {
    /// Model id as sent on the wire, with the web-search suffix if enabled.
    pub fn effective_model(&self) -> String {
        if self.web_search {
            format!("{}:online", self.id)
        } else {
            self.id.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RatingConfig {
    pub auto_rate: bool,
    pub streaming: bool,
    pub describe_images: bool,
    pub blacklisted_handles: Vec<String>,
    pub instructions: String,
    pub max_thread_depth: usize,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            auto_rate: true,
            streaming: true,
            describe_images: false,
            blacklisted_handles: Vec::new(),
            instructions: [
                "- Give high scores to insightful and impactful tweets",
                "- Give low scores to clickbait, fearmongering, and ragebait",
                "- Give high scores to high-effort content and artistic content",
            ]
            .join("\n"),
            max_thread_depth: 10,
        }
    }
}

impl RatingConfig {
    pub fn is_blacklisted(&self, handle: &str) -> bool {
        let handle = handle.trim_start_matches('@');
        self.blacklisted_handles
            .iter()
            .any(|h| h.trim().trim_start_matches('@').eq_ignore_ascii_case(handle))
    }

    /// Whether media content matters to the request at all.
    pub fn needs_media(&self, model_supports_images: bool) -> bool {
        self.describe_images || model_supports_images
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimingConfig {
    pub processing_delay_ms: u64,
    pub api_call_spacing_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub request_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub mapping_timeout_ms: u64,
    pub mapping_cooldown_ms: u64,
    pub sweep_interval_ms: u64,
    pub cache_flush_ms: u64,
    pub stuck_after_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            processing_delay_ms: 100,
            api_call_spacing_ms: 250,
            max_retries: 3,
            backoff_base_ms: 1000,
            request_timeout_ms: 30_000,
            stream_timeout_ms: 90_000,
            inactivity_timeout_ms: 30_000,
            mapping_timeout_ms: 5_000,
            mapping_cooldown_ms: 10_000,
            sweep_interval_ms: 2_000,
            cache_flush_ms: 1_500,
            stuck_after_ms: 60_000,
        }
    }
}

impl TimingConfig {
    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    pub fn api_call_spacing(&self) -> Duration {
        Duration::from_millis(self.api_call_spacing_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn mapping_timeout(&self) -> Duration {
        Duration::from_millis(self.mapping_timeout_ms)
    }

    pub fn mapping_cooldown(&self) -> Duration {
        Duration::from_millis(self.mapping_cooldown_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn cache_flush(&self) -> Duration {
        Duration::from_millis(self.cache_flush_ms)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_millis(self.stuck_after_ms)
    }

    /// Delay before attempt `attempt + 1`: attempt² × base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(attempt).saturating_mul(u64::from(attempt));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }

    /// Check that the timeouts nest. Each guard must fire inside the one that
    /// encloses it: the inactivity window inside a stream's overall deadline.
    /// Mapping has its own timeout and never waits on a rating call, and an
    /// item mid-attempt is never swept, so those windows are independent of
    /// the request timeouts and of the retry backoff.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            bail!("timing.max_retries must be at least 1");
        }
        for (name, ms) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("stream_timeout_ms", self.stream_timeout_ms),
            ("inactivity_timeout_ms", self.inactivity_timeout_ms),
            ("mapping_timeout_ms", self.mapping_timeout_ms),
        ] {
            if ms == 0 {
                bail!("timing.{name} must be greater than zero");
            }
        }
        if self.inactivity_timeout_ms > self.stream_timeout_ms {
            bail!(
                "timing.inactivity_timeout_ms ({}) must not exceed timing.stream_timeout_ms ({})",
                self.inactivity_timeout_ms,
                self.stream_timeout_ms
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tweetfilter-store.json"),
        }
    }
}

/// Effective configuration: file settings plus secrets from the environment.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: ModelConfig,
    pub rating: RatingConfig,
    pub timing: TimingConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load from an optional TOML file, then read `OPENROUTER_API_KEY`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };
        file.timing.validate()?;

        let api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        Ok(Self::from_file_config(file, api_key))
    }

    pub fn from_file_config(file: FileConfig, api_key: Option<String>) -> Self {
        Self {
            api_key,
            model: file.model,
            rating: file.rating,
            timing: file.timing,
            storage: file.storage,
        }
    }

    pub fn log_summary(&self) {
        info!(
            model = %self.model.effective_model(),
            api_key_set = self.api_key.is_some(),
            auto_rate = self.rating.auto_rate,
            streaming = self.rating.streaming,
            describe_images = self.rating.describe_images,
            blacklisted = self.rating.blacklisted_handles.len(),
            store = %self.storage.path.display(),
            "Configuration loaded"
        );
    }
}

/// Load and parse a TOML config file.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}
