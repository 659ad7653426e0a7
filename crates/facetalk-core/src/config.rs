//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level facetalk configuration, loaded from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub animation: Option<AnimationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatars: Option<AvatarsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<JobsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Maximum number of live sessions (default: 1000).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Server-side WebSocket ping interval in seconds (default: 30).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Allowed CORS origins. Empty = allow any.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8000
}

fn default_max_connections() -> usize {
    1000
}

fn default_ping_interval() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            max_connections: default_max_connections(),
            ping_interval_secs: default_ping_interval(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "facetalk_pipeline=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Deadline for a single stage adapter call, in seconds (default: 60).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,

    /// Root for per-turn scratch directories (default: OS temp dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<String>,

    /// Number of most recent history messages sent to the language model (default: 40).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached renderings (default: 1024).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,

    /// Entries not accessed for this many seconds are evicted. Unset = no age limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider: "groq" or "openai" (default: "groq").
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Spoken language hint (ISO-639-1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

fn default_transcription_provider() -> String {
    "groq".into()
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider: "anthropic" (default) or "openai".
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Override the provider API base URL (OpenAI-compatible servers, proxies).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_llm_provider() -> String {
    "anthropic".into()
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(match self.provider.as_str() {
            "openai" => "gpt-4o-mini",
            _ => "claude-sonnet-4-20250514",
        })
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(2000)
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(0.7)
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .unwrap_or("You are a helpful AI assistant in an avatar conversation system.")
    }
}

/// Text-to-speech (TTS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider (default: "elevenlabs").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Default voice ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,

    /// Default model ID (e.g. "eleven_turbo_v2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Output format (default: "mp3_44100_128").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Face animation renderer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// Path to the ffmpeg binary (default: "ffmpeg" on PATH).
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,

    /// Path to the ffprobe binary (default: "ffprobe" on PATH).
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Square output resolution in pixels.
    #[serde(default = "default_resolution")]
    pub resolution: u32,
}

fn default_ffmpeg() -> String {
    "ffmpeg".into()
}

fn default_ffprobe() -> String {
    "ffprobe".into()
}

fn default_fps() -> u32 {
    25
}

fn default_resolution() -> u32 {
    512
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            fps: default_fps(),
            resolution: default_resolution(),
        }
    }
}

/// Blob storage for rendered videos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory the local blob store writes to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Public URL prefix for stored blobs (default: "http://localhost:<port>/media").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,

    /// Key prefix for rendered videos (default: "videos").
    #[serde(default = "default_video_prefix")]
    pub video_prefix: String,
}

fn default_video_prefix() -> String {
    "videos".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvatarsConfig {
    /// Directory holding processed avatar images named `<avatar_id>.<ext>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

/// Background job runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry backoff in milliseconds; doubles per attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_soft_limit")]
    pub soft_limit_secs: u64,

    #[serde(default = "default_hard_limit")]
    pub hard_limit_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1_000
}

fn default_soft_limit() -> u64 {
    25 * 60
}

fn default_hard_limit() -> u64 {
    30 * 60
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            soft_limit_secs: default_soft_limit(),
            hard_limit_secs: default_hard_limit(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::FacetalkError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted)
            .map_err(|e| crate::error::FacetalkError::Config(e.to_string()))
    }

    /// Default config file path: `~/.facetalk/config.json`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(default_port())
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn max_connections(&self) -> usize {
        self.gateway
            .as_ref()
            .map(|g| g.max_connections)
            .unwrap_or(default_max_connections())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(
            self.gateway
                .as_ref()
                .map(|g| g.ping_interval_secs)
                .unwrap_or(default_ping_interval())
                .max(1),
        )
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(
            self.pipeline
                .as_ref()
                .and_then(|p| p.stage_timeout_secs)
                .unwrap_or(60),
        )
    }

    pub fn scratch_dir(&self) -> Option<PathBuf> {
        self.pipeline
            .as_ref()
            .and_then(|p| p.scratch_dir.as_deref())
            .map(expand_path)
    }

    pub fn history_limit(&self) -> usize {
        self.pipeline
            .as_ref()
            .and_then(|p| p.history_limit)
            .unwrap_or(40)
            .max(1)
    }

    pub fn cache_max_entries(&self) -> usize {
        self.cache
            .as_ref()
            .and_then(|c| c.max_entries)
            .unwrap_or(1024)
    }

    pub fn cache_max_age(&self) -> Option<Duration> {
        self.cache
            .as_ref()
            .and_then(|c| c.max_age_secs)
            .map(Duration::from_secs)
    }

    /// Local blob store directory (default: `~/.facetalk/media`).
    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.dir.as_deref())
            .map(expand_path)
            .unwrap_or_else(|| data_dir().join("media"))
    }

    pub fn storage_public_base_url(&self) -> String {
        self.storage
            .as_ref()
            .and_then(|s| s.public_base_url.clone())
            .unwrap_or_else(|| format!("http://localhost:{}/media", self.gateway_port()))
    }

    pub fn video_prefix(&self) -> String {
        self.storage
            .as_ref()
            .map(|s| s.video_prefix.clone())
            .unwrap_or_else(default_video_prefix)
    }

    /// Avatar image directory (default: `~/.facetalk/avatars`).
    pub fn avatars_dir(&self) -> PathBuf {
        self.avatars
            .as_ref()
            .and_then(|a| a.dir.as_deref())
            .map(expand_path)
            .unwrap_or_else(|| data_dir().join("avatars"))
    }

    pub fn jobs(&self) -> JobsConfig {
        self.jobs.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        match &self.transcription {
            Some(t) if t.resolve_api_key().is_none() => {
                warnings.push(format!(
                    "Transcription provider '{}' has no API key configured",
                    t.provider
                ));
            }
            None => warnings.push("No transcription config; audio input will fail".into()),
            _ => {}
        }

        match &self.llm {
            Some(l) if l.resolve_api_key().is_none() => {
                warnings.push(format!("LLM provider '{}' has no API key configured", l.provider));
            }
            Some(l) if !matches!(l.provider.as_str(), "anthropic" | "openai") => {
                errors.push(format!("Unknown LLM provider: {}", l.provider));
            }
            None => warnings.push("No llm config; conversation turns will fail".into()),
            _ => {}
        }

        match &self.tts {
            Some(t) if t.resolve_api_key().is_none() => {
                warnings.push(format!("TTS provider '{}' has no API key configured", t.provider));
            }
            None => warnings.push("No tts config; video rendering will fail".into()),
            _ => {}
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if gw.max_connections == 0 {
                errors.push("gateway.max_connections cannot be 0".to_string());
            }
        }

        if self.stage_timeout().is_zero() {
            errors.push("pipeline.stage_timeout_secs cannot be 0".to_string());
        }

        if self.pipeline.as_ref().and_then(|p| p.history_limit) == Some(0) {
            errors.push("pipeline.history_limit must be at least 1".to_string());
        }

        if let Some(jobs) = &self.jobs {
            if jobs.max_attempts == 0 {
                errors.push("jobs.max_attempts must be at least 1".to_string());
            }
            if jobs.soft_limit_secs > jobs.hard_limit_secs {
                errors.push("jobs.soft_limit_secs exceeds jobs.hard_limit_secs".to_string());
            }
        }

        if !self.avatars_dir().exists() {
            warnings.push(format!(
                "Avatar directory not found: {}",
                self.avatars_dir().display()
            ));
        }

        (warnings, errors)
    }
}

/// Base directory for facetalk data: `~/.facetalk/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".facetalk")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded access to this variable
        unsafe { std::env::set_var("TEST_FT_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_FT_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_FT_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_FT_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 8000);
        assert_eq!(config.max_connections(), 1000);
        assert_eq!(config.stage_timeout(), Duration::from_secs(60));
        assert_eq!(config.history_limit(), 40);
        assert_eq!(config.cache_max_entries(), 1024);
        assert!(config.cache_max_age().is_none());
        assert_eq!(config.video_prefix(), "videos");
        assert_eq!(config.jobs().max_attempts, 3);
    }

    #[test]
    fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_parse_json5_sections() {
        let config = Config::parse(
            r#"{
                // comments are fine
                gateway: { port: 9100, max_connections: 5 },
                pipeline: { stage_timeout_secs: 15, history_limit: 6 },
                cache: { max_entries: 10, max_age_secs: 3600 },
                llm: { provider: "openai", model: "gpt-4o" },
            }"#,
        )
        .unwrap();
        assert_eq!(config.gateway_port(), 9100);
        assert_eq!(config.max_connections(), 5);
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.stage_timeout(), Duration::from_secs(15));
        assert_eq!(config.history_limit(), 6);
        assert_eq!(config.cache_max_entries(), 10);
        assert_eq!(config.cache_max_age(), Some(Duration::from_secs(3600)));
        let llm = config.llm.unwrap();
        assert_eq!(llm.model(), "gpt-4o");
        assert_eq!(llm.max_tokens(), 2000);
    }

    #[test]
    fn test_llm_defaults_per_provider() {
        let llm: LlmConfig = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(llm.provider, "anthropic");
        assert!(llm.model().starts_with("claude"));
        assert!((llm.temperature() - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resolve_secret_field_priority() {
        // SAFETY: test-only, single-threaded access to this variable
        unsafe { std::env::set_var("TEST_FT_TTS_KEY", "from-env") };
        let env_only = Some("TEST_FT_TTS_KEY".to_string());
        assert_eq!(resolve_secret_field(&None, &env_only), Some("from-env".into()));
        assert_eq!(
            resolve_secret_field(&Some("direct".into()), &env_only),
            Some("direct".into())
        );
        assert_eq!(resolve_secret_field(&Some(String::new()), &None), None);
        unsafe { std::env::remove_var("TEST_FT_TTS_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_reports_missing_keys() {
        let config = Config::parse(r#"{ llm: { provider: "anthropic" } }"#).unwrap();
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert!(
            warnings.iter().any(|w| w.contains("anthropic") && w.contains("API key")),
            "expected missing key warning, got: {warnings:?}"
        );
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let config = Config::parse(
            r#"{
                gateway: { port: 0 },
                pipeline: { history_limit: 0 },
                jobs: { max_attempts: 0, soft_limit_secs: 100, hard_limit_secs: 10 },
            }"#,
        )
        .unwrap();
        assert_eq!(config.history_limit(), 1);
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("port")));
        assert!(errors.iter().any(|e| e.contains("history_limit")));
        assert!(errors.iter().any(|e| e.contains("max_attempts")));
        assert!(errors.iter().any(|e| e.contains("soft_limit")));
    }
}
