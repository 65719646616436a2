//! Configuration loading for facecam.
//!
//! Sources, highest precedence first:
//! 1. Legacy `SUPABASE_URL`, `SUPABASE_ANON_KEY`, `SUPABASE_TABLE`, `DEVICE_ID`
//! 2. Environment variables prefixed with `FACECAM_` (`__` separates sections)
//! 3. TOML config file at `~/.config/facecam/config.toml`
//! 4. Default values

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::{Uncased, UncasedStr},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::capture::{CaptureApi, VideoMode};
use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = "config.toml";
const DATA_DIR_NAME: &str = "facecam";
const DATABASE_FILE_NAME: &str = "faces.db";
const MODEL_FILE_NAME: &str = "seeta_fd_frontal_v1.0.bin";
const FALLBACK_DEVICE_ID: &str = "raspi-01";
/// Upper bound for any delay or interval setting.
const MAX_SECONDS: f64 = 86_400.0;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
    pub faces: FacesConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

/// Which device to open and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Capture APIs in preference order.
    pub apis: Vec<CaptureApi>,
    /// `/dev/video{N}` indices to try, in order.
    pub indices: Vec<u32>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Pause between configuring a freshly opened device and the test read.
    pub warmup_ms: u64,
    /// Target delay between frame reads.
    pub frame_interval_ms: u64,
}

/// Acquisition retry and reconnection timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Stabilisation delay before the very first open.
    pub first_delay_secs: f64,
    /// Base of the escalating delays between attempts.
    pub base_delay_secs: f64,
    /// Consecutive read failures that trigger a reconnect.
    pub max_consecutive_failures: u32,
    pub reconnect_delay_secs: f64,
    /// Wait after a reconnect that found no camera.
    pub reconnect_backoff_secs: f64,
    /// Pause after each failed read.
    pub failure_pause_ms: u64,
    /// How long to wait for USB video devices at startup.
    pub device_wait_secs: u64,
    pub device_poll_secs: u64,
}

/// MJPEG server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    pub bind: String,
    pub jpeg_quality: u8,
    pub frame_interval_ms: u64,
    pub overlay_timestamp: bool,
    pub draw_faces: bool,
    /// Probe `resolutions` from largest to smallest after opening.
    pub probe_resolution: bool,
    pub resolutions: Vec<(u32, u32)>,
}

/// Face detection and capture settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacesConfig {
    pub enabled: bool,
    /// SeetaFace frontal model. Defaults to `~/.local/share/facecam/seeta_fd_frontal_v1.0.bin`.
    pub model_path: Option<PathBuf>,
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale: f32,
    pub window_step: u32,
    /// Minimum seconds between two saved faces.
    pub cooldown_secs: f64,
    pub margin_ratio: f64,
    pub thumbnail_size: u32,
    pub thumbnail_quality: u8,
    /// Reject detections scoring below this. 0 disables.
    pub min_score: f64,
    /// Reject faces with a smaller side. 0 disables.
    pub min_side: u32,
    /// Reject faces with a larger side. 0 disables.
    pub max_side: u32,
    pub min_aspect: f64,
    pub max_aspect: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `~/.local/share/facecam/faces.db`.
    pub database_path: Option<PathBuf>,
}

/// Supabase REST forwarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub table: String,
    pub device_id: Option<String>,
    pub interval_secs: f64,
    pub batch_size: usize,
    /// Batch size of the flush on shutdown.
    pub final_batch_size: usize,
    pub batch_timeout_secs: u64,
    pub single_timeout_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            apis: vec![CaptureApi::V4l2, CaptureApi::Fswebcam],
            indices: vec![0, 1, 2],
            width: 320,
            height: 240,
            fps: 15,
            warmup_ms: 150,
            frame_interval_ms: 33,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            first_delay_secs: 3.0,
            base_delay_secs: 5.0,
            max_consecutive_failures: 10,
            reconnect_delay_secs: 1.0,
            reconnect_backoff_secs: 10.0,
            failure_pause_ms: 500,
            device_wait_secs: 30,
            device_poll_secs: 2,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:5000".to_string(),
            jpeg_quality: 85,
            frame_interval_ms: 33,
            overlay_timestamp: true,
            draw_faces: true,
            probe_resolution: false,
            resolutions: vec![
                (1920, 1080),
                (1280, 720),
                (960, 720),
                (800, 600),
                (640, 480),
                (480, 360),
                (320, 240),
                (160, 120),
            ],
        }
    }
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_path: None,
            min_face_size: 30,
            score_threshold: 2.0,
            pyramid_scale: 0.8,
            window_step: 4,
            cooldown_secs: 3.0,
            margin_ratio: 0.15,
            thumbnail_size: 160,
            thumbnail_quality: 80,
            min_score: 0.0,
            min_side: 0,
            max_side: 0,
            min_aspect: 0.6,
            max_aspect: 1.4,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            table: "captures".to_string(),
            device_id: None,
            interval_secs: 5.0,
            batch_size: 50,
            final_batch_size: 200,
            batch_timeout_secs: 20,
            single_timeout_secs: 15,
        }
    }
}

/// Maps the unprefixed Supabase variables of older deployments onto `sync.*`.
fn legacy_env_key<'a>(key: &'a UncasedStr) -> Option<Uncased<'a>> {
    let mapped = match key.as_str().to_ascii_uppercase().as_str() {
        "SUPABASE_URL" => "sync.url",
        "SUPABASE_ANON_KEY" => "sync.anon_key",
        "SUPABASE_TABLE" => "sync.table",
        "DEVICE_ID" => "sync.device_id",
        _ => return None,
    };
    Some(Uncased::from(mapped))
}

impl Config {
    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let config: Config = Self::figment(config_file).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(config_file: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("FACECAM_").split("__"))
            .merge(Env::raw().filter_map(legacy_env_key))
    }

    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));

        if self.camera.apis.is_empty() {
            return fail("camera.apis must list at least one capture api");
        }
        if self.camera.indices.is_empty() {
            return fail("camera.indices must list at least one device index");
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return fail("camera.width and camera.height must be greater than 0");
        }
        let seconds = [
            ("retry.first_delay_secs", self.retry.first_delay_secs),
            ("retry.base_delay_secs", self.retry.base_delay_secs),
            ("retry.reconnect_delay_secs", self.retry.reconnect_delay_secs),
            ("retry.reconnect_backoff_secs", self.retry.reconnect_backoff_secs),
            ("faces.cooldown_secs", self.faces.cooldown_secs),
            ("sync.interval_secs", self.sync.interval_secs),
        ];
        for (name, value) in seconds {
            if !value.is_finite() || !(0.0..=MAX_SECONDS).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be between 0 and {MAX_SECONDS} seconds, got {value}"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be greater than 0");
        }
        if self.retry.max_consecutive_failures == 0 {
            return fail("retry.max_consecutive_failures must be greater than 0");
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return fail("stream.jpeg_quality must be between 1 and 100");
        }
        if !(1..=100).contains(&self.faces.thumbnail_quality) {
            return fail("faces.thumbnail_quality must be between 1 and 100");
        }
        if self.faces.thumbnail_size == 0 {
            return fail("faces.thumbnail_size must be greater than 0");
        }
        if self.faces.margin_ratio < 0.0 {
            return fail("faces.margin_ratio cannot be negative");
        }
        if self.faces.min_aspect > self.faces.max_aspect {
            return fail("faces.min_aspect cannot be greater than faces.max_aspect");
        }
        if self.faces.max_side != 0 && self.faces.min_side > self.faces.max_side {
            return fail("faces.min_side cannot be greater than faces.max_side");
        }
        if self.sync.batch_size == 0 || self.sync.final_batch_size == 0 {
            return fail("sync batch sizes must be greater than 0");
        }
        if self.sync.interval_secs <= 0.0 {
            return fail("sync.interval_secs must be greater than 0");
        }

        Ok(())
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    #[must_use]
    pub fn model_path(&self) -> PathBuf {
        self.faces
            .model_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(MODEL_FILE_NAME))
    }

    /// Copy of the configuration safe to print.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.sync.anon_key = config.sync.anon_key.as_deref().map(mask_secret);
        config
    }
}

impl CameraConfig {
    #[must_use]
    pub fn video_mode(&self) -> VideoMode {
        VideoMode {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }

    #[must_use]
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl FacesConfig {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs.max(0.0))
    }
}

impl SyncConfig {
    /// True when both the URL and the anon key are set.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        set(&self.url) && set(&self.anon_key)
    }

    /// Configured device id, else the host name from the environment.
    #[must_use]
    pub fn device_id(&self) -> String {
        self.device_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| std::env::var("COMPUTERNAME").ok().filter(|v| !v.is_empty()))
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| FALLBACK_DEVICE_ID.to_string())
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }
}

/// Show only the edges of a secret: `abcdefghij...klmnopqrst`.
#[must_use]
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 20 {
        let head: String = chars[..10].iter().collect();
        let tail: String = chars[chars.len() - 10..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "*".repeat(chars.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_face_capture_profile() {
        let config = Config::default();

        assert_eq!(config.camera.indices, vec![0, 1, 2]);
        assert_eq!(config.camera.video_mode(), VideoMode { width: 320, height: 240, fps: 15 });
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_consecutive_failures, 10);
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.table, "captures");
        assert!(!config.sync.is_configured());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_indices() {
        let mut config = Config::default();
        config.camera.indices.clear();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("camera.indices"));
    }

    #[test]
    fn validate_rejects_inverted_aspect_range() {
        let mut config = Config::default();
        config.faces.min_aspect = 2.0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("min_aspect"));
    }

    #[test]
    fn toml_and_prefixed_env_are_layered() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "facecam.toml",
                r#"
                [camera]
                width = 640
                height = 480
                apis = ["fswebcam"]

                [sync]
                batch_size = 10
                "#,
            )?;
            jail.set_env("FACECAM_CAMERA__WIDTH", "800");

            let config = Config::load_from(Some(PathBuf::from("facecam.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.camera.width, 800);
            assert_eq!(config.camera.height, 480);
            assert_eq!(config.camera.apis, vec![CaptureApi::Fswebcam]);
            assert_eq!(config.sync.batch_size, 10);
            Ok(())
        });
    }

    #[test]
    fn legacy_supabase_env_overrides_sync_section() {
        Jail::expect_with(|jail| {
            jail.set_env("SUPABASE_URL", "https://example.supabase.co");
            jail.set_env("SUPABASE_ANON_KEY", "anon");
            jail.set_env("DEVICE_ID", "porch-cam");
            jail.set_env("FACECAM_SYNC__TABLE", "faces");

            let config = Config::load_from(Some(PathBuf::from("missing.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.sync.url.as_deref(), Some("https://example.supabase.co"));
            assert!(config.sync.is_configured());
            assert_eq!(config.sync.device_id(), "porch-cam");
            assert_eq!(config.sync.table, "faces");
            Ok(())
        });
    }

    #[test]
    fn validate_rejects_non_finite_durations() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "facecam.toml",
                r#"
                [sync]
                interval_secs = nan
                "#,
            )?;
            let err = Config::load_from(Some(PathBuf::from("facecam.toml")))
                .expect_err("nan interval accepted");
            assert!(err.to_string().contains("sync.interval_secs"));

            jail.create_file(
                "facecam.toml",
                r#"
                [retry]
                reconnect_backoff_secs = inf
                "#,
            )?;
            let err = Config::load_from(Some(PathBuf::from("facecam.toml")))
                .expect_err("infinite backoff accepted");
            assert!(err.to_string().contains("retry.reconnect_backoff_secs"));
            Ok(())
        });
    }

    #[test]
    fn validate_rejects_negative_and_huge_delays() {
        let mut config = Config::default();
        config.retry.first_delay_secs = -1.0;
        assert!(config.validate().unwrap_err().to_string().contains("retry.first_delay_secs"));

        let mut config = Config::default();
        config.faces.cooldown_secs = 1e20;
        assert!(config.validate().unwrap_err().to_string().contains("faces.cooldown_secs"));
    }

    #[test]
    fn mask_secret_keeps_edges_of_long_keys() {
        let key = "abcdefghij0123456789KLMNOPQRST";
        assert_eq!(mask_secret(key), "abcdefghij...KLMNOPQRST");
        assert_eq!(mask_secret("short"), "*****");
    }

    #[test]
    fn redacted_masks_anon_key() {
        let mut config = Config::default();
        config.sync.anon_key = Some("secret".to_string());
        assert_eq!(config.redacted().sync.anon_key.as_deref(), Some("******"));
    }
}
