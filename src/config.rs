//! Service configuration.
//!
//! Defaults, then an optional JSON (or `.toml`) file named by
//! `PARKING_MONITOR_CONFIG`, then environment overrides, then validation.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{ProcessingParams, DEFAULT_WINDOW};
use crate::reporter::{ReporterSettings, DEFAULT_MAX_WORKERS};
use crate::worker::WorkerSettings;

pub use crate::lot::ConfigError;

pub const CONFIG_PATH_ENV: &str = "PARKING_MONITOR_CONFIG";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8001;
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_BACKEND_URL: &str = "http://localhost:8000/api";
const DEFAULT_SINK_TIMEOUT_SECS: u64 = 5;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 2;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 10;
const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 15;
const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_CONNECT_RETRY_SECS: u64 = 5;
const DEFAULT_READ_RETRY_MS: u64 = 1_000;
const DEFAULT_FRAME_PAUSE_MS: u64 = 10;
const DEFAULT_DEBUG_IMAGE_DIR: &str = "debug_images";

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    api: Option<ApiConfigFile>,
    backend: Option<BackendConfigFile>,
    reporter: Option<ReporterConfigFile>,
    worker: Option<WorkerConfigFile>,
    processing: Option<ProcessingConfigFile>,
    debug: Option<bool>,
    save_debug_images: Option<bool>,
    debug_image_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    host: Option<String>,
    port: Option<u16>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    api_url: Option<String>,
    timeout_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    probe_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReporterConfigFile {
    max_workers: Option<usize>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    update_interval_secs: Option<u64>,
    connect_attempts: Option<u32>,
    connect_retry_delay_secs: Option<u64>,
    read_retry_delay_ms: Option<u64>,
    frame_pause_ms: Option<u64>,
    window_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessingConfigFile {
    block_size: Option<u32>,
    threshold_constant: Option<i32>,
    median_size: Option<u32>,
    dilation_iterations: Option<u32>,
    empty_threshold: Option<u32>,
    spot_width: Option<u32>,
    spot_height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub backend: BackendSettings,
    pub reporter: ReporterSettings,
    pub worker: WorkerSettings,
    pub processing: ProcessingParams,
    pub debug: bool,
    pub save_debug_images: bool,
    pub debug_image_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub api_url: String,
    pub timeout: Duration,
    pub probe_timeout: Duration,
    /// How often `/health`'s cached backend status is refreshed.
    pub probe_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        // from_file on an empty file cannot fail
        Self::from_file(MonitorConfigFile::default())
    }
}

impl MonitorConfig {
    /// Load from `PARKING_MONITOR_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from an explicit file (if any) and the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => MonitorConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let backend = file.backend.unwrap_or_default();
        let reporter = file.reporter.unwrap_or_default();
        let worker = file.worker.unwrap_or_default();
        let processing = file.processing.unwrap_or_default();
        let defaults = ProcessingParams::default();

        let max_workers = reporter.max_workers.unwrap_or(DEFAULT_MAX_WORKERS);
        Self {
            host: api.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: api.port.unwrap_or(DEFAULT_PORT),
            max_body_bytes: api.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            backend: BackendSettings {
                api_url: backend
                    .api_url
                    .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
                timeout: Duration::from_secs(
                    backend.timeout_secs.unwrap_or(DEFAULT_SINK_TIMEOUT_SECS),
                ),
                probe_timeout: Duration::from_secs(
                    backend
                        .probe_timeout_secs
                        .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS),
                ),
                probe_interval: Duration::from_secs(
                    backend
                        .probe_interval_secs
                        .unwrap_or(DEFAULT_PROBE_INTERVAL_SECS),
                ),
            },
            reporter: ReporterSettings {
                max_workers,
                queue_depth: reporter.queue_depth.unwrap_or(max_workers),
            },
            worker: WorkerSettings {
                update_interval: Duration::from_secs(
                    worker
                        .update_interval_secs
                        .unwrap_or(DEFAULT_UPDATE_INTERVAL_SECS),
                ),
                connect_attempts: worker.connect_attempts.unwrap_or(DEFAULT_CONNECT_ATTEMPTS),
                connect_retry_delay: Duration::from_secs(
                    worker
                        .connect_retry_delay_secs
                        .unwrap_or(DEFAULT_CONNECT_RETRY_SECS),
                ),
                read_retry_delay: Duration::from_millis(
                    worker.read_retry_delay_ms.unwrap_or(DEFAULT_READ_RETRY_MS),
                ),
                frame_pause: Duration::from_millis(
                    worker.frame_pause_ms.unwrap_or(DEFAULT_FRAME_PAUSE_MS),
                ),
                window_size: worker.window_size.unwrap_or(DEFAULT_WINDOW),
                ..WorkerSettings::default()
            },
            processing: ProcessingParams {
                block_size: processing.block_size.unwrap_or(defaults.block_size),
                threshold_constant: processing
                    .threshold_constant
                    .unwrap_or(defaults.threshold_constant),
                median_size: processing.median_size.unwrap_or(defaults.median_size),
                dilation_iterations: processing
                    .dilation_iterations
                    .unwrap_or(defaults.dilation_iterations),
                empty_threshold: processing
                    .empty_threshold
                    .unwrap_or(defaults.empty_threshold),
                spot_width: processing.spot_width.unwrap_or(defaults.spot_width),
                spot_height: processing.spot_height.unwrap_or(defaults.spot_height),
            },
            debug: file.debug.unwrap_or(false),
            save_debug_images: file.save_debug_images.unwrap_or(false),
            debug_image_dir: file
                .debug_image_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DEBUG_IMAGE_DIR)),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("BACKEND_API_URL") {
            if !url.trim().is_empty() {
                self.backend.api_url = url.trim().to_string();
            }
        }
        if let Some(secs) = env_number::<u64>("UPDATE_INTERVAL")? {
            self.worker.update_interval = Duration::from_secs(secs);
        }
        if let Some(workers) = env_number::<usize>("MAX_WORKERS")? {
            self.reporter.max_workers = workers;
            self.reporter.queue_depth = workers;
        }
        if let Ok(host) = std::env::var("HOST") {
            if !host.trim().is_empty() {
                self.host = host.trim().to_string();
            }
        }
        if let Some(port) = env_number::<u16>("PORT")? {
            self.port = port;
        }
        if let Some(debug) = env_flag("DEBUG") {
            self.debug = debug;
        }
        if let Some(save) = env_flag("SAVE_DEBUG_IMAGES") {
            self.save_debug_images = save;
        }
        if let Ok(dir) = std::env::var("DEBUG_IMAGE_DIR") {
            if !dir.trim().is_empty() {
                self.debug_image_dir = PathBuf::from(dir.trim());
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        url::Url::parse(&self.backend.api_url)
            .map_err(|e| anyhow!("invalid backend api url {}: {}", self.backend.api_url, e))?;
        if self.worker.update_interval.is_zero() {
            return Err(anyhow!("update interval must be greater than zero"));
        }
        if self.reporter.max_workers == 0 {
            return Err(anyhow!("max workers must be greater than zero"));
        }
        if self.worker.window_size == 0 {
            return Err(anyhow!("stabilization window must be greater than zero"));
        }
        if self.worker.connect_attempts == 0 {
            return Err(anyhow!("connect attempts must be greater than zero"));
        }
        if self.backend.timeout.is_zero() || self.backend.probe_timeout.is_zero() {
            return Err(anyhow!("backend timeouts must be greater than zero"));
        }
        if self.backend.probe_interval.is_zero() {
            return Err(anyhow!("backend probe interval must be greater than zero"));
        }
        self.processing.validate()?;
        self.worker.debug_image_dir = self
            .save_debug_images
            .then(|| self.debug_image_dir.clone());
        Ok(())
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Default `env_logger` filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() {
        return None;
    }
    Some(matches!(value.as_str(), "true" | "1" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_conventions() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.api_addr(), "0.0.0.0:8001");
        assert_eq!(cfg.backend.api_url, "http://localhost:8000/api");
        assert_eq!(cfg.backend.timeout, Duration::from_secs(5));
        assert_eq!(cfg.backend.probe_interval, Duration::from_secs(10));
        assert_eq!(cfg.reporter.max_workers, 4);
        assert_eq!(cfg.reporter.queue_depth, 4);
        assert_eq!(cfg.worker.update_interval, Duration::from_secs(15));
        assert_eq!(cfg.worker.connect_attempts, 5);
        assert_eq!(cfg.worker.window_size, 5);
        assert_eq!(cfg.processing, ProcessingParams::default());
        assert_eq!(cfg.log_filter(), "info");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let file: MonitorConfigFile = serde_json::from_str(
            r#"{"processing": {"empty_threshold": 1200}, "reporter": {"max_workers": 2}}"#,
        )
        .unwrap();
        let cfg = MonitorConfig::from_file(file);
        assert_eq!(cfg.processing.empty_threshold, 1200);
        assert_eq!(cfg.processing.block_size, 25);
        assert_eq!(cfg.reporter.queue_depth, 2);
    }

    #[test]
    fn toml_file_is_accepted() {
        let file: MonitorConfigFile = toml::from_str(
            "debug = true\n[api]\nport = 9100\n[worker]\nupdate_interval_secs = 30\n",
        )
        .unwrap();
        let cfg = MonitorConfig::from_file(file);
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.worker.update_interval, Duration::from_secs(30));
        assert_eq!(cfg.log_filter(), "debug");
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.worker.window_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn debug_dir_only_when_saving_images() {
        let mut cfg = MonitorConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.worker.debug_image_dir.is_none());
        cfg.save_debug_images = true;
        cfg.validate().unwrap();
        assert_eq!(
            cfg.worker.debug_image_dir.as_deref(),
            Some(Path::new("debug_images"))
        );
    }
}
