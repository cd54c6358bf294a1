/// Configuration for the orchestrator
///
/// Everything is read from environment variables (a `.env` file is loaded
/// first when present). Each section has its own `from_env`, `validate`
/// and `Default`.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::observability::{LogConfig, LogFormat, LogLevel};
use shared::types::{PlatformRequest, Stage};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub controller: ControllerConfig,
    pub analysis: AnalysisConfig,
    pub processing: ProcessingConfig,
    pub machinery: MachineryConfig,
    pub runner: RunnerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            storage: StorageConfig::from_env()?,
            controller: ControllerConfig::from_env()?,
            analysis: AnalysisConfig::from_env()?,
            processing: ProcessingConfig::from_env()?,
            machinery: MachineryConfig::from_env()?,
            runner: RunnerConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.controller.validate()?;
        self.analysis.validate()?;
        self.processing.validate()?;
        self.machinery.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

/// Storage layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root holding `analyses/` and `binaries/`
    pub root: PathBuf,
    pub max_submission_size: u64,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            root: PathBuf::from(
                env::var("NEXUS_STORAGE_DIR").unwrap_or_else(|_| "/var/lib/nexus".to_string()),
            ),
            max_submission_size: parse_var("MAX_SUBMISSION_SIZE", "104857600")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            anyhow::bail!("Storage directory cannot be empty");
        }
        if self.max_submission_size == 0 {
            anyhow::bail!("Max submission size must be greater than 0");
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/nexus"),
            max_submission_size: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub socket_path: PathBuf,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            socket_path: PathBuf::from(
                env::var("CONTROLLER_SOCKET")
                    .unwrap_or_else(|_| "/run/nexus/controller.sock".to_string()),
            ),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            anyhow::bail!("CONTROLLER_SOCKET cannot be empty");
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/nexus/controller.sock"),
        }
    }
}

/// Analysis policy: platform selection, limits and defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Cancel analyses whose identification selected nothing
    pub cancel_unidentified: bool,
    pub default_platform: PlatformRequest,
    pub max_platforms: usize,
    pub default_timeout: u64,
    pub max_timeout: u64,
    pub default_priority: u32,
    pub max_priority: u32,
}

/// Parse `platform` or `platform:version`
pub fn parse_platform_request(raw: &str) -> Result<PlatformRequest> {
    let raw = raw.trim();
    let request = match raw.split_once(':') {
        Some((platform, version)) if !version.trim().is_empty() => {
            PlatformRequest::exact(platform.trim(), version.trim())
        }
        Some((platform, _)) => PlatformRequest::any_version(platform.trim()),
        None => PlatformRequest::any_version(raw),
    };
    if request.platform.is_empty() {
        anyhow::bail!("Platform name cannot be empty: '{}'", raw);
    }
    Ok(request)
}

impl AnalysisConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            cancel_unidentified: env::var("CANCEL_UNIDENTIFIED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            default_platform: parse_platform_request(
                &env::var("DEFAULT_PLATFORM").unwrap_or_else(|_| "windows".to_string()),
            )
            .context("Invalid DEFAULT_PLATFORM")?,
            max_platforms: parse_var("MAX_PLATFORMS", "5")?,
            default_timeout: parse_var("DEFAULT_TASK_TIMEOUT", "120")?,
            max_timeout: parse_var("MAX_TASK_TIMEOUT", "3600")?,
            default_priority: parse_var("DEFAULT_TASK_PRIORITY", "1")?,
            max_priority: parse_var("MAX_TASK_PRIORITY", "3")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_platforms == 0 {
            anyhow::bail!("Max platforms must be at least 1");
        }
        if self.default_timeout == 0 || self.default_timeout > self.max_timeout {
            anyhow::bail!(
                "Default task timeout must be within 1..={}",
                self.max_timeout
            );
        }
        if self.default_priority == 0 || self.default_priority > self.max_priority {
            anyhow::bail!(
                "Default task priority must be within 1..={}",
                self.max_priority
            );
        }
        Ok(())
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cancel_unidentified: true,
            default_platform: PlatformRequest::any_version("windows"),
            max_platforms: 5,
            default_timeout: 120,
            max_timeout: 3600,
            default_priority: 1,
            max_priority: 3,
        }
    }
}

/// Stage worker pools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub identification_workers: usize,
    pub pre_workers: usize,
    pub post_workers: usize,
    pub worker_binary: PathBuf,
    pub socket_dir: PathBuf,
    pub setup_timeout_seconds: u64,
    /// Zero disables the work deadline
    pub work_timeout_seconds: u64,
    pub max_restarts: u32,
    pub dispatch_tick_ms: u64,
}

impl ProcessingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            identification_workers: parse_var("IDENTIFICATION_WORKERS", "1")?,
            pre_workers: parse_var("PRE_WORKERS", "1")?,
            post_workers: parse_var("POST_WORKERS", "1")?,
            worker_binary: PathBuf::from(
                env::var("WORKER_BINARY").unwrap_or_else(|_| "nexus-stage-worker".to_string()),
            ),
            socket_dir: PathBuf::from(
                env::var("WORKER_SOCKET_DIR").unwrap_or_else(|_| "/run/nexus/workers".to_string()),
            ),
            setup_timeout_seconds: parse_var("WORKER_SETUP_TIMEOUT", "60")?,
            work_timeout_seconds: parse_var("WORKER_WORK_TIMEOUT", "0")?,
            max_restarts: parse_var("WORKER_MAX_RESTARTS", "3")?,
            dispatch_tick_ms: parse_var("WORKER_DISPATCH_TICK_MS", "500")?,
        })
    }

    pub fn workers_for(&self, stage: Stage) -> usize {
        match stage {
            Stage::Identification => self.identification_workers,
            Stage::Pre => self.pre_workers,
            Stage::Post => self.post_workers,
        }
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_seconds)
    }

    pub fn work_timeout(&self) -> Option<Duration> {
        (self.work_timeout_seconds > 0).then(|| Duration::from_secs(self.work_timeout_seconds))
    }

    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for stage in Stage::ALL {
            if self.workers_for(stage) == 0 {
                anyhow::bail!("At least one {} worker is required", stage);
            }
        }
        if self.setup_timeout_seconds == 0 {
            anyhow::bail!("Worker setup timeout must be greater than 0");
        }
        if self.dispatch_tick_ms == 0 {
            anyhow::bail!("Worker dispatch tick must be greater than 0");
        }
        Ok(())
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            identification_workers: 1,
            pre_workers: 1,
            post_workers: 1,
            worker_binary: PathBuf::from("nexus-stage-worker"),
            socket_dir: PathBuf::from("/run/nexus/workers"),
            setup_timeout_seconds: 60,
            work_timeout_seconds: 0,
            max_restarts: 3,
            dispatch_tick_ms: 500,
        }
    }
}

/// Machinery manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineryConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub start_timeout_seconds: u64,
    pub stop_timeout_seconds: u64,
    pub machines_file: PathBuf,
    /// libvirt connection URI for the virsh backend; the virsh default when unset
    pub libvirt_uri: Option<String>,
}

impl MachineryConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workers: parse_var("MACHINERY_WORKERS", "4")?,
            poll_interval_ms: parse_var("MACHINERY_POLL_INTERVAL_MS", "1000")?,
            start_timeout_seconds: parse_var("MACHINE_START_TIMEOUT", "60")?,
            stop_timeout_seconds: parse_var("MACHINE_STOP_TIMEOUT", "60")?,
            machines_file: PathBuf::from(
                env::var("MACHINES_FILE").unwrap_or_else(|_| "/etc/nexus/machines.json".to_string()),
            ),
            libvirt_uri: env::var("LIBVIRT_URI").ok().filter(|u| !u.trim().is_empty()),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("Machinery workers must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("Machinery poll interval must be greater than 0");
        }
        if self.start_timeout_seconds == 0 || self.stop_timeout_seconds == 0 {
            anyhow::bail!("Machine action timeouts must be greater than 0");
        }
        Ok(())
    }
}

impl Default for MachineryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 1000,
            start_timeout_seconds: 60,
            stop_timeout_seconds: 60,
            machines_file: PathBuf::from("/etc/nexus/machines.json"),
            libvirt_uri: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Command run for every task; its arguments are split on whitespace
    pub command: Option<String>,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            command: env::var("TASK_RUNNER_COMMAND")
                .ok()
                .filter(|c| !c.trim().is_empty()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.to_log_config("nexus-orchestrator").map(|_| ())
    }

    pub fn to_log_config(&self, process: &str) -> Result<LogConfig> {
        let level: LogLevel = self.level.parse().context("Invalid LOG_LEVEL")?;
        let format: LogFormat = self.format.parse().context("Invalid LOG_FORMAT")?;
        Ok(LogConfig {
            level,
            format,
            ..LogConfig::new(process)
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_parse_platform_request() {
        assert_eq!(
            parse_platform_request("windows:10").unwrap(),
            PlatformRequest::exact("windows", "10")
        );
        assert_eq!(
            parse_platform_request(" linux ").unwrap(),
            PlatformRequest::any_version("linux")
        );
        assert_eq!(
            parse_platform_request("linux:").unwrap(),
            PlatformRequest::any_version("linux")
        );
        assert!(parse_platform_request(":10").is_err());
    }

    #[test]
    fn test_work_timeout_zero_means_none() {
        let mut processing = ProcessingConfig::default();
        assert_eq!(processing.work_timeout(), None);
        processing.work_timeout_seconds = 30;
        assert_eq!(processing.work_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut analysis = AnalysisConfig::default();
        analysis.default_priority = 9;
        assert!(analysis.validate().is_err());

        let mut processing = ProcessingConfig::default();
        processing.pre_workers = 0;
        assert!(processing.validate().is_err());
    }

    #[test]
    fn test_logging_section_maps_to_log_config() {
        let logging = LoggingConfig {
            level: "warning".to_string(),
            format: "json".to_string(),
        };
        let log_config = logging.to_log_config("nexus-stage-worker").unwrap();
        assert_eq!(log_config.level, LogLevel::Warn);
        assert_eq!(log_config.format, LogFormat::Json);

        let bad = LoggingConfig {
            level: "loud".to_string(),
            format: "json".to_string(),
        };
        assert!(bad.validate().is_err());
    }
}
