use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::pool::SchedulerConfig;
use crate::sandbox::{ProviderEndpoint, RetryPolicy, SandboxConfig};

pub const DEFAULT_CONFIG_FILE: &str = "envpool.toml";

/// Process settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub config_path: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("ENVPOOL_CONFIG").ok().as_deref(),
        )
    }

    /// Build Settings from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
        config_path: Option<&str>,
    ) -> Self {
        let sentry_dsn = sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let config_path = config_path
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        Settings {
            sentry_dsn,
            environment,
            config_path,
        }
    }
}

/// `envpool.toml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub provider: ProviderConfig,
    pub sandbox: SandboxSection,
    pub runner: RunnerConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub task_timeout_secs: u64,
    pub reset_timeout_secs: u64,
    pub recovery_grace_secs: u64,
    pub poll_interval_ms: u64,
    pub replace_after_failures: u32,
    pub max_prepare_attempts: u32,
    /// Provisioning attempts for a slot without a sandbox before the slot
    /// is given up.
    pub max_provision_attempts: u32,
    /// Delay before the second provisioning attempt; doubles after that.
    pub provision_backoff_ms: u64,
    pub snapshot: String,
    pub name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            task_timeout_secs: 600,
            reset_timeout_secs: 120,
            recovery_grace_secs: 180,
            poll_interval_ms: 500,
            replace_after_failures: 2,
            max_prepare_attempts: 2,
            max_provision_attempts: 3,
            provision_backoff_ms: 2000,
            snapshot: "init_state".to_string(),
            name_prefix: "envpool".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub hosts: Vec<ProviderEndpoint>,
    pub max_sandboxes_per_host: usize,
    /// Total attempts per create call, the first one included.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            max_sandboxes_per_host: 4,
            max_retries: 3,
            base_backoff_ms: 500,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub os_type: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub disk_size: String,
    pub ram_size: String,
    pub cpu_cores: u32,
    pub headless: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            os_type: "Ubuntu".to_string(),
            screen_width: 1920,
            screen_height: 1080,
            disk_size: "32G".to_string(),
            ram_size: "4G".to_string(),
            cpu_cores: 4,
            headless: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub task_command: Vec<String>,
    /// Empty means this binary's `worker` subcommand.
    pub worker_command: Vec<String>,
    pub aux_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
        }
    }
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub pool_size: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub reset_timeout_secs: Option<u64>,
    pub results_dir: Option<PathBuf>,
    pub hosts: Vec<ProviderEndpoint>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(size) = overrides.pool_size {
            self.pool.size = size;
        }
        if let Some(secs) = overrides.task_timeout_secs {
            self.pool.task_timeout_secs = secs;
        }
        if let Some(secs) = overrides.reset_timeout_secs {
            self.pool.reset_timeout_secs = secs;
        }
        if let Some(dir) = overrides.results_dir {
            self.output.results_dir = dir;
        }
        if !overrides.hosts.is_empty() {
            self.provider.hosts = overrides.hosts;
        }
    }

    /// Checks everything `run` needs.
    pub fn validate(&self) -> Result<()> {
        self.validate_provider()?;
        let pool = &self.pool;
        if pool.size == 0 {
            bail!("pool.size must be at least 1");
        }
        let capacity = self.provider.hosts.len() * self.provider.max_sandboxes_per_host;
        if pool.size > capacity {
            bail!(
                "pool.size {} exceeds provider capacity {} ({} hosts x {} per host)",
                pool.size,
                capacity,
                self.provider.hosts.len(),
                self.provider.max_sandboxes_per_host
            );
        }
        if pool.task_timeout_secs == 0 || pool.reset_timeout_secs == 0 {
            bail!("pool timeouts must be positive");
        }
        if pool.recovery_grace_secs < pool.reset_timeout_secs {
            bail!(
                "pool.recovery_grace_secs ({}) must cover pool.reset_timeout_secs ({})",
                pool.recovery_grace_secs,
                pool.reset_timeout_secs
            );
        }
        if pool.poll_interval_ms == 0 {
            bail!("pool.poll_interval_ms must be positive");
        }
        if pool.max_prepare_attempts == 0 {
            bail!("pool.max_prepare_attempts must be at least 1");
        }
        if pool.max_provision_attempts == 0 {
            bail!("pool.max_provision_attempts must be at least 1");
        }
        if pool.name_prefix.is_empty() {
            bail!("pool.name_prefix must not be empty");
        }
        if self.runner.task_command.is_empty() {
            bail!("runner.task_command must name the task runner");
        }
        Ok(())
    }

    /// Checks what commands that only talk to providers need.
    pub fn validate_provider(&self) -> Result<()> {
        if self.provider.hosts.is_empty() {
            bail!("provider.hosts must list at least one host:port");
        }
        if self.provider.max_retries == 0 {
            bail!("provider.max_retries must be at least 1");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.provider.max_retries,
            base_backoff: Duration::from_millis(self.provider.base_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.provider.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.reset_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.task_timeout_secs)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            task_timeout: self.task_timeout(),
            recovery_grace: Duration::from_secs(self.pool.recovery_grace_secs),
            poll_interval: Duration::from_millis(self.pool.poll_interval_ms),
            max_prepare_attempts: self.pool.max_prepare_attempts,
            max_provision_attempts: self.pool.max_provision_attempts,
            provision_backoff: Duration::from_millis(self.pool.provision_backoff_ms),
        }
    }

    /// `output.results_dir` with a leading `~` expanded to the home directory.
    pub fn results_dir(&self) -> PathBuf {
        expand_home(&self.output.results_dir)
    }

    /// Sandbox config shared by every slot; the name is filled in per slot.
    pub fn sandbox_template(&self) -> SandboxConfig {
        let s = &self.sandbox;
        SandboxConfig {
            name: String::new(),
            os_type: s.os_type.clone(),
            screen_width: s.screen_width,
            screen_height: s.screen_height,
            disk_size: s.disk_size.clone(),
            ram_size: s.ram_size.clone(),
            cpu_cores: s.cpu_cores,
            headless: s.headless,
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        Config::parse(toml_str).unwrap()
    }

    const VALID: &str = r#"
        [pool]
        size = 3
        task_timeout_secs = 300

        [provider]
        hosts = ["10.0.0.1:5000", "10.0.0.2:5000"]
        max_sandboxes_per_host = 2

        [runner]
        task_command = ["python", "-m", "runner"]
        aux_endpoints = ["http://llm-1:8000", "http://llm-2:8000"]
    "#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config.pool.size, 4);
        assert_eq!(config.pool.replace_after_failures, 2);
        assert_eq!(config.pool.snapshot, "init_state");
        assert_eq!(config.provider.max_retries, 3);
        assert_eq!(config.output.results_dir, PathBuf::from("results"));
        assert!(config.runner.worker_command.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = parse(VALID);
        assert_eq!(config.pool.size, 3);
        assert_eq!(config.pool.task_timeout_secs, 300);
        assert_eq!(config.pool.reset_timeout_secs, 120);
        assert_eq!(config.provider.hosts[1], ProviderEndpoint::new("10.0.0.2", 5000));
        assert_eq!(config.runner.task_command[0], "python");
        assert_eq!(config.runner.aux_endpoints.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_host_fails_to_parse() {
        let result = Config::parse(
            r#"
            [provider]
            hosts = ["no-port"]
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_toml_fails() {
        assert!(Config::parse("not valid toml {{{}}}").is_err());
    }

    #[test]
    fn test_pool_larger_than_capacity_is_rejected() {
        let mut config = parse(VALID);
        config.pool.size = 5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds provider capacity"));
    }

    #[test]
    fn test_zero_pool_is_rejected() {
        let mut config = parse(VALID);
        config.pool.size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_grace_must_cover_reset() {
        let mut config = parse(VALID);
        config.pool.recovery_grace_secs = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("recovery_grace_secs"));
    }

    #[test]
    fn test_missing_task_command_is_rejected() {
        let mut config = parse(VALID);
        config.runner.task_command.clear();
        assert!(config.validate().is_err());
        // Provider-only commands don't need it.
        config.validate_provider().unwrap();
    }

    #[test]
    fn test_no_hosts_is_rejected() {
        let config = parse("");
        assert!(config.validate_provider().is_err());
    }

    #[test]
    fn test_overrides_win() {
        let mut config = parse(VALID);
        config.apply(Overrides {
            pool_size: Some(1),
            task_timeout_secs: Some(5),
            results_dir: Some(PathBuf::from("/tmp/out")),
            hosts: vec![ProviderEndpoint::new("localhost", 7000)],
            ..Default::default()
        });
        assert_eq!(config.pool.size, 1);
        assert_eq!(config.task_timeout(), Duration::from_secs(5));
        assert_eq!(config.output.results_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.provider.hosts.len(), 1);
        assert_eq!(config.pool.reset_timeout_secs, 120);
    }

    #[test]
    fn test_derived_values() {
        let config = parse(VALID);
        let sched = config.scheduler();
        assert_eq!(sched.unit_deadline(), Duration::from_secs(300 + 180));
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.sandbox_template().screen_width, 1920);
        assert_eq!(sched.max_provision_attempts, 3);
        assert_eq!(sched.provision_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_provision_attempts_must_be_positive() {
        let mut config = parse(VALID);
        config.pool.max_provision_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_provision_attempts"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&tmp.path().join("missing.toml")).unwrap();
        assert_eq!(config.pool.size, 4);

        let path = tmp.path().join("envpool.toml");
        std::fs::write(&path, VALID).unwrap();
        assert_eq!(Config::load_or_default(&path).unwrap().pool.size, 3);
    }

    #[test]
    fn test_results_dir_expands_home() {
        let mut config = parse("");
        assert_eq!(config.results_dir(), PathBuf::from("results"));

        config.output.results_dir = PathBuf::from("~/envpool-runs");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.results_dir(), home.join("envpool-runs"));
        }

        config.output.results_dir = PathBuf::from("~other/runs");
        assert_eq!(config.results_dir(), PathBuf::from("~other/runs"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_raw_values(None, Some(""), None);
        assert!(settings.sentry_dsn.is_none());
        assert_eq!(settings.environment, "local");
        assert_eq!(settings.config_path, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_settings_values() {
        let settings = Settings::from_raw_values(
            Some("https://sentry.io/123"),
            Some("production"),
            Some("/etc/envpool.toml"),
        );
        assert_eq!(settings.sentry_dsn.as_deref(), Some("https://sentry.io/123"));
        assert_eq!(settings.environment, "production");
        assert_eq!(settings.config_path, PathBuf::from("/etc/envpool.toml"));
    }
}
