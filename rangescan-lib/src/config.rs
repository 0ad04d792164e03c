//! Configuration file parsing and management.
//!
//! This module handles loading configuration from TOML files and the
//! `RS_*` environment variables, and merging them with proper precedence
//! rules: local file > home file > XDG file, with environment variables
//! applied on top by the caller.

use crate::error::ScanError;
use crate::types::MAX_BATCH_SIZE;
use crate::utils::parse_duration_string;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Highest worker count accepted from any configuration source.
pub const MAX_WORKERS: usize = 256;

/// Configuration loaded from TOML files.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FileConfig {
    /// Range scan settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanSection>,

    /// Proxy pool, supplier and client settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxies: Option<ProxiesSection>,

    /// Per-batch retry policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,
}

/// `[scan]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ScanSection {
    /// Default worker count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Coarse unit size used to balance shards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_size: Option<usize>,

    /// Identifiers per upstream call (at most 60)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_banned: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_adjust: Option<bool>,

    /// Upstream batch endpoint override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users_endpoint: Option<String>,

    /// Maximum stagger between worker launches (e.g. "100ms")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_jitter: Option<String>,
}

/// `[proxies]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProxiesSection {
    /// Static proxy list used instead of scraping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Probe proxies before use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,

    /// Accept invalid TLS certificates through proxies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    /// Per-request timeout (e.g. "6s")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,

    /// Per-probe timeout (e.g. "2s")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_timeout: Option<String>,

    /// Supplier calls per refill before giving up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refill_attempts: Option<u32>,

    /// Raw `host:port` list URLs to scrape
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_lists: Option<Vec<String>>,

    /// HTML page URLs to scrape
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_pages: Option<Vec<String>>,
}

/// `[retry]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RetrySection {
    /// Attempts per batch; 0 means unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Wall-clock budget per batch (e.g. "10m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_elapsed: Option<String>,

    /// Base delay for consecutive 429s (e.g. "5s")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_delay: Option<String>,

    /// Consecutive 429s before rotating the proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate_after: Option<u32>,
}

impl ScanSection {
    fn merge(self, higher: Self) -> Self {
        Self {
            workers: higher.workers.or(self.workers),
            unit_size: higher.unit_size.or(self.unit_size),
            batch_size: higher.batch_size.or(self.batch_size),
            exclude_banned: higher.exclude_banned.or(self.exclude_banned),
            auto_adjust: higher.auto_adjust.or(self.auto_adjust),
            users_endpoint: higher.users_endpoint.or(self.users_endpoint),
            launch_jitter: higher.launch_jitter.or(self.launch_jitter),
        }
    }
}

impl ProxiesSection {
    fn merge(self, higher: Self) -> Self {
        Self {
            file: higher.file.or(self.file),
            verify: higher.verify.or(self.verify),
            insecure: higher.insecure.or(self.insecure),
            request_timeout: higher.request_timeout.or(self.request_timeout),
            probe_timeout: higher.probe_timeout.or(self.probe_timeout),
            refill_attempts: higher.refill_attempts.or(self.refill_attempts),
            raw_lists: higher.raw_lists.or(self.raw_lists),
            html_pages: higher.html_pages.or(self.html_pages),
        }
    }
}

impl RetrySection {
    fn merge(self, higher: Self) -> Self {
        Self {
            max_attempts: higher.max_attempts.or(self.max_attempts),
            max_elapsed: higher.max_elapsed.or(self.max_elapsed),
            rate_limit_delay: higher.rate_limit_delay.or(self.rate_limit_delay),
            rotate_after: higher.rotate_after.or(self.rotate_after),
        }
    }
}

fn merge_section<T>(lower: Option<T>, higher: Option<T>, merge: fn(T, T) -> T) -> Option<T> {
    match (lower, higher) {
        (Some(lower), Some(higher)) => Some(merge(lower, higher)),
        (lower, higher) => higher.or(lower),
    }
}

/// Configuration discovery and loading functionality.
pub struct ConfigManager {
    /// Whether to log which files were picked up
    pub verbose: bool,
}

impl ConfigManager {
    /// Create a new configuration manager.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Load and validate one configuration file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<FileConfig, ScanError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ScanError::file_error(
                path.to_string_lossy(),
                "Configuration file not found",
            ));
        }

        let content = fs::read_to_string(path).map_err(|e| {
            ScanError::file_error(
                path.to_string_lossy(),
                format!("Failed to read configuration file: {}", e),
            )
        })?;

        let config: FileConfig = toml::from_str(&content)
            .map_err(|e| ScanError::config(format!("Failed to parse TOML configuration: {}", e)))?;

        self.validate_config(&config)?;

        Ok(config)
    }

    /// Discover and load configuration files in precedence order.
    ///
    /// Missing files are skipped. A file that exists but does not parse or
    /// validate is an error, so a typo never silently falls back to defaults.
    pub fn discover_and_load(&self) -> Result<FileConfig, ScanError> {
        let candidates = [
            self.get_xdg_config_path(),
            self.get_global_config_path(),
            self.get_local_config_path(),
        ];

        let mut merged = FileConfig::default();
        let mut loaded_files = Vec::new();

        // Lowest precedence first
        for path in candidates.into_iter().flatten() {
            let config = self.load_file(&path)?;
            merged = self.merge_configs(merged, config);
            loaded_files.push(path);
        }

        if self.verbose {
            for path in &loaded_files {
                tracing::info!(path = %path.display(), "loaded configuration file");
            }
        }

        Ok(merged)
    }

    /// Look for a config file in the current directory.
    fn get_local_config_path(&self) -> Option<PathBuf> {
        ["./rangescan.toml", "./.rangescan.toml"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Look for a config file in the user's home directory.
    fn get_global_config_path(&self) -> Option<PathBuf> {
        let home = env::var_os("HOME")?;
        let path = Path::new(&home).join(".rangescan.toml");
        path.exists().then_some(path)
    }

    /// Follows the XDG Base Directory Specification.
    fn get_xdg_config_path(&self) -> Option<PathBuf> {
        let config_dir = env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| Path::new(&home).join(".config")))?;

        let path = config_dir.join("rangescan").join("config.toml");
        path.exists().then_some(path)
    }

    /// Merge two configurations. Values from `higher` win.
    pub fn merge_configs(&self, lower: FileConfig, higher: FileConfig) -> FileConfig {
        FileConfig {
            scan: merge_section(lower.scan, higher.scan, ScanSection::merge),
            proxies: merge_section(lower.proxies, higher.proxies, ProxiesSection::merge),
            retry: merge_section(lower.retry, higher.retry, RetrySection::merge),
        }
    }

    /// Validate a configuration for common issues.
    fn validate_config(&self, config: &FileConfig) -> Result<(), ScanError> {
        if let Some(scan) = &config.scan {
            if let Some(workers) = scan.workers {
                validate_workers(workers)?;
            }
            if scan.unit_size == Some(0) {
                return Err(ScanError::config("unit_size must be at least 1"));
            }
            if let Some(batch_size) = scan.batch_size {
                if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
                    return Err(ScanError::config(format!(
                        "batch_size must be between 1 and {}",
                        MAX_BATCH_SIZE
                    )));
                }
            }
            if let Some(endpoint) = &scan.users_endpoint {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    return Err(ScanError::config(format!(
                        "users_endpoint '{}' must be an http(s) URL",
                        endpoint
                    )));
                }
            }
            validate_duration("scan.launch_jitter", scan.launch_jitter.as_deref())?;
        }

        if let Some(proxies) = &config.proxies {
            validate_duration("proxies.request_timeout", proxies.request_timeout.as_deref())?;
            validate_duration("proxies.probe_timeout", proxies.probe_timeout.as_deref())?;
            if proxies.refill_attempts == Some(0) {
                return Err(ScanError::config("refill_attempts must be at least 1"));
            }
            if proxies.file.as_deref().is_some_and(|f| f.trim().is_empty()) {
                return Err(ScanError::config("proxies.file cannot be empty"));
            }
        }

        if let Some(retry) = &config.retry {
            validate_duration("retry.max_elapsed", retry.max_elapsed.as_deref())?;
            validate_duration("retry.rate_limit_delay", retry.rate_limit_delay.as_deref())?;
            if retry.rotate_after == Some(0) {
                return Err(ScanError::config("rotate_after must be at least 1"));
            }
        }

        Ok(())
    }
}

/// Check a worker count against `1..=256`.
pub fn validate_workers(workers: usize) -> Result<(), ScanError> {
    if workers == 0 || workers > MAX_WORKERS {
        return Err(ScanError::config(format!(
            "Workers must be between 1 and {}",
            MAX_WORKERS
        )));
    }
    Ok(())
}

fn validate_duration(key: &str, value: Option<&str>) -> Result<(), ScanError> {
    match value {
        Some(value) if parse_duration_string(value).is_none() => Err(ScanError::config(format!(
            "Invalid duration '{}' for {}. Use a format like '500ms', '5s' or '2m'",
            value, key
        ))),
        _ => Ok(()),
    }
}

/// Environment variable configuration that mirrors CLI options.
///
/// This represents configuration values that can be set via `RS_*`
/// environment variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvConfig {
    pub workers: Option<usize>,
    pub exclude_banned: Option<bool>,
    pub max_attempts: Option<u32>,
    pub timeout: Option<String>,
    pub proxy_file: Option<String>,
    pub config: Option<String>,
    pub insecure: Option<bool>,
}

impl EnvConfig {
    /// Build from an arbitrary variable lookup.
    ///
    /// Invalid values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env_config = Self::default();

        if let Some(val) = lookup("RS_WORKERS") {
            match val.trim().parse::<usize>() {
                Ok(workers) if validate_workers(workers).is_ok() => {
                    env_config.workers = Some(workers);
                }
                _ => tracing::warn!(value = %val, "ignoring RS_WORKERS, must be 1-{}", MAX_WORKERS),
            }
        }

        env_config.exclude_banned = lookup_bool(&lookup, "RS_EXCLUDE_BANNED");
        env_config.insecure = lookup_bool(&lookup, "RS_INSECURE");

        if let Some(val) = lookup("RS_MAX_ATTEMPTS") {
            match val.trim().parse::<u32>() {
                Ok(attempts) => env_config.max_attempts = Some(attempts),
                Err(_) => tracing::warn!(value = %val, "ignoring RS_MAX_ATTEMPTS, not a number"),
            }
        }

        if let Some(val) = lookup("RS_TIMEOUT") {
            if parse_duration_string(&val).is_some() {
                env_config.timeout = Some(val);
            } else {
                tracing::warn!(
                    value = %val,
                    "ignoring RS_TIMEOUT, use a format like '5s' or '500ms'"
                );
            }
        }

        env_config.proxy_file = lookup_path(&lookup, "RS_PROXY_FILE");
        env_config.config = lookup_path(&lookup, "RS_CONFIG");

        env_config
    }
}

fn lookup_bool<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let val = lookup(key)?;
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %val, "ignoring invalid boolean, use true/false");
            None
        }
    }
}

fn lookup_path<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|path| !path.trim().is_empty())
}

/// Load configuration from the process environment.
///
/// # Arguments
///
/// * `verbose` - Whether to log the variables that were picked up
pub fn load_env_config(verbose: bool) -> EnvConfig {
    let env_config = EnvConfig::from_lookup(|key| env::var(key).ok());
    if verbose && env_config != EnvConfig::default() {
        tracing::info!(?env_config, "using RS_* environment overrides");
    }
    env_config
}
