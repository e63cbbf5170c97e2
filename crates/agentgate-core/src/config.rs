//! Configuration resolution for agentgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/agentgate/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::READY_SENTINEL;

/// Complete agentgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            worker: WorkerConfig::default(),
            fallback: FallbackConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Admission-control intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum spacing between any two worker dispatches.
    pub global_min_interval_ms: u64,
    /// Minimum spacing between two dispatches for the same session.
    pub session_min_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_min_interval_ms: 2_000,
            session_min_interval_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub const fn global_min_interval(&self) -> Duration {
        Duration::from_millis(self.global_min_interval_ms)
    }

    pub const fn session_min_interval(&self) -> Duration {
        Duration::from_millis(self.session_min_interval_ms)
    }
}

/// Response cache sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5 * 60,
            max_entries: 100,
        }
    }
}

impl CacheConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Long-lived worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable to launch.
    pub program: PathBuf,
    /// Arguments passed before anything else.
    pub args: Vec<String>,
    /// Working directory for the process (inherits ours when unset).
    pub working_directory: Option<PathBuf>,
    /// Line the worker prints once it is ready.
    pub ready_sentinel: String,
    pub startup_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Grace period after SIGINT before the worker is killed on shutdown.
    pub terminate_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["persistent_agent.py".to_string()],
            working_directory: None,
            ready_sentinel: READY_SENTINEL.to_string(),
            startup_timeout_secs: 10,
            request_timeout_secs: 30,
            terminate_timeout_secs: 5,
        }
    }
}

impl WorkerConfig {
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// One-shot worker used when the long-lived one fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// The process is killed if it has not exited after this long.
    pub timeout_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["legal_agent_interface.py".to_string()],
            working_directory: None,
            timeout_secs: 120,
        }
    }
}

impl FallbackConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|p| p.exists());

    if let Some(path) = explicit
        && !path.exists()
    {
        return Err(Error::Config(format!(
            "Config file {} does not exist",
            path.display()
        )));
    }

    let mut config = load_layers(global.as_deref(), explicit)?;
    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Merge the settings files in priority order, later files winning field by
/// field, then fill whatever none of them set from the defaults.
fn load_layers(global: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut merged = Value::Object(Map::new());
    for path in [global, explicit].into_iter().flatten() {
        merge_config(&mut merged, read_layer(path)?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; anything else
/// in the overlay replaces the base value.
fn merge_config(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_config(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".agentgate").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/agentgate/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("agentgate").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(n) = env_number("AGENTGATE_GLOBAL_MIN_INTERVAL_MS") {
        config.scheduler.global_min_interval_ms = n;
    }
    if let Some(n) = env_number("AGENTGATE_SESSION_MIN_INTERVAL_MS") {
        config.scheduler.session_min_interval_ms = n;
    }
    if let Some(n) = env_number("AGENTGATE_CACHE_TTL_SECS") {
        config.cache.ttl_secs = n;
    }
    if let Some(n) = env_number("AGENTGATE_CACHE_MAX_ENTRIES") {
        config.cache.max_entries = n;
    }
    if let Ok(val) = std::env::var("AGENTGATE_WORKER_PROGRAM") {
        config.worker.program = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("AGENTGATE_FALLBACK_PROGRAM") {
        config.fallback.program = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("AGENTGATE_LOG_LEVEL") {
        config.log_level = val;
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.parse().ok())
}

/// Reject settings the runtime cannot work with.
pub fn validate(config: &Config) -> Result<()> {
    if config.cache.max_entries == 0 {
        return Err(Error::Config("cache.max_entries must be at least 1".into()));
    }
    if config.worker.ready_sentinel.trim().is_empty() {
        return Err(Error::Config("worker.ready_sentinel must not be empty".into()));
    }
    if config.worker.request_timeout_secs == 0 || config.worker.startup_timeout_secs == 0 {
        return Err(Error::Config("worker timeouts must be non-zero".into()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_admission_constants() {
        let config = Config::default();
        assert_eq!(config.scheduler.global_min_interval(), Duration::from_millis(2000));
        assert_eq!(config.scheduler.session_min_interval(), Duration::from_millis(1000));
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.max_entries, 100);
    }

    #[test]
    fn default_worker_timeouts() {
        let config = Config::default();
        assert_eq!(config.worker.startup_timeout(), Duration::from_secs(10));
        assert_eq!(config.worker.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.worker.ready_sentinel, "AGENT_READY");
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"scheduler":{"global_min_interval_ms":500},"worker":{"program":"/usr/bin/agent"}}"#,
        )
        .unwrap();

        let config = load_layers(None, Some(&path)).unwrap();
        assert_eq!(config.scheduler.global_min_interval_ms, 500);
        assert_eq!(config.scheduler.session_min_interval_ms, 1000);
        assert_eq!(config.worker.program, PathBuf::from("/usr/bin/agent"));
        assert_eq!(config.worker.request_timeout_secs, 30);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_layers(None, Some(&path)), Err(Error::Config(_))));
    }

    #[test]
    fn explicit_file_layers_over_global_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let global = dir.path().join("global.json");
        let explicit = dir.path().join("explicit.json");
        std::fs::write(
            &global,
            r#"{"worker":{"program":"/opt/agent/worker","args":["a.py","--x"]},"cache":{"ttl_secs":60}}"#,
        )
        .unwrap();
        std::fs::write(
            &explicit,
            r#"{"scheduler":{"global_min_interval_ms":500},"worker":{"args":["b.py"]}}"#,
        )
        .unwrap();

        let config = load_layers(Some(&global), Some(&explicit)).unwrap();
        assert_eq!(config.worker.program, PathBuf::from("/opt/agent/worker"));
        assert_eq!(config.worker.args, vec!["b.py".to_string()]);
        assert_eq!(config.scheduler.global_min_interval_ms, 500);
        assert_eq!(config.scheduler.session_min_interval_ms, 1000);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.max_entries, 100);
    }

    #[test]
    fn no_files_gives_defaults() {
        let config = load_layers(None, None).unwrap();
        assert_eq!(config.worker.program, Config::default().worker.program);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn merge_replaces_scalars_and_recurses_into_objects() {
        let mut base = serde_json::json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        merge_config(&mut base, serde_json::json!({"a": {"c": 3}, "d": [9]}));
        assert_eq!(base, serde_json::json!({"a": {"b": 1, "c": 3}, "d": [9]}));
    }

    #[test]
    fn missing_explicit_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = load_config(Some(&dir.path().join("absent.json")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn zero_capacity_cache_is_rejected() {
        let mut config = Config::default();
        config.cache.max_entries = 0;
        assert!(validate(&config).is_err());
    }
}
