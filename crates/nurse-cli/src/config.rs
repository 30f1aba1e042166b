//! Gate configuration – reads/writes `~/.nurse/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nurse_runtime::{DEFAULT_UPDATE_SUBJECT, HeartbeatConfig, InterceptorConfig};
use nurse_types::NurseError;

/// Persisted gate configuration stored in `~/.nurse/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the WebSocket bus gateway listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite file holding the audit trail.
    #[serde(default = "default_audit_db")]
    pub audit_db: String,

    /// Optional JSON array of policy updates loaded at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_seed: Option<String>,

    #[serde(default = "default_enforcement_budget_ms")]
    pub enforcement_budget_ms: u64,

    /// Combined budget for the policy and regime reads.
    #[serde(default = "default_lookup_budget_ms")]
    pub lookup_budget_ms: u64,

    #[serde(default = "default_heartbeat_budget_ms")]
    pub heartbeat_budget_ms: u64,

    #[serde(default = "default_probe_budget_ms")]
    pub probe_budget_ms: u64,

    /// Silence after which the heartbeat watcher raises an alert.
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,

    #[serde(default)]
    pub subjects: Subjects,
}

/// Bus subjects the gate listens and publishes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subjects {
    #[serde(default = "default_intent_pattern")]
    pub intents: String,
    #[serde(default = "default_signal_subject")]
    pub signals: String,
    #[serde(default = "default_heartbeat_subject")]
    pub heartbeat: String,
    #[serde(default = "default_policy_update_subject")]
    pub policy_updates: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:4280".to_string()
}
fn default_audit_db() -> String {
    "nurse-audit.db".to_string()
}
fn default_enforcement_budget_ms() -> u64 {
    50
}
fn default_lookup_budget_ms() -> u64 {
    15
}
fn default_heartbeat_budget_ms() -> u64 {
    20
}
fn default_probe_budget_ms() -> u64 {
    10
}
fn default_heartbeat_stale_secs() -> u64 {
    30
}
fn default_intent_pattern() -> String {
    "cio.intent.>".to_string()
}
fn default_signal_subject() -> String {
    "signals.trading".to_string()
}
fn default_heartbeat_subject() -> String {
    "cio.heartbeat".to_string()
}
fn default_policy_update_subject() -> String {
    DEFAULT_UPDATE_SUBJECT.to_string()
}

impl Default for Subjects {
    fn default() -> Self {
        Self {
            intents: default_intent_pattern(),
            signals: default_signal_subject(),
            heartbeat: default_heartbeat_subject(),
            policy_updates: default_policy_update_subject(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            audit_db: default_audit_db(),
            policy_seed: None,
            enforcement_budget_ms: default_enforcement_budget_ms(),
            lookup_budget_ms: default_lookup_budget_ms(),
            heartbeat_budget_ms: default_heartbeat_budget_ms(),
            probe_budget_ms: default_probe_budget_ms(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
            subjects: Subjects::default(),
        }
    }
}

impl Config {
    pub fn interceptor(&self) -> InterceptorConfig {
        InterceptorConfig {
            inbound_pattern: self.subjects.intents.clone(),
            outbound_subject: self.subjects.signals.clone(),
            enforcement_budget: Duration::from_millis(self.enforcement_budget_ms),
            ..InterceptorConfig::default()
        }
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            subject: self.subjects.heartbeat.clone(),
            reply_budget: Duration::from_millis(self.heartbeat_budget_ms),
            probe_budget: Duration::from_millis(self.probe_budget_ms),
            ..HeartbeatConfig::default()
        }
    }

    pub fn lookup_budget(&self) -> Duration {
        Duration::from_millis(self.lookup_budget_ms)
    }

    pub fn heartbeat_stale_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }
}

/// `NURSE_CONFIG` if set, else `~/.nurse/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("NURSE_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".nurse").join("config.toml")
}

/// Load the config, falling back to defaults when the file is absent.
/// Environment overrides are applied either way.
pub fn load() -> Result<Config, NurseError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, NurseError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        NurseError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| NurseError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `NURSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `NURSE_BIND_ADDR` | `bind_addr` |
/// | `NURSE_AUDIT_DB` | `audit_db` |
/// | `NURSE_POLICY_SEED` | `policy_seed` |
/// | `NURSE_ENFORCEMENT_BUDGET_MS` | `enforcement_budget_ms` |
/// | `NURSE_LOOKUP_BUDGET_MS` | `lookup_budget_ms` |
/// | `NURSE_HEARTBEAT_BUDGET_MS` | `heartbeat_budget_ms` |
///
/// Numbers that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("NURSE_BIND_ADDR") {
        cfg.bind_addr = v;
    }
    if let Ok(v) = std::env::var("NURSE_AUDIT_DB") {
        cfg.audit_db = v;
    }
    if let Ok(v) = std::env::var("NURSE_POLICY_SEED") {
        cfg.policy_seed = Some(v);
    }
    override_ms("NURSE_ENFORCEMENT_BUDGET_MS", &mut cfg.enforcement_budget_ms);
    override_ms("NURSE_LOOKUP_BUDGET_MS", &mut cfg.lookup_budget_ms);
    override_ms("NURSE_HEARTBEAT_BUDGET_MS", &mut cfg.heartbeat_budget_ms);
}

fn override_ms(var: &str, field: &mut u64) {
    if let Ok(v) = std::env::var(var)
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        *field = ms;
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), NurseError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| NurseError::Config(format!("failed to create config directory: {e}")))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| NurseError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| NurseError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.enforcement_budget_ms, 50);
        assert_eq!(loaded.subjects.intents, "cio.intent.>");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "audit_db = \"/var/lib/nurse/audit.db\"\n\n[subjects]\nsignals = \"signals.paper\"\n",
        )
        .expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.audit_db, "/var/lib/nurse/audit.db");
        assert_eq!(loaded.subjects.signals, "signals.paper");
        assert_eq!(loaded.subjects.heartbeat, "cio.heartbeat");
        assert_eq!(loaded.lookup_budget_ms, 15);
    }

    #[test]
    fn unparsable_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "enforcement_budget_ms = \"fast\"").expect("write");
        assert!(matches!(load_from(&path), Err(NurseError::Config(_))));
    }

    #[test]
    fn config_path_points_to_nurse_dir() {
        let p = config_path_for_home("/home/trader");
        assert!(p.to_string_lossy().contains(".nurse"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let result = load_from(&path).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn runtime_configs_carry_budgets_and_subjects() {
        let mut cfg = Config::default();
        cfg.enforcement_budget_ms = 40;
        cfg.heartbeat_budget_ms = 25;
        cfg.subjects.intents = "desk.intent.>".into();

        let interceptor = cfg.interceptor();
        assert_eq!(interceptor.enforcement_budget, Duration::from_millis(40));
        assert_eq!(interceptor.inbound_pattern, "desk.intent.>");
        assert_eq!(interceptor.outbound_subject, "signals.trading");

        let heartbeat = cfg.heartbeat();
        assert_eq!(heartbeat.reply_budget, Duration::from_millis(25));
        assert_eq!(heartbeat.probe_budget, Duration::from_millis(10));
        assert_eq!(cfg.lookup_budget(), Duration::from_millis(15));
    }

    #[test]
    fn apply_env_overrides_changes_bind_addr() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("NURSE_BIND_ADDR", "0.0.0.0:9000") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        unsafe { std::env::remove_var("NURSE_BIND_ADDR") };
    }

    #[test]
    fn apply_env_overrides_changes_lookup_budget() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("NURSE_LOOKUP_BUDGET_MS", "12") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.lookup_budget_ms, 12);
        unsafe { std::env::remove_var("NURSE_LOOKUP_BUDGET_MS") };
    }

    #[test]
    fn apply_env_overrides_sets_policy_seed() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("NURSE_POLICY_SEED", "/etc/nurse/seed.json") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.policy_seed.as_deref(), Some("/etc/nurse/seed.json"));
        unsafe { std::env::remove_var("NURSE_POLICY_SEED") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_budget() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("NURSE_ENFORCEMENT_BUDGET_MS", "soon") };
        let mut cfg = Config::default();
        let original = cfg.enforcement_budget_ms;
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.enforcement_budget_ms, original);
        unsafe { std::env::remove_var("NURSE_ENFORCEMENT_BUDGET_MS") };
    }
}
