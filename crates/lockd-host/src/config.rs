use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use lockd_kernel::triggers::payment::DEFAULT_REMINDER_WINDOW_MS;
use lockd_kernel::{Backoff, KernelConfig, RecoveryPolicy};
use lockd_store::{DEFAULT_OUTBOX_CAPACITY, DEFAULT_VERIFICATION_HISTORY, QueueLimits};
use url::Url;

use crate::error::HostError;

pub const ENV_PREFIX: &str = "LOCKD_";

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root for the encrypted store, journal, key material and platform files.
    pub data_dir: PathBuf,
    pub device_id: String,
    pub backend_url: String,
    /// Shared secret sent as `X-Device-Api-Key`.
    pub api_key: Option<String>,
    /// Hex-encoded Ed25519 key the backend signs commands with.
    pub backend_public_key: Option<String>,
    /// Shown on hard and backend-only lock screens.
    pub support_contact: Option<String>,
    /// Program and leading arguments used to install a staged update; the
    /// artifact path is appended. `None` refuses installs.
    pub install_command: Option<Vec<String>>,
    pub intervals: Intervals,
    pub http: HttpConfig,
    pub backoff: Backoff,
    pub recovery: RecoveryPolicy,
    pub queue_limits: QueueLimits,
    pub reminder_window_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/lockd"),
            device_id: String::new(),
            backend_url: "http://127.0.0.1:8000".into(),
            api_key: None,
            backend_public_key: None,
            support_contact: None,
            install_command: None,
            intervals: Intervals::default(),
            http: HttpConfig::default(),
            backoff: Backoff::default(),
            recovery: RecoveryPolicy::default(),
            queue_limits: QueueLimits::default(),
            reminder_window_ms: DEFAULT_REMINDER_WINDOW_MS,
        }
    }
}

/// Daemon timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Executor tick while commands are pending.
    pub executor: Duration,
    pub heartbeat: Duration,
    pub self_check: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            executor: Duration::from_secs(5),
            heartbeat: Duration::from_secs(15 * 60),
            self_check: Duration::from_secs(60 * 60),
        }
    }
}

/// Configuration for the backend HTTP client.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Timeout for heartbeat and alert requests.
    pub timeout: Duration,
    /// Maximum response body size in bytes.
    pub max_body_size: usize,
    /// Whole-transfer timeout for update downloads.
    pub download_timeout: Duration,
    pub max_download_size: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            download_timeout: Duration::from_secs(10 * 60),
            max_download_size: 512 * 1024 * 1024,
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `LOCKD_*` environment variables.
    pub fn from_env() -> Result<Self, HostError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HostError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut cfg = Self::default();

        if let Some(v) = var("DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DEVICE_ID") {
            cfg.device_id = v;
        }
        if let Some(v) = var("BACKEND_URL") {
            cfg.backend_url = v;
        }
        cfg.api_key = var("API_KEY");
        cfg.backend_public_key = var("BACKEND_PUBLIC_KEY");
        cfg.support_contact = var("SUPPORT_CONTACT");
        cfg.install_command = var("INSTALL_COMMAND").map(|v| split_command(&v));

        if let Some(v) = var("EXECUTOR_INTERVAL_SECS") {
            cfg.intervals.executor = Duration::from_secs(parse_num("EXECUTOR_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = var("HEARTBEAT_INTERVAL_SECS") {
            cfg.intervals.heartbeat =
                Duration::from_secs(parse_num("HEARTBEAT_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = var("SELF_CHECK_INTERVAL_SECS") {
            cfg.intervals.self_check =
                Duration::from_secs(parse_num("SELF_CHECK_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = var("HTTP_TIMEOUT_SECS") {
            cfg.http.timeout = Duration::from_secs(parse_num("HTTP_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("MAX_BODY_BYTES") {
            cfg.http.max_body_size = parse_num("MAX_BODY_BYTES", &v)?;
        }
        if let Some(v) = var("BACKOFF_BASE_SECS") {
            cfg.backoff.base_ms = parse_num::<u64>("BACKOFF_BASE_SECS", &v)? * 1000;
        }
        if let Some(v) = var("BACKOFF_MAX_SECS") {
            cfg.backoff.max_ms = parse_num::<u64>("BACKOFF_MAX_SECS", &v)? * 1000;
        }
        if let Some(v) = var("BACKOFF_MAX_ATTEMPTS") {
            cfg.backoff.max_attempts = parse_num("BACKOFF_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("RECOVERY_MAX_ATTEMPTS") {
            cfg.recovery.max_attempts = parse_num("RECOVERY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("RECOVERY_BACKOFF_BASE_SECS") {
            cfg.recovery.backoff.base_ms =
                parse_num::<u64>("RECOVERY_BACKOFF_BASE_SECS", &v)? * 1000;
        }
        if let Some(v) = var("MAX_PENDING_COMMANDS") {
            cfg.queue_limits.max_pending = parse_num("MAX_PENDING_COMMANDS", &v)?;
        }
        if let Some(v) = var("MAX_COMMAND_HISTORY") {
            cfg.queue_limits.max_history = parse_num("MAX_COMMAND_HISTORY", &v)?;
        }
        if let Some(v) = var("REMINDER_WINDOW_HOURS") {
            cfg.reminder_window_ms =
                parse_num::<u64>("REMINDER_WINDOW_HOURS", &v)? * 60 * 60 * 1000;
        }
        Ok(cfg)
    }

    /// Checks everything the daemon needs before touching the store.
    pub fn validate(&self) -> Result<(), HostError> {
        if self.device_id.trim().is_empty() {
            return Err(HostError::Config("device id is not configured".into()));
        }
        self.backend_base()?;
        if self.backend_public_key.is_none() {
            return Err(HostError::Config("backend public key is not configured".into()));
        }
        if self.intervals.executor.is_zero() || self.intervals.heartbeat.is_zero() {
            return Err(HostError::Config("daemon intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn backend_base(&self) -> Result<Url, HostError> {
        let url = Url::parse(&self.backend_url)
            .map_err(|e| HostError::Config(format!("backend url '{}': {e}", self.backend_url)))?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            return Err(HostError::Config(format!(
                "backend url '{}' is not an http(s) base",
                self.backend_url
            )));
        }
        Ok(url)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn fallback_store_dir(&self) -> PathBuf {
        self.data_dir.join("store.fallback")
    }

    /// The journal keeps its own `journal/` subdirectory under this root.
    pub fn journal_root(&self) -> &Path {
        &self.data_dir
    }

    pub fn storage_secret_path(&self) -> PathBuf {
        self.data_dir.join("storage.secret")
    }

    pub fn signing_seed_path(&self) -> PathBuf {
        self.data_dir.join("signing.seed")
    }

    pub fn platform_dir(&self) -> PathBuf {
        self.data_dir.join("platform")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.data_dir.join("lockd.sock")
    }

    pub fn kernel_config(&self) -> KernelConfig {
        KernelConfig {
            device_id: self.device_id.clone(),
            support_contact: self.support_contact.clone(),
            staging_dir: self.staging_dir(),
            reminder_window_ms: self.reminder_window_ms,
            queue_limits: self.queue_limits,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            verification_history: DEFAULT_VERIFICATION_HISTORY,
            heartbeat_timeout: self.http.timeout,
            recovery: self.recovery,
        }
    }
}

fn parse_num<T: FromStr>(name: &str, value: &str) -> Result<T, HostError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| HostError::Config(format!("{ENV_PREFIX}{name}='{value}': {e}")))
}

fn split_command(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.intervals.executor, Duration::from_secs(5));
        assert_eq!(cfg.intervals.heartbeat, Duration::from_secs(900));
        assert_eq!(cfg.intervals.self_check, Duration::from_secs(3600));
        assert_eq!(cfg.http.timeout, Duration::from_secs(30));
        assert_eq!(cfg.http.max_body_size, 10 * 1024 * 1024);
        assert_eq!(cfg.queue_limits.max_pending, 1000);
        assert_eq!(cfg.queue_limits.max_history, 500);
        assert_eq!(cfg.recovery.max_attempts, 3);
        assert_eq!(cfg.reminder_window_ms, 2 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = HostConfig::from_lookup(lookup(&[
            ("LOCKD_DATA_DIR", "/tmp/lockd"),
            ("LOCKD_DEVICE_ID", " dev-9 "),
            ("LOCKD_HEARTBEAT_INTERVAL_SECS", "60"),
            ("LOCKD_BACKOFF_BASE_SECS", "2"),
            ("LOCKD_INSTALL_COMMAND", "pm install -r"),
            ("LOCKD_SUPPORT_CONTACT", ""),
        ]))
        .expect("config");
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/lockd"));
        assert_eq!(cfg.device_id, "dev-9");
        assert_eq!(cfg.intervals.heartbeat, Duration::from_secs(60));
        assert_eq!(cfg.backoff.base_ms, 2000);
        assert_eq!(cfg.install_command, Some(vec!["pm".into(), "install".into(), "-r".into()]));
        assert_eq!(cfg.support_contact, None);
        assert_eq!(cfg.control_socket(), PathBuf::from("/tmp/lockd/lockd.sock"));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = HostConfig::from_lookup(lookup(&[("LOCKD_HEARTBEAT_INTERVAL_SECS", "soon")]))
            .expect_err("bad number");
        assert!(err.to_string().contains("LOCKD_HEARTBEAT_INTERVAL_SECS"));
    }

    #[test]
    fn validate_requires_identity_and_key() {
        let mut cfg = HostConfig::default();
        assert!(cfg.validate().is_err());
        cfg.device_id = "dev-1".into();
        assert!(cfg.validate().is_err());
        cfg.backend_public_key = Some("00".repeat(32));
        assert!(cfg.validate().is_ok());
        cfg.backend_url = "mailto:ops@example.com".into();
        assert!(cfg.validate().is_err());
    }
}
