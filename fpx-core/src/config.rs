use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Runtime configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP listener binds to.
    pub port: u16,
    /// Path to the PHP-FPM Unix socket.
    pub socket: PathBuf,
    /// The single PHP entrypoint handed to FPM as SCRIPT_FILENAME.
    pub index_file: PathBuf,
    /// Logical application name, used as a metric label.
    pub app: String,
    /// Static directories served without touching FPM.
    pub static_mounts: Vec<StaticMount>,
    /// Number of persistent connections to FPM.
    pub fpm_pool_size: usize,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Emit access log entries.
    pub access_log: bool,
    /// Debug-level logging.
    pub verbose: bool,
}

/// One `<local_dir>:<prefix>` static folder mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMount {
    pub dir: PathBuf,
    /// URL prefix, starting with `/`, stored without a trailing slash.
    pub prefix: String,
}

pub fn parse_static_mount(raw: &str) -> Result<StaticMount> {
    let (dir, prefix) = raw.split_once(':').ok_or_else(|| {
        anyhow!("invalid static folder definition {raw:?} (expected <local_dir>:<prefix>)")
    })?;
    if dir.is_empty() {
        bail!("static folder directory must not be empty: {raw:?}");
    }
    if !prefix.starts_with('/') {
        bail!("static folder prefix must start with '/': {raw:?}");
    }
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        bail!("static folder prefix must not be the root: {raw:?}");
    }
    Ok(StaticMount {
        dir: PathBuf::from(dir),
        prefix: prefix.to_string(),
    })
}

/// Parses durations in the `500ms` / `30s` / `1m` flag forms.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        let ms = ms
            .parse::<u64>()
            .map_err(|_| format!("invalid milliseconds: {raw:?}"))?;
        return Ok(Duration::from_millis(ms));
    }
    if let Some(minutes) = raw.strip_suffix('m') {
        let minutes = minutes
            .parse::<u64>()
            .map_err(|_| format!("invalid minutes: {raw:?}"))?;
        return Ok(Duration::from_secs(minutes * 60));
    }
    if let Some(secs) = raw.strip_suffix('s') {
        let secs = secs
            .parse::<f64>()
            .map_err(|_| format!("invalid seconds: {raw:?}"))?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(format!("invalid seconds: {raw:?}"));
        }
        return Ok(Duration::from_secs_f64(secs));
    }
    Err(format!(
        "invalid duration {raw:?} (expected e.g. \"500ms\", \"30s\" or \"1m\")"
    ))
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.socket.as_os_str().is_empty() {
            bail!("socket path must not be empty");
        }
        if self.index_file.as_os_str().is_empty() {
            bail!("index file path must not be empty");
        }
        if self.fpm_pool_size == 0 {
            bail!("fpm pool size must be at least 1");
        }
        if self.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn log_startup(&self) {
        let static_mounts = self
            .static_mounts
            .iter()
            .map(|m| format!("{}:{}", m.dir.display(), m.prefix))
            .collect::<Vec<_>>()
            .join(",");
        info!(
            port = self.port,
            socket = %self.socket.display(),
            index_file = %self.index_file.display(),
            app = %self.app,
            static_mounts = %static_mounts,
            fpm_pool_size = self.fpm_pool_size,
            timeout = ?self.timeout,
            access_log = self.access_log,
            verbose = self.verbose,
            "configuration loaded"
        );
    }
}
