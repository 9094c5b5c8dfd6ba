//! Construction options for a [`crate::session::SnapSession`].

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// `PGSNAP_FORCE_WRITE=true` forces record mode regardless of what
/// [`SnapConfig::force_record`] was built with -- it's the documented
/// override, so it always wins when present.
const FORCE_WRITE_ENV: &str = "PGSNAP_FORCE_WRITE";
/// `PGSNAP_DEBUG=true` raises the session's logging verbosity.
const DEBUG_ENV: &str = "PGSNAP_DEBUG";

#[derive(Debug, Clone)]
pub struct SnapConfig {
    pub force_record: bool,
    pub timeout: Duration,
    pub debug: bool,
    pub upstream_dsn: String,
    pub snapshot_path: PathBuf,
}

impl SnapConfig {
    pub fn new(upstream_dsn: impl Into<String>, snapshot_path: impl Into<PathBuf>) -> Self {
        SnapConfig {
            force_record: false,
            timeout: DEFAULT_TIMEOUT,
            debug: false,
            upstream_dsn: upstream_dsn.into(),
            snapshot_path: snapshot_path.into(),
        }
    }

    pub fn with_force_record(mut self, force_record: bool) -> Self {
        self.force_record = force_record;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Apply the documented environment variable overrides on top of
    /// whatever was built explicitly. The env vars are a pure superset of
    /// the builder:
    /// they can only turn a flag *on*, matching the Go constructor's single
    /// `forceWrite bool` parameter plus this harness's documented override.
    pub fn from_env_and(upstream_dsn: impl Into<String>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self::new(upstream_dsn, snapshot_path).apply_env()
    }

    pub fn apply_env(mut self) -> Self {
        if env_flag(FORCE_WRITE_ENV) {
            self.force_record = true;
        }
        if env_flag(DEBUG_ENV) {
            self.debug = true;
        }
        self
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
