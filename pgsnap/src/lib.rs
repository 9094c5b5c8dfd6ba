//! Record/replay test harness for the PostgreSQL v3 wire protocol.
//!
//! A test constructs a [`SnapSession`], gets back a loopback
//! `postgres://...` connection string, points its SQL client at it, and
//! calls [`SnapSession::finish`] when the test body is done. Depending on
//! whether a snapshot file already exists for the test, the session either
//! replays a previously recorded conversation (script mode) or transparently
//! proxies to a real upstream PostgreSQL while recording the conversation to
//! that file (record mode). The client never learns which.
//!
//! ```no_run
//! # async fn run() -> Result<(), pgsnap::SnapError> {
//! use pgsnap::{SnapConfig, SnapSession};
//!
//! let config = SnapConfig::from_env_and("postgres://user@localhost/mydb", "testdata/my_test.txt");
//! let session = SnapSession::start("my_test", config).await?;
//! let _client_dsn = session.connection_url();
//! // ... point a postgres client at _client_dsn, run the test body ...
//! session.finish().await
//! # }
//! ```

mod config;
mod error;
mod listener;
mod matcher;
mod preamble;
mod proxy;
mod replay;
mod reporter;
mod session;
mod snapshot;

pub use config::SnapConfig;
pub use error::SnapError;
pub use reporter::{CollectingReporter, PanicReporter, Reporter};
pub use session::{Mode, SnapSession};
pub use snapshot::{Direction, Step};

/// Derive the conventional snapshot path for a given test name:
/// `<name>.txt`, with `/` (nested subtests) and spaces folded to `_` so the
/// result is always a single path-safe component.
///
/// Deriving this is the caller's adapter's job, not this crate's, but it's
/// offered as a free function so callers don't have to reinvent it.
/// [`SnapSession`] never calls this itself -- it always takes an explicit
/// `snapshot_path`.
pub fn snapshot_path_for(test_name: &str) -> std::path::PathBuf {
    let sanitized: String = test_name
        .chars()
        .map(|c| if c == '/' || c == ' ' { '_' } else { c })
        .collect();
    std::path::PathBuf::from(format!("{sanitized}.txt"))
}

/// Install a `tracing_subscriber` `EnvFilter` subscriber scoped to this
/// crate's `pgsnap` target, raising it to `debug` when `PGSNAP_DEBUG=true`.
/// Idempotent: a second call after a global subscriber is already installed
/// is a no-op error that callers can safely ignore.
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if debug { "pgsnap=debug" } else { "pgsnap=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_path_for_folds_slashes_and_spaces() {
        assert_eq!(
            snapshot_path_for("TestFoo/sub case"),
            std::path::PathBuf::from("TestFoo_sub_case.txt")
        );
    }

    #[test]
    fn snapshot_path_for_plain_name_is_unchanged() {
        assert_eq!(
            snapshot_path_for("TestFoo"),
            std::path::PathBuf::from("TestFoo.txt")
        );
    }
}
