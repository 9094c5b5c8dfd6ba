//! Error kinds the core distinguishes. All of them are reported
//! through a [`crate::reporter::Reporter`] rather than unwound out of a
//! background task -- see `session.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapError {
    #[error("pgsnap: malformed snapshot at line {line}: {detail}")]
    ScriptMalformed { line: usize, detail: String },

    #[error("pgsnap: client exited early")]
    ClientEof,

    #[error("pgsnap: upstream exited early")]
    UpstreamEof,

    #[error("pgsnap: {0}")]
    StepMismatch(String),

    #[error("pgsnap: timeout waiting for session to finish")]
    Timeout,

    #[error("pgsnap: teardown callback failed: {0}")]
    Teardown(String),

    #[error("pgsnap: setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Connection(#[from] pq_proto::ConnectionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
