//! Error taxonomies for the runtime boundary and the control center client
//!
//! Runtime command failures and control-center responses are tagged enums so
//! call sites branch on variants instead of matching error-code strings.

use crate::models::WorkerId;
use thiserror::Error;

/// Errors surfaced by runtime adapter commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The worker has not produced a profile yet; retried on the next fetch
    /// attempt.
    #[error("no profile available")]
    NoProfileAvailable,

    /// The worker's event loop was too idle to produce a useful profile.
    #[error("not enough event loop utilization")]
    NotEnoughElu,

    /// Stop was issued for a session that never started; swallowed during
    /// shutdown.
    #[error("profiling not started")]
    ProfilingNotStarted,

    #[error("worker {0} not found")]
    WorkerNotFound(WorkerId),

    #[error("runtime command failed: {0}")]
    Failed(String),
}

impl CommandError {
    /// Codes that call sites silence to info logs instead of treating as
    /// failures.
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            CommandError::NoProfileAvailable | CommandError::NotEnoughElu
        )
    }
}

/// Errors from the control center HTTP client.
#[derive(Debug, Error)]
pub enum IccError {
    /// The control center predates the multi-alert attach endpoint; callers
    /// fall back to one upload per alert.
    #[error("attaching multiple alerts is not supported by this control center")]
    MultipleAlertsUnsupported,

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("invalid control center url: {0}")]
    Url(#[from] url::ParseError),

    #[error("auth provider failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}
