//! Board error taxonomy.
//!
//! Every mutation error leaves stored state unchanged. Coordination-signal
//! paths (presence, editing) never surface errors at all — they are
//! best-effort and swallow failures as no-ops.

use crate::board::model::Task;

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    /// Bad input: empty, duplicate, or reserved title. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Optimistic-concurrency failure: the caller's version is stale.
    /// Carries the authoritative server-side task so the caller can
    /// reconcile and re-submit. No server-side merge is attempted.
    #[error("task was modified by someone else")]
    Conflict { current: Box<Task> },

    #[error("task not found")]
    NotFound,

    /// Smart-assign found no users to choose from.
    #[error("no users available for assignment")]
    NoEligibleUser,

    /// Persistence collaborator failure (including query timeouts).
    /// Surfaced as-is — never masked as one of the domain errors above.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type BoardResult<T> = Result<T, BoardError>;
