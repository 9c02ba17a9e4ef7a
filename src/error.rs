//! Public error types for the reactive query store.
//!
//! Mirrors `ankurah-core::error`'s split between typed, recoverable errors
//! and a `Failure`-style escape hatch for internal invariant violations.

use thiserror::Error;
use uuid::Uuid;

/// Error type for the store's transactional entry points.
///
/// Returned from: `transact` and every operation built on top of it
/// (`bump_instaql_version`, `add_instaql_query`, `remove_query`,
/// `record_datalog_query_*`, `mark_stale_topics`, session-registry ops).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Any lookup keyed by `(session_id, ...)` whose session entity does not
    /// exist. Non-fatal; the caller (gateway) should drop the request.
    #[error("session not found: {0}")]
    SessionMissing(Uuid),

    /// A composite-unique conflict or a dangling reference surfaced mid
    /// transaction. Indicates a programming error in the store itself;
    /// callers should treat this as fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Error type for `send_event`/`try_send_event`.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The session exists but has no socket bound.
    #[error("no socket bound for session {0}")]
    Missing(Uuid),

    /// The transport failed to deliver the frame.
    #[error("socket send failed for session {0}: {1}")]
    Send(Uuid, #[source] anyhow::Error),
}
