//! Identifiers used throughout the store.

use std::sync::atomic::{AtomicU64, Ordering};

pub use uuid::Uuid;

/// Internal row identifier for an entity in the indexed store. Never exposed
/// across the store's public API — callers address rows by their logical
/// identity (a session uuid, an `(app_id, query)` pair, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eid(u64);

/// Monotonic generator for `Eid`s, mirroring `ankurah-index`'s
/// `AtomicUsize`-backed subscription-id counter.
#[derive(Debug, Default)]
pub struct EidGen(AtomicU64);

impl EidGen {
    pub fn new() -> Self { Self(AtomicU64::new(1)) }

    pub fn next(&self) -> Eid { Eid(self.0.fetch_add(1, Ordering::Relaxed)) }
}

/// A connected client session's identity. Sessions are upsertable by this key.
pub type SessionId = Uuid;

/// Identifies an app (tenant). Opaque beyond ordering/equality for indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(pub u64);

/// A mutation ingest transaction id. Monotonically non-decreasing per `AppId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TxId(pub u64);

/// Canonical byte key derived from an opaque query payload (`serde_json::Value`),
/// used to index and compare queries that are otherwise structurally opaque to
/// the store. Two queries are the "same identity" iff their canonical encoding
/// matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<u8>);

impl QueryKey {
    pub fn new(query: &serde_json::Value) -> Self {
        // serde_json::to_vec is deterministic for a given Value's internal
        // representation (object key order is preserve-on-insert); callers
        // are expected to construct query values consistently for the same
        // logical query, as the spec treats `query` as an opaque identity.
        QueryKey(serde_json::to_vec(query).expect("query value must be serializable"))
    }
}
