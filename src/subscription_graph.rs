//! Subscription graph (spec §4.4): the InstaqlQuery state machine and its
//! Subscription edges into the datalog cache.

use tracing::instrument;

use crate::entity_store::rows::ReturnType;
use crate::error::StoreError;
use crate::ids::{QueryKey, SessionId};
use crate::Store;
use crate::env::Env;

/// Outcome of `add_instaql_query`: whether the gateway should transmit the
/// new result to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddInstaqlQueryOutcome {
    pub result_changed: bool,
}

impl<E: Env> Store<E> {
    /// If the `(session_id, query)` identity exists, increment its version
    /// and clear `stale?`; otherwise create it fresh with `version = 1`.
    #[instrument(level = "debug", skip(self, query))]
    pub fn bump_instaql_version(&self, session_id: SessionId, query: serde_json::Value, return_type: ReturnType) -> Result<u32, StoreError> {
        self.transact("bump_instaql_version", |_before, stage| {
            stage.require_session(session_id)?;
            Ok(stage.bump_instaql_version(session_id, query.clone(), return_type))
        })
        .map(|(.., v)| v)
    }

    /// 1. Retract Subscriptions whose `(session_id, instaql_query)` matches
    ///    and whose `v < ctx_v`.
    /// 2. Sweep orphan DatalogQueries.
    /// 3. If the InstaqlQuery identity still exists, set its `hash`.
    ///
    /// `result_changed?` is true iff the pre- and post-hash differ, or both
    /// are nil (forcing a send on the first evaluation).
    #[instrument(level = "debug", skip(self, query, result_hash))]
    pub fn add_instaql_query(
        &self,
        session_id: SessionId,
        query: serde_json::Value,
        ctx_v: u32,
        result_hash: Option<String>,
    ) -> Result<AddInstaqlQueryOutcome, StoreError> {
        let key = QueryKey::new(&query);
        let (.., outcome) = self.transact("add_instaql_query", |_before, stage| {
            stage.require_session(session_id)?;
            let prev_hash = stage.instaql_hash(session_id, &key).flatten();

            stage.retract_stale_subscriptions(session_id, &key, ctx_v);
            stage.sweep_orphan_datalog();
            stage.set_instaql_hash(session_id, &key, result_hash.clone());

            let result_changed = prev_hash != result_hash || (prev_hash.is_none() && result_hash.is_none());
            Ok(AddInstaqlQueryOutcome { result_changed })
        })?;
        Ok(outcome)
    }

    /// Atomic: retract the InstaqlQuery identity, all its Subscriptions,
    /// then sweep orphan DatalogQueries.
    #[instrument(level = "debug", skip(self, query))]
    pub fn remove_query(&self, session_id: SessionId, query: &serde_json::Value) -> Result<(), StoreError> {
        let key = QueryKey::new(query);
        self.transact("remove_query", |_before, stage| {
            stage.require_session(session_id)?;
            stage.remove_query(session_id, &key);
            Ok(())
        })
        .map(|(.., r)| r)
    }

    /// Every InstaqlQuery currently marked `stale?` for a given session —
    /// the gateway polls this after `mark_stale_topics` reports the session
    /// as affected.
    #[instrument(level = "debug", skip(self))]
    pub fn get_stale_instaql_queries(&self, session_id: SessionId) -> Vec<serde_json::Value> {
        let db = self.snapshot();
        db.stale_instaql_queries_for_session(session_id)
    }
}
