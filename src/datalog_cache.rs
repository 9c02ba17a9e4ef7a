//! Datalog cache (spec §4.5): single-flight evaluation coordination and the
//! DatalogQuery topic cache that the invalidator scans.

use tracing::instrument;

use crate::env::Env;
use crate::error::StoreError;
use crate::ids::{AppId, QueryKey, SessionId};
use crate::topic::Topic;
use crate::Store;

impl<E: Env> Store<E> {
    /// At-most-one-evaluation-per-key: if the entity exists and already has
    /// a `delayed_call`, return that one; otherwise install `new_delay` and
    /// return it. Callers execute the returned delay, so concurrent
    /// requests for the same `(app_id, query)` share one computation.
    #[instrument(level = "debug", skip(self, query, new_delay))]
    pub fn swap_datalog_cache_delay(&self, app_id: AppId, query: serde_json::Value, new_delay: E::Delay) -> Result<E::Delay, StoreError> {
        self.transact("swap_datalog_cache_delay", |_before, stage| Ok(stage.swap_datalog_cache_delay(app_id, query.clone(), new_delay.clone())))
            .map(|(.., d)| d)
    }

    /// If the DatalogQuery exists without topics, attach `coarse_topics`; if
    /// absent, create it with them. In the same transaction, insert the
    /// Subscription edge linking the InstaqlQuery to this DatalogQuery.
    #[instrument(level = "debug", skip(self, query, instaql_query, coarse_topics))]
    pub fn record_datalog_query_start(
        &self,
        app_id: AppId,
        session_id: SessionId,
        query: serde_json::Value,
        coarse_topics: Vec<Topic>,
        instaql_query: serde_json::Value,
        v: u32,
    ) -> Result<(), StoreError> {
        self.transact("record_datalog_query_start", |_before, stage| {
            stage.require_session(session_id)?;
            let dq_eid = stage.record_datalog_query_start(app_id, query, coarse_topics);
            stage.insert_subscription(app_id, session_id, instaql_query, v, dq_eid);
            Ok(())
        })
        .map(|(.., r)| r)
    }

    /// Replace the DatalogQuery's `topics` with the refined set computed
    /// from the actual result.
    #[instrument(level = "debug", skip(self, query, topics))]
    pub fn record_datalog_query_finish(&self, app_id: AppId, query: &serde_json::Value, topics: Vec<Topic>) -> Result<(), StoreError> {
        let key = QueryKey::new(query);
        self.transact("record_datalog_query_finish", |_before, stage| {
            stage.set_datalog_topics_on_finish(app_id, &key, topics.clone());
            Ok(())
        })
        .map(|(.., r)| r)
    }
}
