//! Invalidator (spec §4.6): the mutation pipeline's single entry point into
//! the store, turning a batch of invalidation topics into retracted
//! DatalogQuery cache entries and a set of sessions to refresh.

use std::collections::HashSet;

use tracing::instrument;

use crate::entity_store::Db;
use crate::env::Env;
use crate::error::StoreError;
use crate::ids::{AppId, SessionId};
use crate::topic::Topic;
use crate::Store;

impl<E: Env> Store<E> {
    /// Ordered, one transaction:
    /// 1. AVE-scan `DatalogQuery.app_id`, topic-match against `iv_topics`.
    /// 2. `processed_tx_id(app_id) = max(current, tx_id)`.
    /// 3. Mark the InstaqlQuery of every matched Subscription `stale?`.
    /// 4. Retract the matched DatalogQuery entities.
    /// 5. Collect the distinct session ids from step 3 and return them.
    ///
    /// Steps 3 and 5 run before step 4 within the same transaction, so the
    /// `datalog_query` references are still live when they're read.
    #[instrument(level = "debug", skip(self, iv_topics))]
    pub fn mark_stale_topics(&self, app_id: AppId, tx_id: u64, iv_topics: Vec<Topic>) -> Result<(Db<E>, HashSet<SessionId>), StoreError> {
        let (_before, after, sessions) = self.transact("mark_stale_topics", |_before, stage| {
            let matched = stage.find_matching_datalog(app_id, &iv_topics);
            stage.bump_processed_tx_id(app_id, tx_id);
            let sessions = stage.mark_stale_and_collect_sessions(&matched);
            stage.retract_datalog_entities(&matched);
            Ok(sessions)
        })?;
        Ok((after, sessions))
    }
}
