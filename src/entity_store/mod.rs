//! The indexed in-memory database (spec §4.1).
//!
//! A single process-wide store of the five entity kinds in spec §3, each
//! with its own attribute-value (AVE) and composite-unique indexes, behind
//! one write path (`Store::transact`). Grounded on `ankurah-core::node::Node`'s
//! "one struct, one lock per concern" shape and `ankurah-index`'s
//! dashmap-per-index reactor prototype — adapted here to a fixed, closed
//! schema of five entity kinds rather than an open-ended collection set.

pub mod rows;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::instrument;

use crate::env::Env;
use crate::error::StoreError;
use crate::ids::{AppId, Eid, EidGen, QueryKey, SessionId};
use crate::topic::{topics_intersect, Topic};

use rows::{Auth, DatalogRow, InstaqlRow, ReturnType, SessionRow, SubscriptionRow, TxMetaRow};

/// An immutable snapshot of the database. Cheap to clone (an `Arc` bump).
/// Readers that hold a `Db` never observe the effects of a transaction
/// scheduled after they obtained it.
pub type Db<E> = Arc<DbInner<E>>;

/// The tables themselves. See spec §3 for the logical entity shapes this
/// indexes.
pub struct DbInner<E: Env> {
    sessions: HashMap<Eid, SessionRow<E::Socket, E::Loader>>,
    session_by_uuid: HashMap<SessionId, Eid>,

    tx_meta: HashMap<AppId, TxMetaRow>,

    instaql: HashMap<Eid, InstaqlRow>,
    instaql_by_identity: HashMap<(SessionId, QueryKey), Eid>,
    instaql_by_session: HashMap<SessionId, HashSet<Eid>>,

    datalog: HashMap<Eid, DatalogRow<E::Delay>>,
    datalog_by_identity: HashMap<(AppId, QueryKey), Eid>,
    datalog_by_app: HashMap<AppId, HashSet<Eid>>,

    subscriptions: HashMap<Eid, SubscriptionRow>,
    sub_by_session: HashMap<SessionId, HashSet<Eid>>,
    sub_by_identity: HashMap<(SessionId, QueryKey), HashSet<Eid>>,
    sub_by_datalog: HashMap<Eid, HashSet<Eid>>,
}

impl<E: Env> Clone for DbInner<E> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            session_by_uuid: self.session_by_uuid.clone(),
            tx_meta: self.tx_meta.clone(),
            instaql: self.instaql.clone(),
            instaql_by_identity: self.instaql_by_identity.clone(),
            instaql_by_session: self.instaql_by_session.clone(),
            datalog: self.datalog.clone(),
            datalog_by_identity: self.datalog_by_identity.clone(),
            datalog_by_app: self.datalog_by_app.clone(),
            subscriptions: self.subscriptions.clone(),
            sub_by_session: self.sub_by_session.clone(),
            sub_by_identity: self.sub_by_identity.clone(),
            sub_by_datalog: self.sub_by_datalog.clone(),
        }
    }
}

impl<E: Env> Default for DbInner<E> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            session_by_uuid: HashMap::new(),
            tx_meta: HashMap::new(),
            instaql: HashMap::new(),
            instaql_by_identity: HashMap::new(),
            instaql_by_session: HashMap::new(),
            datalog: HashMap::new(),
            datalog_by_identity: HashMap::new(),
            datalog_by_app: HashMap::new(),
            subscriptions: HashMap::new(),
            sub_by_session: HashMap::new(),
            sub_by_identity: HashMap::new(),
            sub_by_datalog: HashMap::new(),
        }
    }
}

// -- Read-only accessors, usable against either a pre- or post-tx snapshot --
impl<E: Env> DbInner<E> {
    pub fn session(&self, id: SessionId) -> Option<&SessionRow<E::Socket, E::Loader>> {
        self.session_by_uuid.get(&id).and_then(|eid| self.sessions.get(eid))
    }

    pub fn processed_tx_id(&self, app_id: AppId) -> u64 { self.tx_meta.get(&app_id).map(|t| t.processed_tx_id).unwrap_or(0) }

    pub fn instaql_by_identity(&self, session_id: SessionId, query_key: &QueryKey) -> Option<&InstaqlRow> {
        self.instaql_by_identity.get(&(session_id, query_key.clone())).and_then(|eid| self.instaql.get(eid))
    }

    pub fn datalog_exists(&self, eid: Eid) -> bool { self.datalog.contains_key(&eid) }

    pub fn datalog_topics(&self, eid: Eid) -> Option<&[Topic]> { self.datalog.get(&eid).map(|d| d.topics.as_slice()) }

    /// AVE lookup: every DatalogQuery entity for a given `app_id`.
    pub fn datalog_datoms_by_app(&self, app_id: AppId) -> impl Iterator<Item = (Eid, &DatalogRow<E::Delay>)> {
        self.datalog_by_app.get(&app_id).into_iter().flatten().filter_map(move |eid| self.datalog.get(eid).map(|row| (*eid, row)))
    }

    /// Every Subscription referencing a given DatalogQuery entity (the
    /// reference index used by the orphan sweep and the invalidator).
    pub fn subscriptions_by_datalog(&self, datalog_eid: Eid) -> impl Iterator<Item = &SubscriptionRow> {
        self.sub_by_datalog.get(&datalog_eid).into_iter().flatten().filter_map(move |eid| self.subscriptions.get(eid))
    }

    /// Invariant check (spec §8): every Subscription's `datalog_query`
    /// reference resolves to a live DatalogQuery.
    pub fn all_subscription_references_live(&self) -> bool { self.subscriptions.values().all(|s| self.datalog.contains_key(&s.datalog_query)) }

    /// Every InstaqlQuery currently marked `stale?` for a given session.
    pub fn stale_instaql_queries_for_session(&self, session_id: SessionId) -> Vec<serde_json::Value> {
        self.instaql_by_session
            .get(&session_id)
            .into_iter()
            .flatten()
            .filter_map(|eid| self.instaql.get(eid))
            .filter(|row| row.stale)
            .map(|row| row.query.clone())
            .collect()
    }

    /// Invariant check (spec §8): no DatalogQuery lacks an incoming
    /// Subscription reference.
    pub fn no_orphan_datalog(&self) -> bool {
        self.datalog.keys().all(|eid| self.sub_by_datalog.get(eid).is_some_and(|s| !s.is_empty()))
    }
}

/// The mutable staging area a `transact` closure composes ops against. Each
/// method both mutates the working copy and is itself a "transaction op" in
/// the sense of spec §4.1 — later calls within the same closure observe the
/// effects of earlier ones, which is what lets `add_instaql_query` compose
/// "retract stale subscriptions, then sweep orphans, then update hash" as
/// one atomic unit.
pub struct TxStage<'a, E: Env> {
    working: DbInner<E>,
    eids: &'a EidGen,
    ops: Vec<&'static str>,
}

impl<'a, E: Env> TxStage<'a, E> {
    fn log(&mut self, op: &'static str) { self.ops.push(op); }

    pub fn db(&self) -> &DbInner<E> { &self.working }

    /// Translates a missing session-entity lookup into `SessionMissing`
    /// (spec §7), for ops keyed by a session id that — unlike the session
    /// registry ops themselves — do not upsert the session on first use.
    pub fn require_session(&self, session_id: SessionId) -> Result<(), StoreError> {
        if self.working.session_by_uuid.contains_key(&session_id) {
            Ok(())
        } else {
            Err(StoreError::SessionMissing(session_id))
        }
    }

    // ---- Session registry (spec §4.3) ----

    fn ensure_session(&mut self, id: SessionId) -> Eid {
        if let Some(eid) = self.working.session_by_uuid.get(&id) {
            return *eid;
        }
        let eid = self.eids.next();
        self.working.sessions.insert(eid, SessionRow::default());
        self.working.session_by_uuid.insert(id, eid);
        eid
    }

    pub fn add_socket(&mut self, id: SessionId, socket: Arc<E::Socket>) {
        let eid = self.ensure_session(id);
        self.working.sessions.get_mut(&eid).unwrap().socket = Some(socket);
        self.log("add_socket");
    }

    pub fn set_auth(&mut self, id: SessionId, auth: Auth) {
        let eid = self.ensure_session(id);
        self.working.sessions.get_mut(&eid).unwrap().auth = Some(auth);
        self.log("set_auth");
    }

    pub fn set_creator(&mut self, id: SessionId, creator: serde_json::Value) {
        let eid = self.ensure_session(id);
        self.working.sessions.get_mut(&eid).unwrap().creator = Some(creator);
        self.log("set_creator");
    }

    pub fn set_session_props(&mut self, id: SessionId, auth: Option<Auth>, creator: Option<serde_json::Value>, versions: Option<HashMap<String, String>>) {
        let eid = self.ensure_session(id);
        let row = self.working.sessions.get_mut(&eid).unwrap();
        if let Some(auth) = auth {
            row.auth = Some(auth);
        }
        if let Some(creator) = creator {
            row.creator = Some(creator);
        }
        if let Some(versions) = versions {
            row.versions = versions;
        }
        self.log("set_session_props");
    }

    pub fn upsert_datalog_loader(&mut self, id: SessionId, loader: E::Loader) {
        let eid = self.ensure_session(id);
        self.working.sessions.get_mut(&eid).unwrap().datalog_loader = Some(loader);
        self.log("upsert_datalog_loader");
    }

    /// Atomic cascade: retract the session, its InstaqlQueries, its
    /// Subscriptions, then sweep orphaned DatalogQueries. No-op if the
    /// session does not exist.
    pub fn remove_session(&mut self, id: SessionId) {
        let Some(&eid) = self.working.session_by_uuid.get(&id) else { return };

        if let Some(instaql_eids) = self.working.instaql_by_session.remove(&id) {
            for iq_eid in instaql_eids {
                if let Some(row) = self.working.instaql.remove(&iq_eid) {
                    let key = QueryKey::new(&row.query);
                    self.working.instaql_by_identity.remove(&(id, key));
                }
            }
        }

        self.retract_subscriptions_for_session(id);

        self.working.sessions.remove(&eid);
        self.working.session_by_uuid.remove(&id);

        self.sweep_orphan_datalog();
        self.log("remove_session");
    }

    fn retract_subscriptions_for_session(&mut self, session_id: SessionId) {
        if let Some(sub_eids) = self.working.sub_by_session.remove(&session_id) {
            for sub_eid in sub_eids {
                self.retract_subscription(sub_eid);
            }
        }
    }

    fn retract_subscription(&mut self, sub_eid: Eid) {
        let Some(row) = self.working.subscriptions.remove(&sub_eid) else { return };
        let key = row.instaql_query_key.clone();
        if let Some(set) = self.working.sub_by_session.get_mut(&row.session_id) {
            set.remove(&sub_eid);
        }
        if let Some(set) = self.working.sub_by_identity.get_mut(&(row.session_id, key)) {
            set.remove(&sub_eid);
        }
        if let Some(set) = self.working.sub_by_datalog.get_mut(&row.datalog_query) {
            set.remove(&sub_eid);
        }
    }

    /// Orphan sweep (spec §4.5): retract every DatalogQuery with no
    /// incoming Subscription reference. Run inside every transaction that
    /// removes Subscriptions.
    pub fn sweep_orphan_datalog(&mut self) {
        let orphans: Vec<Eid> = self
            .working
            .datalog
            .keys()
            .copied()
            .filter(|eid| self.working.sub_by_datalog.get(eid).is_none_or(|s| s.is_empty()))
            .collect();
        for eid in orphans {
            self.retract_datalog(eid);
        }
        self.log("sweep_orphan_datalog");
    }

    /// Retract a DatalogQuery entity and every Subscription still pointing
    /// at it — a Subscription's `datalog_query` reference must never
    /// dangle (spec §3, §7), so this cannot stop at clearing the reverse
    /// index.
    fn retract_datalog(&mut self, eid: Eid) {
        if let Some(row) = self.working.datalog.remove(&eid) {
            let key = QueryKey::new(&row.query);
            if let Some(set) = self.working.datalog_by_app.get_mut(&row.app_id) {
                set.remove(&eid);
            }
            self.working.datalog_by_identity.remove(&(row.app_id, key));
            if let Some(sub_eids) = self.working.sub_by_datalog.remove(&eid) {
                for sub_eid in sub_eids {
                    self.retract_subscription(sub_eid);
                }
            }
        }
    }

    // ---- Subscription graph (spec §4.4) ----

    /// If the `(session_id, query)` identity exists, increment its version
    /// and clear `stale?`; otherwise create it with `version = 1`. Returns
    /// the new version.
    pub fn bump_instaql_version(&mut self, session_id: SessionId, query: serde_json::Value, return_type: ReturnType) -> u32 {
        let key = QueryKey::new(&query);
        if let Some(&eid) = self.working.instaql_by_identity.get(&(session_id, key.clone())) {
            let row = self.working.instaql.get_mut(&eid).unwrap();
            row.version += 1;
            row.stale = false;
            self.log("bump_instaql_version");
            return row.version;
        }

        let eid = self.eids.next();
        self.working.instaql.insert(
            eid,
            InstaqlRow { session_id, query, stale: false, version: 1, hash: None, return_type },
        );
        self.working.instaql_by_identity.insert((session_id, key), eid);
        self.working.instaql_by_session.entry(session_id).or_default().insert(eid);
        self.log("bump_instaql_version");
        1
    }

    /// Retract Subscriptions whose `(session_id, instaql_query)` matches and
    /// whose `v < before_v`.
    pub fn retract_stale_subscriptions(&mut self, session_id: SessionId, query_key: &QueryKey, before_v: u32) {
        let Some(sub_eids) = self.working.sub_by_identity.get(&(session_id, query_key.clone())) else { return };
        let stale: Vec<Eid> = sub_eids
            .iter()
            .copied()
            .filter(|eid| self.working.subscriptions.get(eid).is_some_and(|s| s.v < before_v))
            .collect();
        for eid in stale {
            self.retract_subscription(eid);
        }
        self.log("retract_stale_subscriptions");
    }

    pub fn set_instaql_hash(&mut self, session_id: SessionId, query_key: &QueryKey, hash: Option<String>) {
        if let Some(&eid) = self.working.instaql_by_identity.get(&(session_id, query_key.clone())) {
            self.working.instaql.get_mut(&eid).unwrap().hash = hash;
        }
        self.log("set_instaql_hash");
    }

    pub fn instaql_hash(&self, session_id: SessionId, query_key: &QueryKey) -> Option<Option<String>> {
        self.working.instaql_by_identity.get(&(session_id, query_key.clone())).map(|eid| self.working.instaql[eid].hash.clone())
    }

    /// Atomic: retract the InstaqlQuery identity, all its Subscriptions, then
    /// sweep orphan DatalogQueries.
    pub fn remove_query(&mut self, session_id: SessionId, query_key: &QueryKey) {
        if let Some(eid) = self.working.instaql_by_identity.remove(&(session_id, query_key.clone())) {
            self.working.instaql.remove(&eid);
            if let Some(set) = self.working.instaql_by_session.get_mut(&session_id) {
                set.remove(&eid);
            }
        }
        if let Some(sub_eids) = self.working.sub_by_identity.remove(&(session_id, query_key.clone())) {
            for eid in sub_eids {
                self.retract_subscription(eid);
            }
        }
        self.sweep_orphan_datalog();
        self.log("remove_query");
    }

    // ---- Datalog cache (spec §4.5) ----

    /// If the entity exists without topics, attach `coarse_topics`; if
    /// absent, create it with `coarse_topics`. Returns the entity's eid.
    pub fn record_datalog_query_start(&mut self, app_id: AppId, query: serde_json::Value, coarse_topics: Vec<Topic>) -> Eid {
        let key = QueryKey::new(&query);
        if let Some(&eid) = self.working.datalog_by_identity.get(&(app_id, key.clone())) {
            let row = self.working.datalog.get_mut(&eid).unwrap();
            if row.topics.is_empty() {
                row.topics = coarse_topics;
            }
            self.log("record_datalog_query_start");
            return eid;
        }

        let eid = self.eids.next();
        self.working.datalog.insert(eid, DatalogRow { app_id, query, delayed_call: None, topics: coarse_topics });
        self.working.datalog_by_identity.insert((app_id, key), eid);
        self.working.datalog_by_app.entry(app_id).or_default().insert(eid);
        self.log("record_datalog_query_start");
        eid
    }

    pub fn insert_subscription(&mut self, app_id: AppId, session_id: SessionId, instaql_query: serde_json::Value, v: u32, datalog_query: Eid) {
        let key = QueryKey::new(&instaql_query);
        let eid = self.eids.next();
        self.working.subscriptions.insert(
            eid,
            SubscriptionRow { app_id, session_id, instaql_query, instaql_query_key: key.clone(), datalog_query, v },
        );
        self.working.sub_by_session.entry(session_id).or_default().insert(eid);
        self.working.sub_by_identity.entry((session_id, key)).or_default().insert(eid);
        self.working.sub_by_datalog.entry(datalog_query).or_default().insert(eid);
        self.log("insert_subscription");
    }

    pub fn set_datalog_topics_on_finish(&mut self, app_id: AppId, query_key: &QueryKey, topics: Vec<Topic>) {
        if let Some(&eid) = self.working.datalog_by_identity.get(&(app_id, query_key.clone())) {
            self.working.datalog.get_mut(&eid).unwrap().topics = topics;
        }
        self.log("record_datalog_query_finish");
    }

    /// Single-flight: if the entity exists and already has a `delayed_call`,
    /// return that one; otherwise install `new_delay` and return it.
    pub fn swap_datalog_cache_delay(&mut self, app_id: AppId, query: serde_json::Value, new_delay: E::Delay) -> E::Delay {
        let key = QueryKey::new(&query);
        let eid = match self.working.datalog_by_identity.get(&(app_id, key.clone())) {
            Some(&eid) => eid,
            None => {
                let eid = self.eids.next();
                self.working.datalog.insert(eid, DatalogRow { app_id, query, delayed_call: None, topics: Vec::new() });
                self.working.datalog_by_identity.insert((app_id, key), eid);
                self.working.datalog_by_app.entry(app_id).or_default().insert(eid);
                eid
            }
        };
        let row = self.working.datalog.get_mut(&eid).unwrap();
        let effective = match &row.delayed_call {
            Some(existing) => existing.clone(),
            None => {
                row.delayed_call = Some(new_delay.clone());
                new_delay
            }
        };
        self.log("swap_datalog_cache_delay");
        effective
    }

    // ---- Invalidator (spec §4.6) ----

    /// Step 1: AVE scan of `DatalogQuery.app_id`, topic-matched against
    /// `iv_topics`.
    pub fn find_matching_datalog(&self, app_id: AppId, iv_topics: &[Topic]) -> HashSet<Eid> {
        self.working.datalog_by_app.get(&app_id).into_iter().flatten().copied().filter(|eid| {
            self.working.datalog.get(eid).is_some_and(|row| topics_intersect(iv_topics, &row.topics))
        }).collect()
    }

    /// Step 2: `processed_tx_id(app_id) = max(current, tx_id)`.
    pub fn bump_processed_tx_id(&mut self, app_id: AppId, tx_id: u64) {
        let entry = self.working.tx_meta.entry(app_id).or_default();
        entry.processed_tx_id = entry.processed_tx_id.max(tx_id);
        self.log("bump_processed_tx_id");
    }

    /// Steps 3 & 5: for every Subscription referencing a matched
    /// DatalogQuery, mark its InstaqlQuery stale and collect the session
    /// ids — all read against the still-intact (pre-retract) working state.
    pub fn mark_stale_and_collect_sessions(&mut self, matched_datalog: &HashSet<Eid>) -> HashSet<SessionId> {
        let mut sessions = HashSet::new();
        let mut to_mark: Vec<(SessionId, QueryKey)> = Vec::new();
        for &dq_eid in matched_datalog {
            for sub_eid in self.working.sub_by_datalog.get(&dq_eid).into_iter().flatten() {
                if let Some(sub) = self.working.subscriptions.get(sub_eid) {
                    sessions.insert(sub.session_id);
                    to_mark.push((sub.session_id, sub.instaql_query_key.clone()));
                }
            }
        }
        for (session_id, key) in to_mark {
            if let Some(&eid) = self.working.instaql_by_identity.get(&(session_id, key)) {
                self.working.instaql.get_mut(&eid).unwrap().stale = true;
            }
        }
        self.log("mark_stale_and_collect_sessions");
        sessions
    }

    /// Step 4: retract the matched DatalogQuery entities themselves.
    pub fn retract_datalog_entities(&mut self, matched_datalog: &HashSet<Eid>) {
        for &eid in matched_datalog {
            self.retract_datalog(eid);
        }
        self.log("retract_datalog_entities");
    }
}

/// The transactional entity store handle. Cloning is a cheap `Arc` bump;
/// all clones share the same underlying tables.
pub struct Store<E: Env> {
    current: RwLock<Db<E>>,
    write_lock: Mutex<()>,
    eids: EidGen,
}

impl<E: Env> Store<E> {
    pub fn new() -> Self { Self { current: RwLock::new(Arc::new(DbInner::default())), write_lock: Mutex::new(()), eids: EidGen::new() } }

    /// A stable read-only snapshot. Readers never observe a transaction
    /// scheduled after this call returns.
    pub fn snapshot(&self) -> Db<E> { self.current.read().unwrap().clone() }

    /// Submit a transaction function: it receives the pre-transaction
    /// database and a mutable staging area to compose ops against. All ops
    /// staged in one call apply atomically. Concurrent `transact` calls are
    /// serialized by `write_lock`; readers on the snapshot returned before
    /// this call never see its effects.
    #[instrument(level = "debug", skip(self, f), fields(tag))]
    pub fn transact<R>(&self, tag: &'static str, f: impl FnOnce(&DbInner<E>, &mut TxStage<'_, E>) -> Result<R, StoreError>) -> Result<(Db<E>, Db<E>, R), StoreError> {
        let _write_guard = self.write_lock.lock().unwrap();

        let db_before = self.current.read().unwrap().clone();
        let mut stage = TxStage { working: (*db_before).clone(), eids: &self.eids, ops: Vec::new() };

        let result = f(&db_before, &mut stage)?;

        let db_after = Arc::new(stage.working);
        *self.current.write().unwrap() = db_after.clone();

        tracing::debug!(tag, ops = ?stage.ops, "transact committed");
        Ok((db_before, db_after, result))
    }
}

impl<E: Env> Default for Store<E> {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AppId;

    struct TestSocket;
    impl crate::env::SocketSink for TestSocket {
        fn send(&self, _event: &serde_json::Value) -> Result<(), anyhow::Error> { Ok(()) }
    }

    struct TestEnv;
    impl Env for TestEnv {
        type Socket = TestSocket;
        type Delay = Arc<str>;
        type Loader = ();
    }

    #[test]
    fn transact_is_atomic_and_snapshot_stable() {
        let store: Store<TestEnv> = Store::new();
        let before = store.snapshot();

        let sid = SessionId::new_v4();
        let (_db_before, db_after, _) = store
            .transact("test", |_before, stage| {
                stage.add_socket(sid, Arc::new(TestSocket));
                Ok(())
            })
            .unwrap();

        assert!(before.session(sid).is_none(), "snapshot taken before the tx must not see its effects");
        assert!(db_after.session(sid).is_some());
        assert!(store.snapshot().session(sid).is_some());
    }

    #[test]
    fn orphan_sweep_runs_on_subscription_removal() {
        let store: Store<TestEnv> = Store::new();
        let sid = SessionId::new_v4();
        let app = AppId(1);
        let query = serde_json::json!({"todos": {}});

        store
            .transact("setup", |_before, stage| {
                stage.bump_instaql_version(sid, query.clone(), ReturnType::JoinRows);
                let dq_eid = stage.record_datalog_query_start(app, serde_json::json!(["ea"]), vec![]);
                stage.insert_subscription(app, sid, query.clone(), 1, dq_eid);
                Ok(())
            })
            .unwrap();

        let (_, db_after, _) = store.transact("remove", |_before, stage| {
            stage.remove_query(sid, &QueryKey::new(&query));
            Ok(())
        }).unwrap();

        assert!(db_after.no_orphan_datalog());
        assert_eq!(db_after.datalog_datoms_by_app(app).count(), 0);
    }
}
