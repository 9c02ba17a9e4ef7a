use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reactive_query_store::entity_store::rows::{Auth, ReturnType};
use reactive_query_store::env::SocketSink;
use reactive_query_store::ids::{AppId, SessionId};
use reactive_query_store::topic::{CompareOp, Topic, TopicPart};
use reactive_query_store::value::Value;
use reactive_query_store::{Env, Store};

#[derive(Default)]
struct RecordingSocket {
    sent: Mutex<Vec<serde_json::Value>>,
}

impl SocketSink for RecordingSocket {
    fn send(&self, event: &serde_json::Value) -> Result<(), anyhow::Error> {
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct TestEnv;
impl Env for TestEnv {
    type Socket = RecordingSocket;
    type Delay = Arc<str>;
    type Loader = ();
}

fn kw(s: &str) -> TopicPart { TopicPart::Keyword(Value::Str(s.to_string())) }
fn set_of(vs: impl IntoIterator<Item = Value>) -> TopicPart { TopicPart::Set(vs.into_iter().collect()) }

#[test]
fn create_refresh_cycle() {
    let store: Store<TestEnv> = Store::new();
    let app = AppId(1);
    let s1 = SessionId::new_v4();
    let query = serde_json::json!({"todos": {}});

    store.add_socket(s1, Arc::new(RecordingSocket::default())).unwrap();
    store
        .set_session_props(s1, Some(Auth { app, user: serde_json::json!({"id": "u1"}), admin: false }), Some(serde_json::json!({"via": "test"})), None)
        .unwrap();

    let v = store.bump_instaql_version(s1, query.clone(), ReturnType::JoinRows).unwrap();
    assert_eq!(v, 1);

    let coarse: Vec<Topic> = vec![vec![kw("ea"), TopicPart::Wildcard, kw("title")]];
    store.record_datalog_query_start(app, s1, serde_json::json!(["ea", "?e", "title", "?v"]), coarse, query.clone(), v).unwrap();

    let refined: Vec<Topic> = vec![vec![kw("ea"), set_of([Value::Str("e1".into())]), kw("title")]];
    store.record_datalog_query_finish(app, &serde_json::json!(["ea", "?e", "title", "?v"]), refined).unwrap();

    let outcome = store.add_instaql_query(s1, query.clone(), v, Some("h1".to_string())).unwrap();
    assert!(outcome.result_changed);

    let iv_topics: Vec<Topic> = vec![vec![kw("ea"), set_of([Value::Str("e1".into())]), kw("title")]];
    let (db_after, sessions) = store.mark_stale_topics(app, 10, iv_topics).unwrap();
    assert_eq!(sessions, [s1].into_iter().collect());
    assert!(db_after.no_orphan_datalog());
    assert!(db_after.all_subscription_references_live(), "invalidation must not leave a dangling Subscription");
    assert_eq!(db_after.stale_instaql_queries_for_session(s1), vec![query]);
}

#[test]
fn stale_subscription_eviction() {
    let store: Store<TestEnv> = Store::new();
    let app = AppId(1);
    let s1 = SessionId::new_v4();
    let query = serde_json::json!({"todos": {}});
    let dq_query = serde_json::json!(["ea", "?e", "title", "?v"]);

    store.add_socket(s1, Arc::new(RecordingSocket::default())).unwrap();
    store.bump_instaql_version(s1, query.clone(), ReturnType::JoinRows).unwrap();
    store.record_datalog_query_start(app, s1, dq_query.clone(), vec![vec![kw("ea"), TopicPart::Wildcard, kw("title")]], query.clone(), 1).unwrap();
    store.add_instaql_query(s1, query.clone(), 1, Some("h1".to_string())).unwrap();

    let v2 = store.bump_instaql_version(s1, query.clone(), ReturnType::JoinRows).unwrap();
    assert_eq!(v2, 2);

    store.record_datalog_query_start(app, s1, dq_query, vec![vec![kw("ea"), TopicPart::Wildcard, kw("title")]], query.clone(), v2).unwrap();

    let outcome = store.add_instaql_query(s1, query, v2, Some("h1".to_string())).unwrap();
    assert!(!outcome.result_changed, "same hash means no change to send");
}

#[test]
fn session_teardown_cascade() {
    let store: Store<TestEnv> = Store::new();
    let app = AppId(1);
    let s1 = SessionId::new_v4();
    let s2 = SessionId::new_v4();
    let query = serde_json::json!({"todos": {}});
    let dq_query = serde_json::json!(["ea", "?e", "title", "?v"]);
    let topics = vec![vec![kw("ea"), TopicPart::Wildcard, kw("title")]];

    store.add_socket(s1, Arc::new(RecordingSocket::default())).unwrap();
    store.bump_instaql_version(s1, query.clone(), ReturnType::JoinRows).unwrap();
    store.record_datalog_query_start(app, s1, dq_query.clone(), topics.clone(), query.clone(), 1).unwrap();

    store.add_socket(s2, Arc::new(RecordingSocket::default())).unwrap();
    store.bump_instaql_version(s2, query.clone(), ReturnType::JoinRows).unwrap();
    store.record_datalog_query_start(app, s2, dq_query.clone(), topics, query, 1).unwrap();

    store.remove_session(s1).unwrap();
    let after_s1 = store.snapshot();
    assert_eq!(after_s1.datalog_datoms_by_app(app).count(), 1, "DQ still referenced by S2");

    store.remove_session(s2).unwrap();
    let after_s2 = store.snapshot();
    assert_eq!(after_s2.datalog_datoms_by_app(app).count(), 0, "DQ retracted once both subscribers are gone");
    assert!(after_s2.no_orphan_datalog());
}

#[test]
fn topic_matcher_boundaries() {
    use reactive_query_store::topic::match_topic;

    let iv: Topic = vec![kw("ea"), set_of([Value::Str("e1".into())]), kw("title")];
    let dq: Topic = vec![kw("ea"), TopicPart::Wildcard, kw("title")];
    assert!(match_topic(&iv, &dq));

    let iv: Topic = vec![kw("ea"), set_of([Value::Str("e1".into())]), TopicPart::Keyword(Value::Int(5))];
    let dq: Topic = vec![kw("ea"), TopicPart::Wildcard, TopicPart::Comparator(CompareOp::Gt, Value::Int(3))];
    assert!(match_topic(&iv, &dq));

    let iv: Topic = vec![kw("ea"), set_of([Value::Str("e1".into())]), TopicPart::Keyword(Value::Str("apple".into()))];
    let dq: Topic = vec![kw("ea"), TopicPart::Wildcard, TopicPart::Comparator(CompareOp::Like, Value::Str("ap%".into()))];
    assert!(match_topic(&iv, &dq));

    let iv: Topic = vec![kw("ea"), set_of([Value::Str("e1".into())]), TopicPart::Keyword(Value::Str("banana".into()))];
    let dq: Topic = vec![kw("ea"), TopicPart::Wildcard, TopicPart::Comparator(CompareOp::Like, Value::Str("ap%".into()))];
    assert!(!match_topic(&iv, &dq));
}

#[test]
fn monotonic_tx_id_under_interleaving() {
    let store: Store<TestEnv> = Store::new();
    let app = AppId(1);

    store.mark_stale_topics(app, 5, vec![]).unwrap();
    store.mark_stale_topics(app, 3, vec![]).unwrap();

    assert_eq!(store.snapshot().processed_tx_id(app), 5);
}

#[test]
fn socket_send_error_path() {
    let store: Store<TestEnv> = Store::new();
    let app = AppId(1);
    let sx = SessionId::new_v4();

    let err = store.send_event(app, sx, &serde_json::json!({"type": "refresh"})).unwrap_err();
    assert!(matches!(err, reactive_query_store::SocketError::Missing(id) if id == sx));

    // try_send_event swallows and logs; it must not panic and leaves the
    // store otherwise unchanged.
    store.try_send_event(app, sx, &serde_json::json!({"type": "refresh"}));
    assert!(store.snapshot().session(sx).is_none());
}

#[test]
fn idempotent_session_removal() {
    let store: Store<TestEnv> = Store::new();
    let s1 = SessionId::new_v4();
    store.add_socket(s1, Arc::new(RecordingSocket::default())).unwrap();

    store.remove_session(s1).unwrap();
    let once = HashMap::from([("present", store.snapshot().session(s1).is_some())]);

    store.remove_session(s1).unwrap();
    let twice = HashMap::from([("present", store.snapshot().session(s1).is_some())]);

    assert_eq!(once, twice);
    assert!(!once["present"]);
}

#[test]
fn version_monotonicity() {
    let store: Store<TestEnv> = Store::new();
    let s1 = SessionId::new_v4();
    let query = serde_json::json!({"todos": {}});

    store.add_socket(s1, Arc::new(RecordingSocket::default())).unwrap();
    let v1 = store.bump_instaql_version(s1, query.clone(), ReturnType::JoinRows).unwrap();
    let v2 = store.bump_instaql_version(s1, query.clone(), ReturnType::JoinRows).unwrap();
    let v3 = store.bump_instaql_version(s1, query, ReturnType::JoinRows).unwrap();

    assert!(v1 < v2 && v2 < v3);
}

#[test]
fn unregistered_session_is_rejected() {
    let store: Store<TestEnv> = Store::new();
    let ghost = SessionId::new_v4();
    let query = serde_json::json!({"todos": {}});

    let err = store.bump_instaql_version(ghost, query, ReturnType::JoinRows).unwrap_err();
    assert!(matches!(err, reactive_query_store::StoreError::SessionMissing(id) if id == ghost));
}

#[test]
fn single_flight_delay_coordination() {
    let store: Store<TestEnv> = Store::new();
    let app = AppId(1);
    let query = serde_json::json!(["ea", "?e", "title", "?v"]);

    let d1: Arc<str> = Arc::from("delay-1");
    let d2: Arc<str> = Arc::from("delay-2");

    let effective1 = store.swap_datalog_cache_delay(app, query.clone(), d1.clone()).unwrap();
    let effective2 = store.swap_datalog_cache_delay(app, query, d2).unwrap();

    assert_eq!(effective1, d1);
    assert_eq!(effective2, d1, "second caller must observe the delay that won the race");
}
