//! Failover executor behaviour against scripted replicas.
//!
//! No database needed: replicas are simulated by a backend whose per-endpoint
//! responses are scripted up front, and time runs on Tokio's paused clock.
//!
//! Run with: `cargo test --test failover`

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use replica_sync::clock::ManualClock;
use replica_sync::replica::{
    DbTimeouts, Endpoint, EndpointRegistry, FailoverError, FailoverExecutor, QueryError, ReplicaBackend,
    TimeoutPhase,
};
use replica_sync::resilience::{BreakerStateStore, CircuitConfig, CircuitState, RetryConfig};
use replica_sync::sql_value::SqlQuery;

// =============================================================================
// Scripted replicas
// =============================================================================

#[derive(Clone)]
enum Reply {
    Rows(Vec<(i64, &'static str)>),
    Fail(QueryError),
    /// Never answers; only a read timeout ends the attempt
    Hang,
    /// Refuses the connection outright
    Refuse,
}

#[derive(Default)]
struct ScriptedReplicas {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fetches: Mutex<HashMap<String, usize>>,
    connects: Mutex<HashMap<String, usize>>,
}

impl ScriptedReplicas {
    /// Replies are consumed in order; the last one repeats forever.
    fn on(self, key: &str, replies: Vec<Reply>) -> Self {
        self.scripts.lock().insert(key.to_string(), replies.into());
        self
    }

    fn connects(&self, key: &str) -> usize {
        self.connects.lock().get(key).copied().unwrap_or(0)
    }

    fn fetches(&self, key: &str) -> usize {
        self.fetches.lock().get(key).copied().unwrap_or(0)
    }

    fn next(&self, key: &str) -> Reply {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(key.to_string()).or_default();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(Reply::Rows(vec![]))
        }
    }
}

#[async_trait]
impl ReplicaBackend for ScriptedReplicas {
    type Connection = (String, Reply);
    type Row = (i64, &'static str);

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, QueryError> {
        *self.connects.lock().entry(endpoint.key.clone()).or_default() += 1;
        match self.next(&endpoint.key) {
            Reply::Refuse => Err(QueryError::Connect(format!("{} refused", endpoint.key))),
            reply => Ok((endpoint.key.clone(), reply)),
        }
    }

    async fn fetch(
        &self,
        conn: &mut Self::Connection,
        _query: &SqlQuery,
    ) -> Result<Vec<Self::Row>, QueryError> {
        *self.fetches.lock().entry(conn.0.clone()).or_default() += 1;
        match conn.1.clone() {
            Reply::Rows(rows) => Ok(rows),
            Reply::Fail(e) => Err(e),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Ok(vec![])
            }
            Reply::Refuse => unreachable!("refused connections never fetch"),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    executor: FailoverExecutor<ScriptedReplicas>,
    replicas: Arc<ScriptedReplicas>,
    breakers: Arc<BreakerStateStore>,
    clock: Arc<ManualClock>,
}

fn harness(replicas: ScriptedReplicas, endpoints: Vec<Endpoint>, max_retries: usize) -> Harness {
    let replicas = Arc::new(replicas);
    let clock = Arc::new(ManualClock::new(1_767_225_600_000));
    let breakers = Arc::new(BreakerStateStore::with_clock(
        CircuitConfig { failure_threshold: 3, cooldown: Duration::from_secs(60) },
        clock.clone(),
    ));
    let executor = FailoverExecutor::new(
        Arc::new(EndpointRegistry::new(endpoints)),
        replicas.clone(),
        breakers.clone(),
        Arc::new(Semaphore::new(8)),
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        },
        DbTimeouts { connect: Duration::from_secs(2), read: Duration::from_secs(5) },
    );
    Harness { executor, replicas, breakers, clock }
}

fn a_and_b() -> Vec<Endpoint> {
    vec![
        Endpoint::new("A", 1, "postgres://replica-a/gov"),
        Endpoint::new("B", 2, "postgres://replica-b/gov"),
    ]
}

#[derive(Debug, PartialEq)]
struct Proposal {
    id: i64,
    title: String,
}

fn proposal(row: &(i64, &'static str)) -> Result<Proposal, QueryError> {
    Ok(Proposal { id: row.0, title: row.1.to_string() })
}

fn query() -> SqlQuery {
    SqlQuery::new("SELECT id, title FROM gov_action_proposal WHERE epoch = $1").bind(512_i64)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn three_timeouts_open_a_then_calls_route_straight_to_b() {
    let replicas = ScriptedReplicas::default()
        .on("A", vec![Reply::Hang])
        .on("B", vec![Reply::Rows(vec![(7, "Treasury withdrawal")])]);
    let h = harness(replicas, a_and_b(), 1);

    for _ in 0..3 {
        let rows = h.executor.execute(&query(), proposal).await.unwrap();
        assert_eq!(rows, vec![Proposal { id: 7, title: "Treasury withdrawal".into() }]);
    }
    assert_eq!(h.replicas.fetches("A"), 3);
    assert!(h.breakers.is_open("A"));
    assert_eq!(h.breakers.state("B"), CircuitState::Closed);

    let rows = h.executor.execute(&query(), proposal).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(h.replicas.connects("A"), 3, "open endpoint must not be attempted");
    assert_eq!(h.replicas.fetches("B"), 4);
}

#[tokio::test(start_paused = true)]
async fn breaker_closes_again_after_cooldown() {
    let replicas = ScriptedReplicas::default()
        .on("A", vec![Reply::Refuse, Reply::Refuse, Reply::Refuse, Reply::Rows(vec![(1, "ok")])])
        .on("B", vec![Reply::Rows(vec![(2, "fallback")])]);
    let h = harness(replicas, a_and_b(), 1);

    for _ in 0..3 {
        h.executor.execute(&query(), proposal).await.unwrap();
    }
    assert!(h.breakers.is_open("A"));

    h.clock.advance(Duration::from_secs(59));
    assert!(h.breakers.is_open("A"));
    h.clock.advance(Duration::from_secs(1));
    assert!(!h.breakers.is_open("A"));

    let rows = h.executor.execute(&query(), proposal).await.unwrap();
    assert_eq!(rows[0].title, "ok");
    assert_eq!(h.breakers.snapshot("A").consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn all_open_forces_one_attempt_on_highest_priority() {
    let replicas = ScriptedReplicas::default()
        .on("A", vec![Reply::Refuse])
        .on("B", vec![Reply::Refuse]);
    let h = harness(replicas, a_and_b(), 1);

    for _ in 0..3 {
        let err = h.executor.execute(&query(), proposal).await.unwrap_err();
        assert!(matches!(err, FailoverError::AllEndpointsFailed { attempted: 2, .. }));
    }
    assert!(h.breakers.is_open("A"));
    assert!(h.breakers.is_open("B"));

    let err = h.executor.execute(&query(), proposal).await.unwrap_err();
    match err {
        FailoverError::AllEndpointsFailed { attempted, last_endpoint, .. } => {
            assert_eq!(attempted, 1);
            assert_eq!(last_endpoint, "A");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.replicas.connects("A"), 4);
    assert_eq!(h.replicas.connects("B"), 3);
}

#[tokio::test(start_paused = true)]
async fn forced_endpoint_gets_exactly_one_attempt_with_default_retries() {
    let replicas = ScriptedReplicas::default()
        .on("A", vec![Reply::Refuse])
        .on("B", vec![Reply::Refuse]);
    let h = harness(replicas, a_and_b(), 3);

    for _ in 0..3 {
        assert!(h.executor.execute(&query(), proposal).await.is_err());
    }
    assert!(h.breakers.is_open("A"));
    assert!(h.breakers.is_open("B"));
    let before = h.replicas.connects("A");

    let err = h.executor.execute(&query(), proposal).await.unwrap_err();
    assert!(matches!(err, FailoverError::AllEndpointsFailed { attempted: 1, .. }));
    assert_eq!(h.replicas.connects("A") - before, 1);
}

#[tokio::test(start_paused = true)]
async fn retriable_errors_retry_within_the_endpoint() {
    let replicas = ScriptedReplicas::default().on(
        "A",
        vec![
            Reply::Fail(QueryError::database(Some("53300"), "sorry, too many clients already")),
            Reply::Fail(QueryError::Io("connection reset by peer".into())),
            Reply::Rows(vec![(3, "Info action")]),
        ],
    );
    let h = harness(replicas, a_and_b(), 3);

    let rows = h.executor.execute(&query(), proposal).await.unwrap();
    assert_eq!(rows[0].id, 3);
    assert_eq!(h.replicas.fetches("A"), 3);
    assert_eq!(h.replicas.connects("B"), 0);
    assert_eq!(h.breakers.snapshot("A").consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn non_retriable_error_moves_on_without_retry() {
    let replicas = ScriptedReplicas::default()
        .on("A", vec![Reply::Fail(QueryError::database(Some("42P01"), "relation does not exist"))])
        .on("B", vec![Reply::Rows(vec![(4, "Hard fork")])]);
    let h = harness(replicas, a_and_b(), 3);

    let rows = h.executor.execute(&query(), proposal).await.unwrap();
    assert_eq!(rows[0].title, "Hard fork");
    assert_eq!(h.replicas.fetches("A"), 1);
    assert_eq!(h.breakers.snapshot("A").consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_failover_reports_last_error() {
    let replicas = ScriptedReplicas::default()
        .on("A", vec![Reply::Refuse])
        .on("B", vec![Reply::Hang]);
    let h = harness(replicas, a_and_b(), 2);

    let err = h.executor.execute(&query(), proposal).await.unwrap_err();
    assert!(matches!(
        err.last_error(),
        Some(QueryError::Timeout { phase: TimeoutPhase::Read, .. })
    ));
    assert_eq!(h.replicas.connects("A"), 2);
    assert_eq!(h.replicas.fetches("B"), 2);
}

#[tokio::test(start_paused = true)]
async fn mapping_failure_is_not_retried() {
    let replicas = ScriptedReplicas::default()
        .on("A", vec![Reply::Rows(vec![(-1, "bad")])])
        .on("B", vec![Reply::Rows(vec![(-1, "bad")])]);
    let h = harness(replicas, a_and_b(), 3);

    let err = h
        .executor
        .execute(&query(), |row: &(i64, &'static str)| {
            if row.0 < 0 {
                Err(QueryError::mapping("negative id"))
            } else {
                proposal(row)
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err.last_error(), Some(QueryError::Mapping(_))));
    assert_eq!(h.replicas.fetches("A"), 1);
    assert_eq!(h.replicas.fetches("B"), 1);
}

#[tokio::test]
async fn no_endpoints_is_an_error() {
    let h = harness(ScriptedReplicas::default(), vec![], 1);
    let err = h.executor.execute(&query(), proposal).await.unwrap_err();
    assert!(matches!(err, FailoverError::NoEndpoints));
}
