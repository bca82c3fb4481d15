use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use corvid_cql::frame::request::Request;
use corvid_cql::frame::response::result::{ColumnType, CqlValue};
use corvid_cql::{Consistency, SerializedValues};
use uuid::Uuid;

use super::session::Session;
use super::session_builder::SessionBuilder;
use crate::cluster::registry::tests::RecordingListener;
use crate::errors::{BadQuery, DbError, ExecutionError, RequestAttemptError, WriteType};
use crate::policies::host_listener::HostEvent;
use crate::policies::reconnection::ConstantReconnectionPolicy;
use crate::statement::{Batch, BatchType, Statement};
use crate::test_utils::{setup_tracing, MockCluster, MockRequest, MockResponse, Reply};

fn builder(mock: &MockCluster) -> SessionBuilder {
    SessionBuilder::new()
        .known_node_addr(mock.address(0))
        .connection_timeout(Duration::from_secs(1))
}

async fn session(mock: &MockCluster) -> Session {
    builder(mock).build().await.unwrap()
}

fn respond(response: MockResponse) -> Option<Reply> {
    Some(Reply::Respond(response))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached in time");
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn query_returns_rows_from_the_cluster() {
    setup_tracing();
    let mock = MockCluster::start(3, |_, req: &MockRequest| {
        req.is_query("SELECT a FROM ks.t").then(|| {
            Reply::Respond(MockResponse::rows(
                &[("a", ColumnType::Int)],
                vec![vec![Some(CqlValue::Int(7))]],
            ))
        })
    })
    .await;
    let session = session(&mock).await;

    let result = session
        .query("SELECT a FROM ks.t", SerializedValues::EMPTY)
        .await
        .unwrap();
    assert!(mock.addresses().contains(&result.coordinator()));
    assert_eq!(result.rows().unwrap()[0].columns, vec![Some(CqlValue::Int(7))]);

    let write = session
        .query("INSERT INTO ks.t (a) VALUES (1)", SerializedValues::EMPTY)
        .await
        .unwrap();
    assert!(write.rows().is_none());

    assert_eq!(session.get_cluster_state().get_nodes_info().len(), 3);
    session.refresh_metadata().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn every_node_failing_lists_each_once() {
    setup_tracing();
    let mock = MockCluster::start(3, |_, req: &MockRequest| {
        req.is_query("SELECT busy")
            .then(|| Reply::Respond(MockResponse::error(DbError::Overloaded, "busy")))
    })
    .await;
    let session = session(&mock).await;

    let result = session.query("SELECT busy", SerializedValues::EMPTY).await;
    let errors = assert_matches!(result, Err(ExecutionError::NoHostAvailable { errors }) => errors);
    let hosts: HashSet<_> = errors.iter().map(|(address, _)| *address).collect();
    assert_eq!(errors.len(), 3);
    assert_eq!(hosts, mock.addresses().into_iter().collect());
    assert!(errors
        .iter()
        .all(|(_, e)| matches!(e, RequestAttemptError::DbError(DbError::Overloaded, _))));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn write_timeout_is_retried_once() {
    setup_tracing();
    let sent = Arc::new(AtomicUsize::new(0));
    let handler_sent = sent.clone();
    let mock = MockCluster::start(2, move |_, req: &MockRequest| {
        if !req.is_query("INSERT INTO ks.t (a) VALUES (1)") {
            return None;
        }
        if handler_sent.fetch_add(1, Ordering::SeqCst) == 0 {
            respond(MockResponse::error(
                DbError::WriteTimeout {
                    consistency: Consistency::Quorum,
                    received: 0,
                    required: 1,
                    write_type: WriteType::BatchLog,
                },
                "timed out",
            ))
        } else {
            respond(MockResponse::void())
        }
    })
    .await;
    let session = session(&mock).await;

    let mut statement = Statement::new("INSERT INTO ks.t (a) VALUES (1)");
    statement.set_is_idempotent(true);
    session
        .query(statement, SerializedValues::EMPTY)
        .await
        .unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn whole_request_times_out() {
    setup_tracing();
    let mock = MockCluster::start(1, |_, req: &MockRequest| {
        req.is_query("SELECT slow").then_some(Reply::Ignore)
    })
    .await;
    let session = builder(&mock)
        .request_timeout(Some(Duration::from_millis(200)))
        .build()
        .await
        .unwrap();

    let result = session.query("SELECT slow", SerializedValues::EMPTY).await;
    assert_matches!(result, Err(ExecutionError::RequestTimeout(d)) if d == Duration::from_millis(200));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn broken_connection_marks_node_down_until_reconnected() {
    setup_tracing();
    let mock = MockCluster::start(1, |_, req: &MockRequest| {
        req.is_query("SELECT crash").then_some(Reply::Close)
    })
    .await;
    let listener = Arc::new(RecordingListener::default());
    let session = builder(&mock)
        .host_listener(listener.clone())
        .reconnection_policy(Arc::new(ConstantReconnectionPolicy::new(
            Duration::from_millis(50),
        )))
        .build()
        .await
        .unwrap();
    listener.take();

    let result = session.query("SELECT crash", SerializedValues::EMPTY).await;
    let errors = assert_matches!(result, Err(ExecutionError::NoHostAvailable { errors }) => errors);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1.is_stream_level());

    let mut seen = Vec::new();
    eventually(|| {
        seen.extend(listener.take());
        seen.contains(&(mock.address(0), HostEvent::Down))
            && seen.contains(&(mock.address(0), HostEvent::Up))
    })
    .await;
    let down = seen.iter().position(|e| e.1 == HostEvent::Down);
    let up = seen.iter().rposition(|e| e.1 == HostEvent::Up);
    assert!(down < up);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn execute_reprepares_unknown_statement() {
    setup_tracing();
    let prepares = Arc::new(AtomicUsize::new(0));
    let executes = Arc::new(AtomicUsize::new(0));
    let (handler_prepares, handler_executes) = (prepares.clone(), executes.clone());
    let mock = MockCluster::start(3, move |_, req: &MockRequest| match &req.request {
        Request::Prepare(text) if text == "SELECT a FROM ks.t" => {
            handler_prepares.fetch_add(1, Ordering::SeqCst);
            respond(MockResponse::prepared(b"stmt"))
        }
        Request::Execute(_) => {
            if handler_executes.fetch_add(1, Ordering::SeqCst) == 0 {
                respond(MockResponse::error(
                    DbError::Unprepared {
                        statement_id: Bytes::from_static(b"stmt"),
                    },
                    "unknown statement",
                ))
            } else {
                respond(MockResponse::void())
            }
        }
        _ => None,
    })
    .await;
    let session = session(&mock).await;

    let prepared = session.prepare("SELECT a FROM ks.t").await.unwrap();
    assert_eq!(prepared.get_id().as_ref(), b"stmt");
    // Once on every node.
    assert_eq!(prepares.load(Ordering::SeqCst), 3);

    session
        .execute(&prepared, SerializedValues::EMPTY)
        .await
        .unwrap();
    assert_eq!(executes.load(Ordering::SeqCst), 2);
    assert_eq!(prepares.load(Ordering::SeqCst), 4);

    let mut values = SerializedValues::new();
    values.add_value(&1_i32).unwrap();
    let result = session.execute(&prepared, &values).await;
    assert_matches!(
        result,
        Err(ExecutionError::BadQuery(BadQuery::ValuesCountMismatch { expected: 0, got: 1 }))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn batches_are_checked_and_sent() {
    setup_tracing();
    let batches = Arc::new(AtomicUsize::new(0));
    let handler_batches = batches.clone();
    let mock = MockCluster::start(2, move |_, req: &MockRequest| match &req.request {
        Request::Batch(batch) => {
            assert_eq!(batch.statements.len(), 2);
            handler_batches.fetch_add(1, Ordering::SeqCst);
            respond(MockResponse::void())
        }
        _ => None,
    })
    .await;
    let session = session(&mock).await;

    let mut batch = Batch::new(BatchType::Logged);
    batch.append_statement("INSERT INTO ks.t (a) VALUES (1)");
    batch.append_statement("INSERT INTO ks.t (a) VALUES (2)");

    let result = session.batch(&batch, &[SerializedValues::new()]).await;
    assert_matches!(
        result,
        Err(ExecutionError::BadQuery(BadQuery::BatchValuesCountMismatch {
            statements: 2,
            values: 1
        }))
    );
    assert_eq!(batches.load(Ordering::SeqCst), 0);

    session
        .batch(&batch, &[SerializedValues::new(), SerializedValues::new()])
        .await
        .unwrap();
    assert_eq!(batches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn use_statement_switches_every_connection() {
    setup_tracing();
    let switched = Arc::new(AtomicUsize::new(0));
    let handler_switched = switched.clone();
    let mock = MockCluster::start(2, move |_, req: &MockRequest| {
        let text = req.query_text()?;
        if !text.starts_with("USE") {
            return None;
        }
        handler_switched.fetch_add(1, Ordering::SeqCst);
        respond(MockResponse::set_keyspace("ks2"))
    })
    .await;
    let session = session(&mock).await;
    assert_eq!(session.get_keyspace(), None);

    session
        .query("USE ks2", SerializedValues::EMPTY)
        .await
        .unwrap();
    assert_eq!(session.get_keyspace().as_deref().map(String::as_str), Some("ks2"));
    // The statement itself, then once per pool connection.
    assert_eq!(switched.load(Ordering::SeqCst), 3);

    let result = session.use_keyspace("bad name", false).await;
    assert!(result.is_err());
    assert_eq!(session.get_keyspace().as_deref().map(String::as_str), Some("ks2"));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn schema_agreement_is_awaited() {
    setup_tracing();
    let mock = MockCluster::start(3, |_, _| None).await;
    let session = builder(&mock)
        .schema_agreement_interval(Duration::from_millis(20))
        .schema_agreement_timeout(Duration::from_millis(300))
        .build()
        .await
        .unwrap();

    assert_eq!(
        session.check_schema_agreement().await.unwrap(),
        Some(Uuid::from_u128(42))
    );
    assert!(session.await_schema_agreement().await.unwrap());

    mock.topology.schema_versions.lock().unwrap()[2] = Uuid::from_u128(43);
    assert_eq!(session.check_schema_agreement().await.unwrap(), None);
    assert!(!session.await_schema_agreement().await.unwrap());
}
