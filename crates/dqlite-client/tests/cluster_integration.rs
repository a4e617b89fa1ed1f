use std::time::{Duration, SystemTime, UNIX_EPOCH};

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use dqlite_core::error::QueryErrorKind;
use dqlite_core::{Connection, Error, TransactionOps, Value};

use dqlite_client::{DqliteConfig, DqliteConnection, SharedDqliteConnection};

const CLUSTER_ENV: &str = "DQLITE_TEST_CLUSTER";

/// Seeds from `DQLITE_TEST_CLUSTER`, e.g. `127.0.0.1:9001,127.0.0.1:9002`.
fn cluster_config() -> Option<DqliteConfig> {
    let raw = std::env::var(CLUSTER_ENV).ok()?;
    let seeds: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if seeds.is_empty() {
        return None;
    }
    Some(
        DqliteConfig::new()
            .addresses(seeds)
            .database("sqlmodel_test")
            .connect_timeout(Duration::from_secs(10)),
    )
}

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn test_table_name(prefix: &str) -> String {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    format!("{prefix}_{suffix}")
}

#[test]
fn dqlite_sync_select_1() {
    let Some(cfg) = cluster_config() else {
        eprintln!("skipping dqlite integration tests: set {CLUSTER_ENV}");
        return;
    };

    let conn = DqliteConnection::connect(cfg).expect("connect");
    let rows = conn.query_sync("SELECT 1", &[]).expect("select 1");
    assert_eq!(rows[0].get_as::<i64>(0).expect("row[0] as i64"), 1);
    assert!(!conn.cluster_sync().expect("cluster").is_empty());
}

#[test]
fn dqlite_async_insert_and_select_roundtrip() {
    let Some(cfg) = cluster_config() else {
        eprintln!("skipping dqlite integration tests: set {CLUSTER_ENV}");
        return;
    };

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = unwrap_outcome(SharedDqliteConnection::connect(&cx, cfg).await);
        let table = test_table_name("dqlite_roundtrip");
        unwrap_outcome(
            conn.execute(
                &cx,
                &format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"),
                &[],
            )
            .await,
        );

        let id = unwrap_outcome(
            conn.insert(
                &cx,
                &format!("INSERT INTO {table} (name) VALUES (?)"),
                &[Value::Text("alice".into())],
            )
            .await,
        );
        assert!(id > 0);

        let rows = unwrap_outcome(
            conn.query(
                &cx,
                &format!("SELECT name FROM {table} WHERE id = ?"),
                &[Value::BigInt(id)],
            )
            .await,
        );
        assert_eq!(rows[0].get_as::<String>(0).expect("name"), "alice");

        unwrap_outcome(conn.execute(&cx, &format!("DROP TABLE {table}"), &[]).await);
    });
}

#[test]
fn dqlite_rollback_discards_writes() {
    let Some(cfg) = cluster_config() else {
        eprintln!("skipping dqlite integration tests: set {CLUSTER_ENV}");
        return;
    };

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = unwrap_outcome(SharedDqliteConnection::connect(&cx, cfg).await);
        let table = test_table_name("dqlite_rollback");
        unwrap_outcome(
            conn.execute(&cx, &format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY)"), &[])
                .await,
        );

        let tx = unwrap_outcome(conn.begin(&cx).await);
        unwrap_outcome(
            tx.execute(&cx, &format!("INSERT INTO {table} (id) VALUES (1)"), &[])
                .await,
        );
        unwrap_outcome(tx.rollback(&cx).await);

        let rows = unwrap_outcome(conn.query(&cx, &format!("SELECT id FROM {table}"), &[]).await);
        assert!(rows.is_empty());
        unwrap_outcome(conn.execute(&cx, &format!("DROP TABLE {table}"), &[]).await);
    });
}

#[test]
fn dqlite_missing_table_is_not_found() {
    let Some(cfg) = cluster_config() else {
        eprintln!("skipping dqlite integration tests: set {CLUSTER_ENV}");
        return;
    };

    let conn = DqliteConnection::connect(cfg).expect("connect");
    match conn.query_sync("SELECT * FROM no_such_table_here", &[]) {
        Err(Error::Query(q)) => assert_eq!(q.kind, QueryErrorKind::NotFound),
        other => panic!("expected a query error, got {other:?}"),
    }
}
