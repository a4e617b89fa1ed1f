//! Engines and cursors against the scripted in-process dqlite server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use dqlite_client::testing::{TestServer, exec_result, not_leader, rows};
use dqlite_core::error::{ConnectionError, ConnectionErrorKind, PoolErrorKind};
use dqlite_core::{Cx, Error, Outcome, Row, Value};
use dqlite_dialect::{Dialect, DqliteAioDialect, DqliteDialect, create_async_engine, create_engine};
use dqlite_wire::{Request, Response};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// A leader holding one `users (id, name)` table in memory.
fn users_server() -> TestServer {
    TestServer::leader(users_table()).unwrap()
}

/// Like [`users_server`], but once `trip` is set the next query is answered
/// with a not-leader failure, which drops the socket.
fn tripping_users_server(trip: Arc<AtomicBool>) -> TestServer {
    let table = users_table();
    TestServer::leader(move |request| match request {
        Request::QuerySql { .. } if trip.swap(false, Ordering::SeqCst) => vec![not_leader()],
        other => table(other),
    })
    .unwrap()
}

fn users_table() -> impl Fn(&Request) -> Vec<Response> + Send + Sync + 'static {
    let table: Arc<Mutex<Vec<(i64, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    move |request| {
        let mut table = table.lock().unwrap();
        match request {
            Request::QuerySql { sql, .. } if sql == "SELECT sqlite_version()" => {
                vec![rows(&["sqlite_version()"], vec![vec![Value::Text("3.45.1".into())]])]
            }
            Request::QuerySql { sql, .. } if sql == "SELECT 1" => {
                vec![rows(&["1"], vec![vec![Value::BigInt(1)]])]
            }
            Request::QuerySql { sql, params, .. } if sql.contains("WHERE id = ?") => {
                let wanted = params[0].as_i64();
                let found = table
                    .iter()
                    .filter(|(id, _)| Some(*id) == wanted)
                    .map(|(id, name)| vec![Value::BigInt(*id), name.clone()])
                    .collect();
                vec![rows(&["id", "name"], found)]
            }
            Request::QuerySql { .. } => {
                let all = table
                    .iter()
                    .map(|(id, name)| vec![Value::BigInt(*id), name.clone()])
                    .collect();
                vec![rows(&["id", "name"], all)]
            }
            Request::ExecSql { sql, params, .. } if sql.starts_with("INSERT") => {
                let id = table.len() as i64 + 1;
                table.push((id, params[0].clone()));
                vec![exec_result(id as u64, 1)]
            }
            Request::ExecSql { sql, .. } if sql.starts_with("DELETE") => {
                let removed = table.len() as u64;
                table.clear();
                vec![exec_result(0, removed)]
            }
            Request::ExecSql { .. } => vec![exec_result(0, 0)],
            _ => vec![Response::Empty],
        }
    }
}

fn is_transaction_lost(err: &Error) -> bool {
    matches!(
        err,
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::TransactionLost,
            ..
        })
    )
}

fn url(scheme: &str, server: &TestServer, query: &str) -> String {
    format!("{}://{}/app{}", scheme, server.address(), query)
}

fn values(rows: &[Row]) -> Vec<Vec<Value>> {
    rows.iter().map(|row| row.values().cloned().collect()).collect()
}

fn sent_sql(server: &TestServer) -> Vec<String> {
    server
        .requests()
        .into_iter()
        .filter_map(|request| match request {
            Request::ExecSql { sql, .. } | Request::QuerySql { sql, .. } => Some(sql),
            _ => None,
        })
        .collect()
}

#[test]
fn sync_and_async_engines_return_identical_rows() {
    let server = users_server();

    let engine = create_engine(&url("dqlite", &server, "")).unwrap();
    let conn = engine.connect().unwrap();
    let mut cursor = conn.cursor();
    cursor
        .executemany(
            "INSERT INTO users (name) VALUES ($1)",
            &[vec![Value::Text("ann".into())], vec![Value::Text("bob".into())]],
        )
        .unwrap();
    assert_eq!(cursor.rowcount(), 2);
    assert_eq!(cursor.lastrowid(), Some(2));
    assert!(cursor.description().is_none());

    let sync_rows = conn
        .execute("SELECT id, name FROM users ORDER BY id", &[])
        .unwrap()
        .fetchall();
    conn.close().unwrap();

    let aio = create_async_engine(&url("dqlite+aio", &server, "")).unwrap();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let async_rows = rt.block_on(async {
        let conn = unwrap_outcome(aio.connect(&cx).await);
        let mut cursor = unwrap_outcome(
            conn.execute(&cx, "SELECT id, name FROM users ORDER BY id", &[])
                .await,
        );
        let fetched = cursor.fetchall();
        unwrap_outcome(conn.close(&cx).await);
        fetched
    });

    assert_eq!(sync_rows.len(), 2);
    assert_eq!(values(&sync_rows), values(&async_rows));
    assert_eq!(
        values(&sync_rows),
        vec![
            vec![Value::BigInt(1), Value::Text("ann".into())],
            vec![Value::BigInt(2), Value::Text("bob".into())],
        ]
    );
}

#[test]
fn cursor_reports_description_and_counts() {
    let server = users_server();
    let engine = create_engine(&url("dqlite", &server, "")).unwrap();
    let conn = engine.connect().unwrap();

    let mut cursor = conn
        .execute("INSERT INTO users (name) VALUES (?)", &[Value::Text("ann".into())])
        .unwrap();
    assert_eq!(cursor.rowcount(), 1);
    assert_eq!(cursor.lastrowid(), Some(1));

    cursor.execute("SELECT id, name FROM users", &[]).unwrap();
    let description = cursor.description().unwrap();
    let names: Vec<&str> = description.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name"]);
    assert_eq!(cursor.rowcount(), -1);
    assert_eq!(cursor.lastrowid(), None);
    assert_eq!(cursor.fetchone().unwrap().get_named::<String>("name").unwrap(), "ann");
    assert!(cursor.fetchone().is_none());

    cursor.execute("SELECT id, name FROM users WHERE id = ?", &[Value::BigInt(9)]).unwrap();
    assert_eq!(cursor.description().unwrap().len(), 2);
    assert!(cursor.fetchall().is_empty());
}

#[test]
fn named_parameters_are_sent_positionally() {
    let server = users_server();
    let engine = create_engine(&url("dqlite", &server, "")).unwrap();
    let conn = engine.connect().unwrap();

    let mut cursor = conn.cursor();
    cursor
        .execute_named(
            "SELECT id, name FROM users WHERE id = :id OR parent = :id",
            &[("id", Value::BigInt(4))],
        )
        .unwrap();

    let sent = server.requests().into_iter().find_map(|request| match request {
        Request::QuerySql { sql, params, .. } if sql.contains("parent") => Some((sql, params)),
        _ => None,
    });
    assert_eq!(
        sent,
        Some((
            "SELECT id, name FROM users WHERE id = ? OR parent = ?".to_string(),
            vec![Value::BigInt(4), Value::BigInt(4)],
        ))
    );
}

#[test]
fn commit_and_rollback_without_transaction_succeed() {
    let server = users_server();
    let engine = create_engine(&url("dqlite", &server, "")).unwrap();
    let conn = engine.connect().unwrap();

    conn.commit().unwrap();
    conn.rollback().unwrap();
    assert!(!sent_sql(&server).iter().any(|sql| sql == "COMMIT" || sql == "ROLLBACK"));

    conn.begin().unwrap();
    assert!(conn.in_transaction());
    conn.commit().unwrap();
    assert!(!conn.in_transaction());
    assert!(sent_sql(&server).contains(&"COMMIT".to_string()));
}

#[test]
fn commit_after_rediscovery_inside_transaction_fails() {
    let trip = Arc::new(AtomicBool::new(false));
    let server = tripping_users_server(Arc::clone(&trip));
    let engine = create_engine(&url("dqlite", &server, "")).unwrap();
    let conn = engine.connect().unwrap();

    conn.begin().unwrap();
    conn.execute("INSERT INTO users (name) VALUES (?)", &[Value::Text("ann".into())])
        .unwrap();
    trip.store(true, Ordering::SeqCst);
    assert!(conn.execute("SELECT 1", &[]).unwrap_err().is_leader_error());

    let retry = conn.execute("SELECT 1", &[]).unwrap_err();
    assert!(is_transaction_lost(&retry), "got {retry:?}");
    let insert = conn
        .execute("INSERT INTO users (name) VALUES (?)", &[Value::Text("bob".into())])
        .unwrap_err();
    assert!(is_transaction_lost(&insert), "got {insert:?}");
    let commit = conn.commit().unwrap_err();
    assert!(is_transaction_lost(&commit), "got {commit:?}");
    assert!(conn.in_transaction());

    conn.rollback().unwrap();
    assert!(!conn.in_transaction());
    assert!(conn.ping());

    let sent = sent_sql(&server);
    assert!(!sent.iter().any(|sql| sql == "COMMIT"));
    assert_eq!(
        sent.iter().filter(|sql| sql.starts_with("INSERT")).count(),
        1
    );
}

#[test]
fn async_commit_after_rediscovery_inside_transaction_fails() {
    let trip = Arc::new(AtomicBool::new(false));
    let server = tripping_users_server(Arc::clone(&trip));
    let aio = create_async_engine(&url("dqlite+aio", &server, "")).unwrap();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut conn = unwrap_outcome(aio.connect(&cx).await);
        unwrap_outcome(conn.begin(&cx).await);
        unwrap_outcome(
            conn.execute(&cx, "INSERT INTO users (name) VALUES (?)", &[Value::Null])
                .await,
        );
        trip.store(true, Ordering::SeqCst);
        match conn.execute(&cx, "SELECT 1", &[]).await {
            Outcome::Err(e) => assert!(e.is_leader_error()),
            _ => panic!("expected a not-leader failure"),
        }
        match conn.execute(&cx, "SELECT 1", &[]).await {
            Outcome::Err(e) => assert!(is_transaction_lost(&e), "got {e:?}"),
            _ => panic!("query ran on a lost transaction"),
        }
        match conn.commit(&cx).await {
            Outcome::Err(e) => assert!(is_transaction_lost(&e), "got {e:?}"),
            _ => panic!("commit of a lost transaction succeeded"),
        }
        unwrap_outcome(conn.rollback(&cx).await);
        assert!(!unwrap_outcome(conn.in_transaction(&cx).await));
        assert!(conn.ping(&cx).await);
        unwrap_outcome(conn.close(&cx).await);
    });

    assert!(!sent_sql(&server).iter().any(|sql| sql == "COMMIT"));
}

#[test]
fn dropped_connection_rolls_back_open_transaction() {
    let server = users_server();
    let engine = create_engine(&url("dqlite", &server, "")).unwrap();
    {
        let conn = engine.connect().unwrap();
        conn.begin().unwrap();
        conn.execute("INSERT INTO users (name) VALUES (?)", &[Value::Null])
            .unwrap();
    }
    assert_eq!(sent_sql(&server).last().map(String::as_str), Some("ROLLBACK"));
}

#[test]
fn ping_and_server_version() {
    let server = users_server();
    let engine = create_engine(&url("dqlite", &server, "")).unwrap();
    let conn = engine.connect().unwrap();
    assert!(conn.ping());
    assert_eq!(conn.server_version_info().unwrap(), vec![3, 45, 1]);
    assert_eq!(
        DqliteDialect.server_version_info(conn.driver_connection()).unwrap(),
        vec![3, 45, 1]
    );

    let aio = create_async_engine(&url("dqlite+aio", &server, "")).unwrap();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let conn = unwrap_outcome(aio.connect(&cx).await);
        assert!(conn.ping(&cx).await);
        assert_eq!(unwrap_outcome(conn.server_version_info(&cx).await), vec![3, 45, 1]);
        assert!(DqliteAioDialect.do_ping(&cx, conn.driver_connection()).await);
        unwrap_outcome(conn.close(&cx).await);
    });
}

#[test]
fn async_engine_reuses_pooled_connections() {
    let server = users_server();
    let aio = create_async_engine(&url(
        "dqlite+aio",
        &server,
        "?pool_size=1&max_overflow=0&pool_timeout=0.05",
    ))
    .unwrap();
    assert_eq!(aio.dialect().pool_kind(), dqlite_pool::PoolKind::Queue);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let first = unwrap_outcome(aio.connect(&cx).await);
        let opened = server.connections();
        match aio.connect(&cx).await {
            Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Timeout),
            Outcome::Ok(_) => panic!("second checkout should exceed the pool"),
            _ => panic!("expected a pool error"),
        }
        unwrap_outcome(first.close(&cx).await);
        assert_eq!(aio.pool_stats().idle_connections, 1);

        let mut second = unwrap_outcome(aio.connect(&cx).await);
        assert_eq!(server.connections(), opened);
        unwrap_outcome(second.begin(&cx).await);
        assert!(unwrap_outcome(second.in_transaction(&cx).await));
        unwrap_outcome(second.rollback(&cx).await);
        unwrap_outcome(second.close(&cx).await);
    });

    assert_eq!(aio.dispose(), 1);
    assert_eq!(aio.pool_stats().idle_connections, 0);
}

#[test]
fn async_cursor_runs_on_its_checkout() {
    let server = users_server();
    let aio = create_async_engine(&url("dqlite+aio", &server, "?pool_size=1")).unwrap();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let conn = unwrap_outcome(aio.connect(&cx).await);
        let mut cursor = unwrap_outcome(conn.execute(&cx, "SELECT 1", &[]).await);
        assert!(std::ptr::eq(cursor.connection(), conn.driver_connection()));
        assert_eq!(cursor.fetchall().len(), 1);
        unwrap_outcome(
            cursor
                .execute(&cx, "INSERT INTO users (name) VALUES (?)", &[Value::Null])
                .await,
        );
        assert_eq!(cursor.rowcount(), 1);
        assert_eq!(aio.pool_stats().active_connections, 1);
        unwrap_outcome(conn.close(&cx).await);
    });

    let stats = aio.pool_stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(server.connections(), 1);
}

#[test]
fn async_cursor_executemany_and_fetch() {
    let server = users_server();
    let aio = create_async_engine(&url("dqlite+aio", &server, "")).unwrap();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let conn = unwrap_outcome(aio.connect(&cx).await);
        let mut cursor = conn.cursor();
        unwrap_outcome(
            cursor
                .executemany(
                    &cx,
                    "INSERT INTO users (name) VALUES (?)",
                    &[
                        vec![Value::Text("a".into())],
                        vec![Value::Text("b".into())],
                        vec![Value::Text("c".into())],
                    ],
                )
                .await,
        );
        assert_eq!(cursor.rowcount(), 3);
        assert_eq!(cursor.lastrowid(), Some(3));

        unwrap_outcome(cursor.execute(&cx, "SELECT id, name FROM users", &[]).await);
        cursor.set_arraysize(2);
        assert_eq!(cursor.fetchmany(None).len(), 2);
        assert_eq!(cursor.by_ref().count(), 1);

        unwrap_outcome(
            cursor
                .execute_named(&cx, "DELETE FROM users WHERE 1 = :one", &[("one", Value::Int(1))])
                .await,
        );
        assert_eq!(cursor.rowcount(), 3);
        unwrap_outcome(conn.close(&cx).await);
    });
}
