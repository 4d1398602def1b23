//! Tests for the bulk-insert repository

mod common;

use common::{mock_pool, MockConnector};
use std::sync::Arc;
use std::time::Duration;
use tributary::prelude::*;

fn repository(connector: &MockConnector) -> Repository<MockConnector> {
    Repository::new(Arc::new(mock_pool(&["a:9000", "b:9000"], connector)))
}

struct Click {
    user: u64,
    page: &'static str,
}

impl IntoRow for Click {
    fn into_row(self) -> Row {
        vec![self.user.into(), self.page.into()]
    }
}

#[test]
fn test_bulk_insert_builds_statement() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    let repo = repository(&connector);

    let rows = vec![vec![Value::Int64(1)], vec![Value::Int64(2)]];
    assert_eq!(repo.bulk_insert("events", ["id"], &rows).unwrap(), 2);

    let executed = connector.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].sql, "INSERT INTO events(id) VALUES @bulk");
    assert_eq!(executed[0].rows, 2);
    assert_eq!(executed[0].endpoint, "a:9000");
}

#[test]
fn test_bulk_insert_entities() {
    let connector = MockConnector::with_reachable(&["b:9000"]);
    let repo = repository(&connector);

    let clicks = vec![
        Click { user: 1, page: "/" },
        Click { user: 2, page: "/docs" },
    ];
    assert_eq!(
        repo.bulk_insert_entities("clicks", ["user", "page"], clicks)
            .unwrap(),
        2
    );
    assert_eq!(connector.executed()[0].endpoint, "b:9000");
}

#[test]
fn test_empty_bulk_does_not_rent() {
    let connector = MockConnector::default();
    let repo = repository(&connector);

    assert_eq!(repo.bulk_insert("events", ["id"], &[]).unwrap(), 0);
    assert!(connector.attempts().is_empty());
}

#[test]
fn test_bulk_query_requires_placeholder() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    let repo = repository(&connector);

    let err = repo
        .bulk_insert_query("INSERT INTO t VALUES (1)", &[vec![Value::Int64(1)]])
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Query);
}

#[test]
fn test_invalid_table_is_configuration_error() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    let repo = repository(&connector);

    let err = repo
        .bulk_insert("", ["id"], &[vec![Value::Int64(1)]])
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_connection_error_discards_connection() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    let repo = repository(&connector).with_rent_timeout(Duration::from_millis(100));

    repo.execute("SELECT 1", &[]).unwrap();
    assert_eq!(repo.pool().idle(), 1);

    connector.break_next();
    let err = repo.execute("SELECT 1", &[]).unwrap_err();
    assert!(err.is_retriable());
    assert_eq!(repo.pool().size(), 0);

    repo.execute("SELECT 1", &[]).unwrap();
    assert_eq!(repo.pool().stats().connections_created, 2);
}

#[test]
fn test_timed_out_statement_discards_connection() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    let repo = repository(&connector);

    repo.execute("SELECT 1", &[]).unwrap();
    assert_eq!(repo.pool().idle(), 1);

    connector.time_out_next();
    let err = repo.execute("SELECT sleep(3)", &[]).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert_eq!(repo.pool().size(), 0);
}

#[test]
fn test_all_endpoints_down() {
    let connector = MockConnector::default();
    let repo = repository(&connector);

    let err = repo.execute("SELECT 1", &[]).unwrap_err();
    assert!(matches!(err, Error::ConnectionUnavailable { attempted: 2, .. }));
}

// ==================== Read Tests ====================

#[derive(Debug, PartialEq)]
struct PageHits {
    page: String,
    hits: u64,
}

struct PageHitsMapper;

impl EntityMapper<PageHits> for PageHitsMapper {
    fn map_entity(&self, row: &Row) -> Result<PageHits> {
        match row.as_slice() {
            [Value::String(page), hits] => Ok(PageHits {
                page: page.clone(),
                hits: hits
                    .as_i64()
                    .and_then(|h| u64::try_from(h).ok())
                    .ok_or_else(|| Error::query("hits is not a count"))?,
            }),
            _ => Err(Error::query(format!("unexpected row shape: {:?}", row))),
        }
    }
}

#[test]
fn test_query_scalar_returns_first_cell() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    connector.set_results(vec![
        vec![Value::Int64(42), Value::from("ignored")],
        vec![Value::Int64(7)],
    ]);
    let repo = repository(&connector);

    let count = repo
        .query_scalar("SELECT count() FROM events", &[])
        .unwrap();
    assert_eq!(count, Some(Value::Int64(42)));
    assert_eq!(connector.executed()[0].sql, "SELECT count() FROM events");
    assert_eq!(repo.pool().idle(), 1);
}

#[test]
fn test_query_scalar_without_rows() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    let repo = repository(&connector);

    assert_eq!(repo.query_scalar("SELECT 1 WHERE 0", &[]).unwrap(), None);
}

#[test]
fn test_query_with_reader() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    connector.set_results(vec![vec![Value::Int64(1)], vec![Value::Int64(2)]]);
    let repo = repository(&connector);

    let total = repo
        .query_with("SELECT id FROM events", &[], |rows| {
            Ok(rows.iter().filter_map(|row| row[0].as_i64()).sum::<i64>())
        })
        .unwrap();
    assert_eq!(total, 3);
}

#[test]
fn test_query_map_with_mapper() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    connector.set_results(vec![
        vec![Value::from("/"), Value::Int64(10)],
        vec![Value::from("/docs"), Value::UInt64(3)],
    ]);
    let repo = repository(&connector);

    let hits = repo
        .query_map("SELECT page, count() FROM clicks GROUP BY page", &[], &PageHitsMapper)
        .unwrap();
    assert_eq!(
        hits,
        vec![
            PageHits {
                page: "/".into(),
                hits: 10
            },
            PageHits {
                page: "/docs".into(),
                hits: 3
            },
        ]
    );
}

#[test]
fn test_query_map_with_closure_and_mapping_error() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    connector.set_results(vec![vec![Value::from("x")], vec![Value::Null]]);
    let repo = repository(&connector);

    let names = |row: &Row| -> Result<String> {
        row[0]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::query("name is NULL"))
    };
    let err = repo.query_map("SELECT name FROM t", &[], &names).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Query);

    // A mapping failure is not a connection failure
    assert_eq!(repo.pool().idle(), 1);
}

#[test]
fn test_failed_query_discards_connection() {
    let connector = MockConnector::with_reachable(&["a:9000"]);
    let repo = repository(&connector);

    connector.break_next();
    assert!(repo.query("SELECT 1", &[]).is_err());
    assert_eq!(repo.pool().size(), 0);
}
