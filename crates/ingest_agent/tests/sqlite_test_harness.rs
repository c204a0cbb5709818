use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Text};
use ledger_core::db::sqlite_test::setup_in_memory_sqlite;

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

#[test]
fn sqlite_harness_creates_ledger_tables() {
    let mut conn = setup_in_memory_sqlite();

    let rows: Vec<NameRow> = sql_query(
        "
        SELECT name
        FROM sqlite_master
        WHERE type = 'table'
          AND name IN ('output_connections', 'ingest_status')
        ORDER BY name
        ",
    )
    .load(&mut conn)
    .expect("failed to query sqlite_master");

    let names: Vec<String> = rows.into_iter().map(|row| row.name).collect();
    assert_eq!(
        names,
        vec!["ingest_status".to_string(), "output_connections".to_string()]
    );
}

#[test]
fn sqlite_harness_creates_document_uri_index() {
    let mut conn = setup_in_memory_sqlite();

    let index_count: CountRow = sql_query(
        "
        SELECT COUNT(*) AS count
        FROM sqlite_master
        WHERE type = 'index'
          AND name = 'idx_ingest_status_uri'
          AND tbl_name = 'ingest_status'
        ",
    )
    .get_result(&mut conn)
    .expect("failed to query index metadata");

    assert_eq!(index_count.count, 1);
}

#[test]
fn sqlite_harness_enforces_max_count_check() {
    let mut conn = setup_in_memory_sqlite();

    let rejected = sql_query(
        "INSERT INTO output_connections (connection_name, class_name, max_count) \
         VALUES ('solr', 'solr.connector', 0)",
    )
    .execute(&mut conn);
    assert!(rejected.is_err());

    let accepted = sql_query(
        "INSERT INTO output_connections (connection_name, class_name, max_count) \
         VALUES ('solr', 'solr.connector', 1)",
    )
    .execute(&mut conn)
    .expect("valid connection row");
    assert_eq!(accepted, 1);
}
