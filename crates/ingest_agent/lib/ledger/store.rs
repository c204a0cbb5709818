use ledger_core::db::{int_opt, quote, quote_opt, StoreDb};
use ledger_core::{DocumentIngestStatus, DocumentVersions, LedgerState, OutputKey};

use crate::error::LedgerError;

const INGEST_COLUMNS: &str = "connection_name, identifier_class, identifier_hash, status, \
     document_version, transformation_version, output_version, parameter_version, authority_name, \
     document_uri, first_ingest, last_ingest, change_count, last_record_time, last_check_time";

/// Versions and destination state to record for one output.
pub(crate) struct StatusUpdate<'a> {
    pub key: &'a OutputKey,
    pub state: LedgerState,
    pub versions: &'a DocumentVersions,
    pub transformation_version: &'a str,
    pub output_version: &'a str,
    pub document_uri: Option<&'a str>,
}

fn key_clause(key: &OutputKey) -> String {
    format!(
        "(connection_name = {} AND identifier_class = {} AND identifier_hash = {})",
        quote(&key.connection_name),
        quote(&key.identifier_class),
        quote(&key.identifier_hash)
    )
}

fn keys_clause(keys: &[OutputKey]) -> String {
    keys.iter().map(key_clause).collect::<Vec<_>>().join(" OR ")
}

pub(crate) fn load_statuses<C: StoreDb>(
    conn: &mut C,
    keys: &[OutputKey],
) -> Result<Vec<DocumentIngestStatus>, LedgerError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let rows = conn.load_ingest_rows(&format!(
        "SELECT {INGEST_COLUMNS} FROM ingest_status WHERE {}",
        keys_clause(keys)
    ))?;
    rows.into_iter()
        .map(|row| DocumentIngestStatus::try_from(row).map_err(LedgerError::from))
        .collect()
}

fn lock_status<C: StoreDb>(
    conn: &mut C,
    key: &OutputKey,
) -> Result<Option<DocumentIngestStatus>, LedgerError> {
    let sql = format!(
        "SELECT {INGEST_COLUMNS} FROM ingest_status WHERE {}{}",
        key_clause(key),
        conn.row_lock_suffix()
    );
    match conn.load_ingest_rows(&sql)?.into_iter().next() {
        Some(row) => Ok(Some(DocumentIngestStatus::try_from(row)?)),
        None => Ok(None),
    }
}

/// Replaces the row for `update.key` wholesale; no field of the old row survives except the
/// version-change bookkeeping.
pub(crate) fn replace_status<C: StoreDb>(
    conn: &mut C,
    update: &StatusUpdate<'_>,
    now_ms: i64,
) -> Result<DocumentIngestStatus, LedgerError> {
    conn.write_transaction(|conn| -> Result<DocumentIngestStatus, LedgerError> {
        let prior = lock_status(conn, update.key)?;
        let new_version = update.versions.document_version.as_str();
        let (first_ingest, last_ingest, change_count) = match &prior {
            Some(prior) if prior.document_version.as_deref() == Some(new_version) => {
                (prior.first_ingest, prior.last_ingest, prior.change_count)
            }
            Some(prior) => (
                prior.first_ingest.or(Some(now_ms)),
                Some(now_ms),
                prior.change_count + 1,
            ),
            None => (Some(now_ms), Some(now_ms), 1),
        };

        let status = DocumentIngestStatus {
            key: update.key.clone(),
            state: update.state,
            document_version: Some(update.versions.document_version.clone()),
            transformation_version: Some(update.transformation_version.to_string()),
            output_version: Some(update.output_version.to_string()),
            parameter_version: Some(update.versions.parameter_version.clone()),
            authority_name: Some(update.versions.authority_name.clone()),
            document_uri: update.document_uri.map(str::to_string),
            first_ingest,
            last_ingest,
            change_count,
            last_record_time: Some(now_ms),
            last_check_time: prior.as_ref().and_then(|prior| prior.last_check_time),
        };

        conn.execute_sql(&format!(
            "DELETE FROM ingest_status WHERE {}",
            key_clause(update.key)
        ))?;
        insert_status(conn, &status)?;
        Ok(status)
    })
}

fn insert_status<C: StoreDb>(conn: &mut C, status: &DocumentIngestStatus) -> Result<(), LedgerError> {
    conn.execute_sql(&format!(
        "INSERT INTO ingest_status ({INGEST_COLUMNS}) VALUES \
         ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
        quote(&status.key.connection_name),
        quote(&status.key.identifier_class),
        quote(&status.key.identifier_hash),
        quote(status.state.as_db_str()),
        quote_opt(status.document_version.as_deref()),
        quote_opt(status.transformation_version.as_deref()),
        quote_opt(status.output_version.as_deref()),
        quote_opt(status.parameter_version.as_deref()),
        quote_opt(status.authority_name.as_deref()),
        quote_opt(status.document_uri.as_deref()),
        int_opt(status.first_ingest),
        int_opt(status.last_ingest),
        status.change_count,
        int_opt(status.last_record_time),
        int_opt(status.last_check_time),
    ))?;
    Ok(())
}

pub(crate) fn touch_check_time<C: StoreDb>(
    conn: &mut C,
    keys: &[OutputKey],
    now_ms: i64,
) -> Result<usize, LedgerError> {
    if keys.is_empty() {
        return Ok(0);
    }
    Ok(conn.execute_sql(&format!(
        "UPDATE ingest_status SET last_check_time = {now_ms} WHERE {}",
        keys_clause(keys)
    ))?)
}

pub(crate) fn delete_statuses<C: StoreDb>(
    conn: &mut C,
    keys: &[OutputKey],
) -> Result<usize, LedgerError> {
    if keys.is_empty() {
        return Ok(0);
    }
    Ok(conn.execute_sql(&format!(
        "DELETE FROM ingest_status WHERE {}",
        keys_clause(keys)
    ))?)
}

pub(crate) fn reset_connection<C: StoreDb>(
    conn: &mut C,
    connection_name: &str,
) -> Result<usize, LedgerError> {
    Ok(conn.execute_sql(&format!(
        "UPDATE ingest_status SET status = {} WHERE connection_name = {}",
        quote(LedgerState::NeverSeen.as_db_str()),
        quote(connection_name)
    ))?)
}

pub(crate) fn remove_connection<C: StoreDb>(
    conn: &mut C,
    connection_name: &str,
) -> Result<usize, LedgerError> {
    Ok(conn.execute_sql(&format!(
        "DELETE FROM ingest_status WHERE connection_name = {}",
        quote(connection_name)
    ))?)
}
