use diesel::result::Error as DieselError;
use ledger_core::db::{quote, ConnectionRow, StoreDb};
use ledger_core::{ConfigParams, ConnectionDefinition, DefinitionError};

const CONNECTION_COLUMNS: &str =
    "connection_name, description, class_name, max_count, config_document";

pub(crate) fn load_all_names<C: StoreDb>(conn: &mut C) -> Result<Vec<String>, DieselError> {
    let rows = conn.load_names(
        "SELECT connection_name FROM output_connections \
         ORDER BY LOWER(connection_name) ASC, connection_name ASC",
    )?;
    Ok(rows.into_iter().map(|row| row.connection_name).collect())
}

pub(crate) fn load_definitions<C: StoreDb>(
    conn: &mut C,
    names: &[&str],
) -> Result<Vec<ConnectionRow>, DieselError> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let in_list = names
        .iter()
        .map(|name| quote(name))
        .collect::<Vec<_>>()
        .join(", ");
    conn.load_connections(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM output_connections WHERE connection_name IN ({in_list})"
    ))
}

/// Reads one definition and holds its row lock until the enclosing transaction ends.
pub(crate) fn lock_definition<C: StoreDb>(
    conn: &mut C,
    name: &str,
) -> Result<Option<ConnectionRow>, DieselError> {
    let sql = format!(
        "SELECT {CONNECTION_COLUMNS} FROM output_connections WHERE connection_name = {}{}",
        quote(name),
        conn.row_lock_suffix()
    );
    Ok(conn.load_connections(&sql)?.into_iter().next())
}

pub(crate) fn insert_definition<C: StoreDb>(
    conn: &mut C,
    definition: &ConnectionDefinition,
    config_document: &str,
) -> Result<(), DieselError> {
    conn.execute_sql(&format!(
        "INSERT INTO output_connections ({CONNECTION_COLUMNS}) VALUES ({}, {}, {}, {}, {})",
        quote(&definition.name),
        quote(&definition.description),
        quote(&definition.class_name),
        definition.max_connections,
        quote(config_document),
    ))?;
    Ok(())
}

pub(crate) fn update_definition<C: StoreDb>(
    conn: &mut C,
    definition: &ConnectionDefinition,
    config_document: &str,
) -> Result<(), DieselError> {
    conn.execute_sql(&format!(
        "UPDATE output_connections \
         SET description = {}, class_name = {}, max_count = {}, config_document = {} \
         WHERE connection_name = {}",
        quote(&definition.description),
        quote(&definition.class_name),
        definition.max_connections,
        quote(config_document),
        quote(&definition.name),
    ))?;
    Ok(())
}

pub(crate) fn delete_definition<C: StoreDb>(conn: &mut C, name: &str) -> Result<usize, DieselError> {
    conn.execute_sql(&format!(
        "DELETE FROM output_connections WHERE connection_name = {}",
        quote(name)
    ))
}

pub(crate) fn names_for_class<C: StoreDb>(
    conn: &mut C,
    class_name: &str,
) -> Result<Vec<String>, DieselError> {
    let rows = conn.load_names(&format!(
        "SELECT connection_name FROM output_connections WHERE class_name = {} \
         ORDER BY connection_name ASC",
        quote(class_name)
    ))?;
    Ok(rows.into_iter().map(|row| row.connection_name).collect())
}

pub(crate) fn count_ledger_rows<C: StoreDb>(conn: &mut C, name: &str) -> Result<i64, DieselError> {
    let rows = conn.load_counts(&format!(
        "SELECT COUNT(*) AS row_count FROM ingest_status WHERE connection_name = {}",
        quote(name)
    ))?;
    Ok(rows.first().map(|row| row.row_count).unwrap_or_default())
}

pub(crate) fn row_to_definition(row: ConnectionRow) -> Result<ConnectionDefinition, DefinitionError> {
    let config = ConfigParams::from_document(row.config_document.as_deref().unwrap_or_default())?;
    let max_connections = i32::try_from(row.max_count).map_err(|_| {
        DefinitionError::InvalidMaxConnections {
            name: row.connection_name.clone(),
            max_connections: i32::MAX,
        }
    })?;
    Ok(ConnectionDefinition {
        name: row.connection_name,
        description: row.description.unwrap_or_default(),
        class_name: row.class_name,
        max_connections,
        config,
    })
}
