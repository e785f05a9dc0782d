use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::{
    CoreError, CoreErrorKind, PageRequest, PageResult, ServiceId, ServiceRecord, ServiceState,
};
use crate::persistence::{MigrationStore, PersistenceResult, ServiceStore, missing_record_error};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "jacs_schema_migrations";

const SELECT_RECORD: &str = "
SELECT
    r.service_id, r.name, r.state, r.parent_id, r.root_id, r.dependency_ids_json,
    r.parameters_json, r.working_directory, r.timeout_ms, r.result_json, r.error_message,
    r.events_json, r.created_at_unix_ms, r.modified_at_unix_ms, r.process_started_at_unix_ms
FROM service_records r";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // DDL is idempotent apart from ADD COLUMN, which the tolerant
                // batch skips, so re-applying repairs a half-created schema.
                for version in 1..=target_version {
                    execute_batch_tolerant(connection, defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl ServiceStore for SqliteStore {
    fn save(&self, record: &ServiceRecord) -> PersistenceResult<ServiceRecord> {
        self.with_connection("save", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO service_records (
    name, state, parent_id, root_id, dependency_ids_json, parameters_json,
    working_directory, timeout_ms, result_json, error_message, events_json,
    created_at_unix_ms, modified_at_unix_ms, process_started_at_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
",
                params![
                    record.name.as_str(),
                    record.state.as_str(),
                    record.parent_id.map(service_id_to_i64).transpose()?,
                    record.root_id.map(service_id_to_i64).transpose()?,
                    to_json(&record.dependency_ids)?,
                    to_json(&record.parameters)?,
                    record.working_directory.as_deref().map(path_to_string),
                    record.timeout.map(duration_to_millis).transpose()?,
                    record.result.as_ref().map(to_json).transpose()?,
                    record.error_message.as_deref(),
                    to_json(&record.events)?,
                    to_unix_millis(record.created_at)?,
                    to_unix_millis(record.modified_at)?,
                    record.process_started_at.map(to_unix_millis).transpose()?,
                ],
            )?;

            let mut saved = record.clone();
            saved.id = Some(ServiceId(i64_to_u64(connection.last_insert_rowid())?));
            Ok(saved)
        })
    }

    fn update(&self, record: &ServiceRecord) -> PersistenceResult<()> {
        let id = record.required_id()?;
        let changed = self.with_connection("update", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
UPDATE service_records SET
    name = ?2,
    state = ?3,
    parent_id = ?4,
    root_id = ?5,
    dependency_ids_json = ?6,
    parameters_json = ?7,
    working_directory = ?8,
    timeout_ms = ?9,
    result_json = ?10,
    error_message = ?11,
    events_json = ?12,
    modified_at_unix_ms = ?13,
    process_started_at_unix_ms = ?14
WHERE service_id = ?1
",
                params![
                    service_id_to_i64(id)?,
                    record.name.as_str(),
                    record.state.as_str(),
                    record.parent_id.map(service_id_to_i64).transpose()?,
                    record.root_id.map(service_id_to_i64).transpose()?,
                    to_json(&record.dependency_ids)?,
                    to_json(&record.parameters)?,
                    record.working_directory.as_deref().map(path_to_string),
                    record.timeout.map(duration_to_millis).transpose()?,
                    record.result.as_ref().map(to_json).transpose()?,
                    record.error_message.as_deref(),
                    to_json(&record.events)?,
                    to_unix_millis(record.modified_at)?,
                    record.process_started_at.map(to_unix_millis).transpose()?,
                ],
            )
        })?;

        if changed == 0 {
            return Err(missing_record_error(id));
        }
        Ok(())
    }

    fn find_by_id(&self, id: ServiceId) -> PersistenceResult<Option<ServiceRecord>> {
        self.with_connection("find_by_id", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("{SELECT_RECORD} WHERE r.service_id = ?1"),
                    [service_id_to_i64(id)?],
                    service_record_from_row,
                )
                .optional()
        })
    }

    fn find_by_state(
        &self,
        states: &[ServiceState],
        page: PageRequest,
    ) -> PersistenceResult<PageResult<ServiceRecord>> {
        if states.is_empty() {
            return Ok(PageResult::new(page, Vec::new()));
        }

        let records = self.with_connection("find_by_state", |connection| {
            ensure_schema_ready(connection)?;
            let placeholders = vec!["?"; states.len()].join(", ");
            let mut statement = connection.prepare(&format!(
                "{SELECT_RECORD} WHERE r.state IN ({placeholders}) ORDER BY r.service_id LIMIT ? OFFSET ?"
            ))?;

            let mut values: Vec<SqlValue> = states
                .iter()
                .map(|state| SqlValue::Text(state.as_str().to_string()))
                .collect();
            values.push(SqlValue::Integer(to_i64(page.page_size)?));
            values.push(SqlValue::Integer(to_i64(page.offset())?));

            let rows = statement.query_map(params_from_iter(values), service_record_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        Ok(PageResult::new(page, records))
    }

    fn find_child_services(&self, parent_id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>> {
        self.with_connection("find_child_services", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "{SELECT_RECORD} WHERE r.parent_id = ?1 ORDER BY r.service_id"
            ))?;
            let rows = statement.query_map([service_id_to_i64(parent_id)?], service_record_from_row)?;
            rows.collect()
        })
    }

    fn find_service_hierarchy(&self, id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>> {
        let hierarchy = self.with_connection("find_service_hierarchy", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
WITH RECURSIVE hierarchy(service_id, depth) AS (
    SELECT service_id, 0 FROM service_records WHERE service_id = ?1
    UNION ALL
    SELECT child.service_id, hierarchy.depth + 1
    FROM service_records child
    JOIN hierarchy ON child.parent_id = hierarchy.service_id
)
{SELECT_RECORD}
JOIN hierarchy h ON h.service_id = r.service_id
ORDER BY h.depth, r.service_id
"
            ))?;
            let rows = statement.query_map([service_id_to_i64(id)?], service_record_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        if hierarchy.is_empty() {
            return Err(missing_record_error(id));
        }
        Ok(hierarchy)
    }
}

fn service_record_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceRecord> {
    let state_raw: String = row.get(2)?;
    let working_directory: Option<String> = row.get(7)?;
    let timeout_ms: Option<i64> = row.get(8)?;
    let result_json: Option<String> = row.get(9)?;
    let process_started_at: Option<i64> = row.get(14)?;

    Ok(ServiceRecord {
        id: Some(ServiceId(i64_to_u64(row.get(0)?)?)),
        name: row.get(1)?,
        state: parse_service_state(&state_raw)?,
        parent_id: row.get::<_, Option<i64>>(3)?.map(i64_to_service_id).transpose()?,
        root_id: row.get::<_, Option<i64>>(4)?.map(i64_to_service_id).transpose()?,
        dependency_ids: from_json(&row.get::<_, String>(5)?)?,
        parameters: from_json(&row.get::<_, String>(6)?)?,
        working_directory: working_directory.map(PathBuf::from),
        timeout: timeout_ms.map(millis_to_duration).transpose()?,
        result: result_json.as_deref().map(from_json).transpose()?,
        error_message: row.get(10)?,
        events: from_json(&row.get::<_, String>(11)?)?,
        created_at: from_unix_millis(row.get(12)?)?,
        modified_at: from_unix_millis(row.get(13)?)?,
        process_started_at: process_started_at.map(from_unix_millis).transpose()?,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before service operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

/// Execute a SQL batch, tolerating "duplicate column name" errors from
/// `ALTER TABLE ADD COLUMN` which is not idempotent in SQLite.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    match connection.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e),
    }
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_service_state(raw: &str) -> rusqlite::Result<ServiceState> {
    raw.parse::<ServiceState>().map_err(|_| {
        storage_error_sqlite(&format!("unknown service state '{raw}' in sqlite record"))
    })
}

fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| storage_error_sqlite(&format!("failed to encode json column: {error}")))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|error| storage_error_sqlite(&format!("failed to decode json column: {error}")))
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn duration_to_millis(value: Duration) -> rusqlite::Result<i64> {
    i64::try_from(value.as_millis())
        .map_err(|_| storage_error_sqlite("timeout millis exceed i64 range"))
}

fn millis_to_duration(value: i64) -> rusqlite::Result<Duration> {
    let millis =
        u64::try_from(value).map_err(|_| storage_error_sqlite("negative timeout in sqlite record"))?;
    Ok(Duration::from_millis(millis))
}

fn service_id_to_i64(value: ServiceId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("service id exceeds i64 range"))
}

fn i64_to_service_id(value: i64) -> rusqlite::Result<ServiceId> {
    i64_to_u64(value).map(ServiceId)
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative service id in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
