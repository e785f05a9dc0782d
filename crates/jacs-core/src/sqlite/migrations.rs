#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_service_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS service_records (
    service_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    parent_id INTEGER,
    root_id INTEGER,
    dependency_ids_json TEXT NOT NULL DEFAULT '[]',
    parameters_json TEXT NOT NULL DEFAULT '{}',
    working_directory TEXT,
    timeout_ms INTEGER,
    created_at_unix_ms INTEGER NOT NULL,
    modified_at_unix_ms INTEGER NOT NULL,
    process_started_at_unix_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_service_records_state
    ON service_records (state, service_id);

CREATE INDEX IF NOT EXISTS idx_service_records_parent
    ON service_records (parent_id);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_service_records_parent;
DROP INDEX IF EXISTS idx_service_records_state;
DROP TABLE IF EXISTS service_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_service_results_and_events",
    up_sql: r#"
ALTER TABLE service_records ADD COLUMN result_json TEXT;
ALTER TABLE service_records ADD COLUMN error_message TEXT;
ALTER TABLE service_records ADD COLUMN events_json TEXT NOT NULL DEFAULT '[]';
"#,
    down_sql: r#"
ALTER TABLE service_records DROP COLUMN events_json;
ALTER TABLE service_records DROP COLUMN error_message;
ALTER TABLE service_records DROP COLUMN result_json;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
