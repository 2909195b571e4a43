use std::path::Path;

use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// One schema migration. Versions are monotonically increasing; each is
/// applied inside its own transaction.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

pub fn all_migrations() -> &'static [Migration] {
    &MIGRATIONS
}

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

static MIGRATIONS: [Migration; 5] = [
    Migration {
        version: 1,
        description: "initial monitoring history schema",
        statements: &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                description TEXT
            )",
            "CREATE TABLE IF NOT EXISTS sla_violation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vessel_id TEXT NOT NULL,
                component_type TEXT NOT NULL,
                violation_start TEXT NOT NULL,
                violation_end TEXT,
                uptime_percentage REAL NOT NULL,
                violation_duration_seconds INTEGER,
                is_resolved INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            "CREATE TABLE IF NOT EXISTS component_status_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vessel_id TEXT NOT NULL,
                component_type TEXT NOT NULL,
                uptime_percentage REAL NOT NULL,
                current_status TEXT NOT NULL,
                downtime_aging_seconds INTEGER NOT NULL,
                last_ping_time TEXT,
                recorded_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS alert_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vessel_id TEXT NOT NULL,
                component_type TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT,
                is_resolved INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )",
        ],
    },
    Migration {
        version: 2,
        description: "tracker ticket table",
        statements: &["CREATE TABLE IF NOT EXISTS tickets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tracker_key TEXT UNIQUE NOT NULL,
                vessel_id TEXT NOT NULL,
                component_type TEXT NOT NULL,
                issue_summary TEXT NOT NULL,
                tracker_status TEXT NOT NULL,
                downtime_seconds INTEGER NOT NULL,
                alert_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                resolved_at TEXT,
                FOREIGN KEY (alert_id) REFERENCES alert_history (id)
            )"],
    },
    Migration {
        version: 3,
        description: "system state key/value table",
        statements: &["CREATE TABLE IF NOT EXISTS system_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state_key TEXT UNIQUE NOT NULL,
                state_value TEXT NOT NULL,
                state_type TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"],
    },
    Migration {
        version: 4,
        description: "scheduler run logging tables",
        statements: &[
            "CREATE TABLE IF NOT EXISTS scheduler_runs (
                id TEXT PRIMARY KEY,
                start_time TEXT NOT NULL,
                end_time TEXT,
                total_vessels INTEGER NOT NULL,
                successful_vessels INTEGER NOT NULL DEFAULT 0,
                failed_vessels INTEGER NOT NULL DEFAULT 0,
                retry_attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
                duration_seconds INTEGER,
                error_message TEXT
            )",
            "CREATE TABLE IF NOT EXISTS scheduler_vessel_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                vessel_id TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                success INTEGER NOT NULL,
                query_duration_seconds REAL NOT NULL,
                error_message TEXT,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (run_id) REFERENCES scheduler_runs (id) ON DELETE CASCADE
            )",
        ],
    },
    Migration {
        version: 5,
        description: "ticket lifecycle records and alert links",
        statements: &[
            "CREATE TABLE IF NOT EXISTS ticket_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tracker_key TEXT UNIQUE NOT NULL,
                tracker_id TEXT NOT NULL,
                vessel_id TEXT NOT NULL,
                component_type TEXT NOT NULL,
                issue_severity TEXT NOT NULL,
                lifecycle_status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                alert_ids TEXT,
                downtime_seconds INTEGER NOT NULL,
                historical_context TEXT,
                resolution_notes TEXT
            )",
            "CREATE TABLE IF NOT EXISTS alert_ticket_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id INTEGER NOT NULL,
                ticket_id INTEGER NOT NULL,
                linked_at TEXT NOT NULL,
                FOREIGN KEY (ticket_id) REFERENCES ticket_records (id),
                UNIQUE (alert_id, ticket_id)
            )",
        ],
    },
];

const INDEX_STATEMENTS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_sla_violation_vessel_component
        ON sla_violation_history (vessel_id, component_type)",
    "CREATE INDEX IF NOT EXISTS idx_sla_violation_start
        ON sla_violation_history (violation_start)",
    "CREATE INDEX IF NOT EXISTS idx_component_status_vessel_component
        ON component_status_history (vessel_id, component_type)",
    "CREATE INDEX IF NOT EXISTS idx_component_status_recorded
        ON component_status_history (recorded_at)",
    "CREATE INDEX IF NOT EXISTS idx_alert_vessel_component
        ON alert_history (vessel_id, component_type)",
    "CREATE INDEX IF NOT EXISTS idx_tickets_vessel_component
        ON tickets (vessel_id, component_type)",
    "CREATE INDEX IF NOT EXISTS idx_ticket_records_vessel_component
        ON ticket_records (vessel_id, component_type)",
    "CREATE INDEX IF NOT EXISTS idx_ticket_records_status
        ON ticket_records (lifecycle_status)",
    "CREATE INDEX IF NOT EXISTS idx_vessel_results_run
        ON scheduler_vessel_results (run_id)",
];

/// Tables that must exist after a successful migration pass.
const EXPECTED_TABLES: &[&str] = &[
    "schema_version",
    "sla_violation_history",
    "component_status_history",
    "alert_history",
    "tickets",
    "system_state",
    "scheduler_runs",
    "scheduler_vessel_results",
    "ticket_records",
    "alert_ticket_links",
];

pub fn current_version(conn: &Connection) -> StoreResult<i64> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if !table_exists {
        return Ok(0);
    }
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })?;
    Ok(version.unwrap_or(0))
}

/// Copy the database file aside before any migration touches it.
pub fn backup_before_migration(db_path: &Path) -> StoreResult<Option<std::path::PathBuf>> {
    if !db_path.exists() {
        return Ok(None);
    }
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let backup_path = db_path.with_file_name(format!(
        "{}.backup.{stamp}",
        db_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "pelorus.db".to_string())
    ));
    std::fs::copy(db_path, &backup_path)?;
    info!(backup = %backup_path.display(), "created pre-migration backup");
    Ok(Some(backup_path))
}

/// Apply every migration above the current version, each in its own
/// transaction, then create indexes and validate the result.
pub fn migrate_to_latest(conn: &mut Connection, db_path: &Path) -> StoreResult<()> {
    let current = current_version(conn)?;
    let latest = latest_version();

    if current >= latest {
        info!(version = current, "database schema already current");
        return Ok(());
    }

    if current > 0 {
        backup_before_migration(db_path)?;
    }

    info!(from = current, to = latest, "migrating database schema");

    for migration in all_migrations() {
        if migration.version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        for statement in migration.statements {
            tx.execute(statement, []).map_err(|e| {
                StoreError::Migration(format!(
                    "migration {} ({}) failed: {e}",
                    migration.version, migration.description
                ))
            })?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at, description)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                Utc::now().to_rfc3339(),
                migration.description
            ],
        )?;
        tx.commit()?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied migration"
        );
    }

    for statement in INDEX_STATEMENTS {
        conn.execute(statement, [])?;
    }

    validate_schema(conn)
}

pub fn validate_schema(conn: &Connection) -> StoreResult<()> {
    for table in EXPECTED_TABLES {
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::Validation(format!(
                "expected table `{table}` is missing"
            )));
        }
    }

    let version = current_version(conn)?;
    if version < latest_version() {
        return Err(StoreError::Validation(format!(
            "schema version {version} is behind latest {}",
            latest_version()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_increasing() {
        let mut last = 0;
        for migration in all_migrations() {
            assert!(migration.version > last);
            last = migration.version;
        }
        assert_eq!(last, latest_version());
    }

    #[test]
    fn fresh_database_migrates_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pelorus.db");
        let mut conn = Connection::open(&path).unwrap();

        assert_eq!(current_version(&conn).unwrap(), 0);
        migrate_to_latest(&mut conn, &path).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());
        validate_schema(&conn).unwrap();

        // Re-running is a no-op.
        migrate_to_latest(&mut conn, &path).unwrap();
    }

    #[test]
    fn upgrade_from_existing_version_takes_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pelorus.db");
        {
            let mut conn = Connection::open(&path).unwrap();
            // Apply only v1 to simulate an old installation.
            let tx = conn.transaction().unwrap();
            for statement in all_migrations()[0].statements {
                tx.execute(statement, []).unwrap();
            }
            tx.execute(
                "INSERT INTO schema_version (version, applied_at, description) VALUES (1, ?1, 'v1')",
                [Utc::now().to_rfc3339()],
            )
            .unwrap();
            tx.commit().unwrap();
        }

        let mut conn = Connection::open(&path).unwrap();
        migrate_to_latest(&mut conn, &path).unwrap();

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn missing_table_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pelorus.db");
        let mut conn = Connection::open(&path).unwrap();
        migrate_to_latest(&mut conn, &path).unwrap();
        conn.execute("DROP TABLE tickets", []).unwrap();
        assert!(matches!(
            validate_schema(&conn),
            Err(StoreError::Validation(_))
        ));
    }
}
