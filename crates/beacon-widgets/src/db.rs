use beacon_core::Result;
use rusqlite::Connection;

use crate::store::db_err;

/// Create the dashboard, widget and instance tables.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS dashboards (
            id    INTEGER PRIMARY KEY AUTOINCREMENT,
            name  TEXT NOT NULL,
            token TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS categories (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            name           TEXT NOT NULL,
            technical_name TEXT NOT NULL UNIQUE,
            parameters     TEXT NOT NULL DEFAULT '[]'
        );
        CREATE TABLE IF NOT EXISTS widgets (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            technical_name TEXT NOT NULL UNIQUE,
            category_id    INTEGER REFERENCES categories(id),
            parameters     TEXT NOT NULL DEFAULT '[]',
            script         TEXT NOT NULL,
            delay_secs     INTEGER,
            timeout_secs   INTEGER
        );
        CREATE TABLE IF NOT EXISTS widget_instances (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            dashboard_id        INTEGER NOT NULL REFERENCES dashboards(id) ON DELETE CASCADE,
            widget_id           INTEGER NOT NULL REFERENCES widgets(id),
            backend_config      TEXT NOT NULL DEFAULT '',
            custom_style        TEXT,
            col                 INTEGER NOT NULL DEFAULT 0,
            row                 INTEGER NOT NULL DEFAULT 0,
            width               INTEGER NOT NULL DEFAULT 1,
            height              INTEGER NOT NULL DEFAULT 1,
            data                TEXT,
            log                 TEXT,
            state               TEXT NOT NULL DEFAULT 'STOPPED',
            last_execution_date TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_instances_dashboard
            ON widget_instances(dashboard_id);",
    )
    .map_err(db_err)?;
    Ok(())
}
