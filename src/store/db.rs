use rusqlite::Connection;
use std::path::PathBuf;

use crate::error::GatewayResult;

/// Database file path: the container volume when present, the user data dir otherwise.
pub fn get_db_path() -> Result<PathBuf, String> {
    Ok(crate::logger::get_data_dir()?.join("accounts.db"))
}

/// Open (or create) the accounts database and bring the schema up to date.
pub fn open(path: &PathBuf) -> GatewayResult<Connection> {
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> GatewayResult<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> GatewayResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            label TEXT,
            clientId TEXT,
            clientSecret TEXT,
            refreshToken TEXT,
            accessToken TEXT,
            other TEXT,
            last_refresh_time TEXT,
            last_refresh_status TEXT,
            created_at TEXT,
            updated_at TEXT,
            enabled INTEGER DEFAULT 1,
            type TEXT DEFAULT 'codewhisperer'
        )",
        [],
    )?;

    migrate_type_column(conn)?;
    Ok(())
}

/// Tables written before the second provider was added lack the `type`
/// column; add it with the legacy default.
fn migrate_type_column(conn: &Connection) -> GatewayResult<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(accounts)")?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();

    if !columns.iter().any(|c| c == "type") {
        tracing::info!("Migrating accounts table: adding type column");
        conn.execute(
            "ALTER TABLE accounts ADD COLUMN type TEXT DEFAULT 'codewhisperer'",
            [],
        )?;
    }

    Ok(())
}
