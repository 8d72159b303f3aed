//! SQLite schema of the local feature file
//!
//! One file holds every layer the user works on. Edits to `features` and to
//! a layer's attribute schema are journaled by triggers into
//! `feature_changes`, which the watcher turns into change notifications.
//! Writing only `remote_id` is not journaled.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS layers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            geometry_type TEXT NOT NULL DEFAULT 'point',
            srid INTEGER NOT NULL,
            attributes TEXT NOT NULL DEFAULT '[]',
            parent_id TEXT
        );

        CREATE TABLE IF NOT EXISTS features (
            fid INTEGER PRIMARY KEY AUTOINCREMENT,
            layer_id TEXT NOT NULL,
            x REAL NOT NULL,
            y REAL NOT NULL,
            z REAL NOT NULL DEFAULT 0,
            attributes TEXT NOT NULL DEFAULT '{}',
            remote_id TEXT,
            FOREIGN KEY (layer_id) REFERENCES layers(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS feature_changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            layer_id TEXT NOT NULL,
            fid INTEGER,
            kind TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_features_layer_id ON features(layer_id);
        CREATE INDEX IF NOT EXISTS idx_features_remote_id ON features(remote_id);

        CREATE TRIGGER IF NOT EXISTS features_ai AFTER INSERT ON features BEGIN
            INSERT INTO feature_changes(layer_id, fid, kind)
            VALUES (NEW.layer_id, NEW.fid, 'insert');
        END;

        CREATE TRIGGER IF NOT EXISTS features_au AFTER UPDATE OF x, y, z, attributes ON features BEGIN
            INSERT INTO feature_changes(layer_id, fid, kind)
            VALUES (NEW.layer_id, NEW.fid, 'update');
        END;

        CREATE TRIGGER IF NOT EXISTS features_ad AFTER DELETE ON features BEGIN
            INSERT INTO feature_changes(layer_id, fid, kind)
            VALUES (OLD.layer_id, OLD.fid, 'delete');
        END;

        CREATE TRIGGER IF NOT EXISTS layers_au AFTER UPDATE OF attributes ON layers
        WHEN OLD.attributes IS NOT NEW.attributes BEGIN
            INSERT INTO feature_changes(layer_id, fid, kind)
            VALUES (NEW.id, NULL, 'schema');
        END;
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(conn: &Connection) -> Vec<(Option<i64>, String)> {
        conn.prepare("SELECT fid, kind FROM feature_changes ORDER BY seq")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"layers".to_string()));
        assert!(tables.contains(&"features".to_string()));
        assert!(tables.contains(&"feature_changes".to_string()));
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_triggers_journal_edits_but_not_tagging() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO layers (id, name, srid) VALUES ('l1', 'signs', 4326);
            INSERT INTO features (layer_id, x, y) VALUES ('l1', 1.0, 2.0);
            UPDATE features SET remote_id = 'r1' WHERE fid = 1;
            UPDATE features SET x = 3.0 WHERE fid = 1;
            UPDATE layers SET attributes = '[]' WHERE id = 'l1';
            UPDATE layers SET attributes = '[{"name":"code","type":"str"}]' WHERE id = 'l1';
            DELETE FROM features WHERE fid = 1;
            "#,
        )
        .unwrap();

        assert_eq!(
            journal(&conn),
            vec![
                (Some(1), "insert".to_string()),
                (Some(1), "update".to_string()),
                (None, "schema".to_string()),
                (Some(1), "delete".to_string()),
            ]
        );
    }
}
