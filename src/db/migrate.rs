use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use crate::error::{Result, TempographError};

/// One `NNN_name.sql` file.
struct Migration {
    version: u32,
    name: String,
    sql: String,
    checksum: String,
}

impl Migration {
    fn from_file(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TempographError::Config(format!("unreadable migration path {}", path.display())))?;
        let (prefix, _) = file_name.split_once('_').unwrap_or((file_name, ""));
        let version = prefix
            .parse::<u32>()
            .map_err(|_| TempographError::Config(format!("migration {} has no numeric version prefix", file_name)))?;

        let sql = fs::read_to_string(path)?;
        let checksum = format!("{:x}", Sha256::digest(sql.as_bytes()));
        Ok(Self {
            version,
            name: file_name.trim_end_matches(".sql").to_string(),
            sql,
            checksum,
        })
    }
}

/// Schema versions already recorded in the database, lowest first.
pub fn applied_versions(conn: &Connection) -> Result<Vec<u32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(versions)
}

fn load_migrations(dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("sql") {
            migrations.push(Migration::from_file(&path)?);
        }
    }
    migrations.sort_by_key(|m| m.version);

    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(TempographError::Config(format!(
            "migrations {} and {} share version {}",
            pair[0].name, pair[1].name, pair[0].version
        )));
    }
    Ok(migrations)
}

/// Apply every migration in `dir` that the database has not seen, each in its own
/// transaction. A recorded migration whose file has since changed is an error.
///
/// Returns the names of the migrations applied by this call.
pub fn run_migrations(conn: &mut Connection, dir: &Path) -> Result<Vec<String>> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    let mut applied = Vec::new();
    for migration in load_migrations(dir)? {
        let recorded: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = ?1",
                [migration.version],
                |row| row.get(0),
            )
            .optional()?;

        match recorded {
            Some(checksum) if checksum == migration.checksum => {
                log::debug!("Migration {} already applied", migration.name);
                continue;
            }
            Some(_) => {
                return Err(TempographError::Config(format!(
                    "migration {} was edited after it was applied",
                    migration.name
                )));
            }
            None => {}
        }

        log::info!("Applying migration {}", migration.name);
        let tx = conn.transaction()?;
        // execute_batch copes with trigger bodies that contain semicolons
        tx.execute_batch(&migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, checksum) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, migration.checksum],
        )?;
        tx.commit()?;
        applied.push(migration.name);
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(conn: &Connection, sql: &str) -> Vec<String> {
        conn.prepare(sql)
            .unwrap()
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
            .unwrap()
    }

    #[test]
    fn test_load_orders_by_version() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("010_late.sql"), "CREATE TABLE late (id INTEGER);").unwrap();
        fs::write(dir.join("002_early.sql"), "CREATE TABLE early (id INTEGER);").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let migrations = load_migrations(dir).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 2);
        assert_eq!(migrations[1].name, "010_late");
    }

    #[test]
    fn test_bad_versions_rejected() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("init.sql"), "SELECT 1;").unwrap();
        assert!(matches!(load_migrations(temp_dir.path()), Err(TempographError::Config(_))));

        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("001_a.sql"), "SELECT 1;").unwrap();
        fs::write(temp_dir.path().join("001_b.sql"), "SELECT 2;").unwrap();
        assert!(matches!(load_migrations(temp_dir.path()), Err(TempographError::Config(_))));
    }

    #[test]
    fn test_edited_migration_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("migrations");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("001_one.sql"), "CREATE TABLE one (id INTEGER);").unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();

        assert_eq!(run_migrations(&mut conn, &dir).unwrap(), vec!["001_one".to_string()]);
        fs::write(dir.join("001_one.sql"), "CREATE TABLE one (id INTEGER, extra TEXT);").unwrap();
        assert!(matches!(run_migrations(&mut conn, &dir), Err(TempographError::Config(_))));
    }

    #[test]
    fn test_full_migration_schema() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");

        assert_eq!(run_migrations(&mut conn, &dir).unwrap().len(), 3);
        assert!(run_migrations(&mut conn, &dir).unwrap().is_empty());

        let tables = names(&conn, "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name");
        for expected in ["nodes", "edges", "nodes_fts", "edges_fts", "raw_facts", "schema_migrations"] {
            assert!(tables.contains(&expected.to_string()), "missing table {}", expected);
        }

        let triggers = names(&conn, "SELECT name FROM sqlite_master WHERE type='trigger'");
        assert!(triggers.iter().any(|t| t == "nodes_fts_update"));
        assert!(triggers.iter().any(|t| t == "edges_fts_delete"));

        assert_eq!(applied_versions(&conn).unwrap(), vec![1, 2, 3]);
    }
}
