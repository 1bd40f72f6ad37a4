use log::info;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CHANNELDB_TARGET_VERSION: u32 = 1;
pub const USAGEDB_TARGET_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum DbError {
    /// The file is not a database we can use (wrong format, or missing its
    /// version table).
    #[error("unable to open db file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    /// The file is at a schema version this build does not know about.
    #[error("{path} is at schema version {found}, expected {target}")]
    SchemaVersion {
        path: PathBuf,
        found: u32,
        target: u32,
    },
    #[error("no upgrader for {name} v{version}")]
    NoUpgrader { name: String, version: u32 },
    #[error("failed foreign key check: {0}")]
    ForeignKeys(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn get_schema(name: &str, version: u32) -> Option<&'static str> {
    match (name, version) {
        ("channel", 1) => Some(include_str!("db-schemas/channel-v1.sql")),
        ("usage", 1) => Some(include_str!("db-schemas/usage-v1.sql")),
        ("usage", 2) => Some(include_str!("db-schemas/usage-v2.sql")),
        _ => None,
    }
}

fn get_upgrader(name: &str, new_version: u32) -> Option<&'static str> {
    match (name, new_version) {
        ("usage", 2) => Some(include_str!("db-schemas/upgrade-usage-to-v2.sql")),
        _ => None,
    }
}

/// One open SQLite database, schema-checked and with foreign keys enforced.
///
/// Opening creates the file at the target schema version (atomically: a
/// sibling temp file is populated and renamed into place), or upgrades an
/// older file one version at a time after copying it to a
/// `<path>-backup-vN` file. A file at an unknown newer version is refused.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the channel database. The parent directory must exist.
    pub fn open_channel(path: &Path) -> Result<Self, DbError> {
        Self::open_or_create(path, "channel", CHANNELDB_TARGET_VERSION)
    }

    /// Open or create the usage database.
    pub fn open_usage(path: &Path) -> Result<Self, DbError> {
        Self::open_or_create(path, "usage", USAGEDB_TARGET_VERSION)
    }

    /// An in-memory channel database, for tests.
    pub fn memory_channel() -> Result<Self, DbError> {
        Self::memory("channel", CHANNELDB_TARGET_VERSION)
    }

    /// An in-memory usage database, for tests.
    pub fn memory_usage() -> Result<Self, DbError> {
        Self::memory("usage", USAGEDB_TARGET_VERSION)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn memory(name: &str, target_version: u32) -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        initialize_schema(&conn, name, target_version)?;
        Ok(Database { conn })
    }

    fn open_or_create(path: &Path, name: &str, target_version: u32) -> Result<Self, DbError> {
        let conn = if path.exists() {
            connect(path)?
        } else {
            atomic_create_and_initialize(path, name, target_version)?
        };

        let mut version: u32 = conn
            .query_row("SELECT `version` FROM `version`", [], |row| row.get(0))
            .map_err(|e| DbError::Corrupt {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;

        if version < target_version {
            let backup = format!("{}-backup-v{}", path.display(), version);
            info!("storing backup of v{} db in {}", version, backup);
            fs::copy(path, &backup)?;
        }
        while version < target_version {
            let upgrader = get_upgrader(name, version + 1).ok_or_else(|| DbError::NoUpgrader {
                name: name.to_owned(),
                version: version + 1,
            })?;
            info!("upgrading {} from v{} to v{}", path.display(), version, version + 1);
            conn.execute_batch(upgrader)?;
            version += 1;
        }
        if version != target_version {
            return Err(DbError::SchemaVersion {
                path: path.to_owned(),
                found: version,
                target: target_version,
            });
        }

        Ok(Database { conn })
    }
}

/// Open a connection with foreign keys on, and verify both that the file is
/// a readable database and that its foreign keys are consistent.
fn connect(path: &Path) -> Result<Connection, DbError> {
    let corrupt = |reason: String| DbError::Corrupt {
        path: path.to_owned(),
        reason,
    };
    let conn = Connection::open(path).map_err(|e| corrupt(e.to_string()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON")
        .map_err(|e| corrupt(e.to_string()))?;
    let problems = foreign_key_problems(&conn).map_err(|e| corrupt(e.to_string()))?;
    if !problems.is_empty() {
        return Err(DbError::ForeignKeys(problems.join(", ")));
    }
    Ok(conn)
}

fn foreign_key_problems(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let problems = stmt
        .query_map([], |row| {
            let table: String = row.get(0)?;
            let parent: String = row.get(2)?;
            Ok(format!("{} -> {}", table, parent))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(problems)
}

fn initialize_schema(conn: &Connection, name: &str, target_version: u32) -> Result<(), DbError> {
    info!("populating new database with schema {} v{}", name, target_version);
    let schema = get_schema(name, target_version).ok_or_else(|| DbError::NoUpgrader {
        name: name.to_owned(),
        version: target_version,
    })?;
    conn.execute_batch(schema)?;
    conn.execute(
        "INSERT INTO `version` (`version`) VALUES (?1)",
        [target_version],
    )?;
    Ok(())
}

/// Create and populate a new database file. If anything goes wrong, nothing
/// is left at `path`.
fn atomic_create_and_initialize(
    path: &Path,
    name: &str,
    target_version: u32,
) -> Result<Connection, DbError> {
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db".to_owned());
    let temp_path = path.with_file_name(format!("{}.tmp{}", file_name, std::process::id()));
    let conn = connect(&temp_path)?;
    if let Err(e) = initialize_schema(&conn, name, target_version) {
        drop(conn);
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    if let Err((_, e)) = conn.close() {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    fs::rename(&temp_path, path)?;
    connect(path)
}

#[cfg(test)]
mod tests {
    use super::{Database, DbError, CHANNELDB_TARGET_VERSION, USAGEDB_TARGET_VERSION};
    use rusqlite::params;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wormhole-mailbox-test-{}-{}",
            std::process::id(),
            TEST_DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn version_of(db: &Database) -> u32 {
        db.conn()
            .query_row("SELECT `version` FROM `version`", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn create_in_memory() {
        let db = Database::memory_channel().unwrap();
        assert_eq!(version_of(&db), CHANNELDB_TARGET_VERSION);
        let db = Database::memory_usage().unwrap();
        assert_eq!(version_of(&db), USAGEDB_TARGET_VERSION);
    }

    #[test]
    fn create_and_reopen() {
        let dir = test_dir();
        let path = dir.join("relay.sqlite");

        let db = Database::open_channel(&path).unwrap();
        assert_eq!(version_of(&db), CHANNELDB_TARGET_VERSION);
        db.conn()
            .execute(
                "INSERT INTO `mailboxes` (`app_id`, `id`, `for_nameplate`, `updated`)
                 VALUES ('app', 'mid', 0, 1)",
                [],
            )
            .unwrap();
        drop(db);

        // no temp files left behind
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let db = Database::open_channel(&path).unwrap();
        assert_eq!(version_of(&db), CHANNELDB_TARGET_VERSION);
        let count: u32 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM `mailboxes`", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn reject_non_database() {
        let dir = test_dir();
        let path = dir.join("junk.sqlite");
        fs::write(&path, "I am not a database\n").unwrap();
        let err = Database::open_channel(&path).unwrap_err();
        assert!(matches!(err, DbError::Corrupt { .. }), "{:?}", err);
    }

    #[test]
    fn reject_unknown_newer_version() {
        let dir = test_dir();
        let path = dir.join("relay.sqlite");
        let db = Database::open_channel(&path).unwrap();
        db.conn()
            .execute("UPDATE `version` SET `version`=?1", params![99])
            .unwrap();
        drop(db);
        let err = Database::open_channel(&path).unwrap_err();
        match err {
            DbError::SchemaVersion { found, target, .. } => {
                assert_eq!(found, 99);
                assert_eq!(target, CHANNELDB_TARGET_VERSION);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn upgrade_usage_v1_to_v2() {
        let dir = test_dir();
        let path = dir.join("usage.sqlite");

        let db = Database::open_or_create(&path, "usage", 1).unwrap();
        assert_eq!(version_of(&db), 1);
        db.conn()
            .execute(
                "INSERT INTO `nameplates`
                 (`app_id`, `started`, `waiting_time`, `total_time`, `result`)
                 VALUES ('app', 1, 2, 3, 'happy')",
                [],
            )
            .unwrap();
        drop(db);

        let db = Database::open_usage(&path).unwrap();
        assert_eq!(version_of(&db), 2);
        // old data survives, the new table exists
        let count: u32 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM `nameplates`", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        db.conn()
            .execute(
                "INSERT INTO `client_versions`
                 (`app_id`, `side`, `connect_time`, `implementation`, `version`)
                 VALUES ('app', 's1', 5, 'rust', '0.1')",
                [],
            )
            .unwrap();

        // the previous file was backed up before upgrading
        let backup = dir.join("usage.sqlite-backup-v1");
        assert!(backup.exists());
    }

    #[test]
    fn missing_upgrader() {
        let dir = test_dir();
        let path = dir.join("relay.sqlite");
        let db = Database::open_channel(&path).unwrap();
        db.conn()
            .execute("UPDATE `version` SET `version`=0", [])
            .unwrap();
        drop(db);
        let err = Database::open_channel(&path).unwrap_err();
        assert!(matches!(err, DbError::NoUpgrader { .. }), "{:?}", err);
    }

    #[test]
    fn foreign_keys_enforced() {
        let db = Database::memory_channel().unwrap();
        let err = db
            .conn()
            .execute(
                "INSERT INTO `mailbox_sides` (`mailbox_id`, `opened`, `side`, `added`)
                 VALUES ('nonexistent', 1, 's1', 0)",
                [],
            )
            .unwrap_err();
        assert!(err.to_string().contains("FOREIGN KEY"), "{}", err);
    }
}
