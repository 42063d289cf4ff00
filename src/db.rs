use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::secrets::{SecretLifecycle, SecretMaterial, SecretVault};

pub const DB_KEY_ALIAS: &str = "sqlcipher-db-key";

const PLAINTEXT_HEADER: &[u8; 16] = b"SQLite format 3\0";
const STORE_SIDECARS: [&str; 3] = ["", "-wal", "-shm"];

/// Schema steps applied in order; `PRAGMA user_version` records how many ran.
const SCHEMA_STEPS: &[&str] = &[
    r#"
    CREATE TABLE pois (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        address TEXT,
        lat REAL NOT NULL CHECK (lat BETWEEN -90 AND 90),
        lng REAL NOT NULL CHECK (lng BETWEEN -180 AND 180),
        category TEXT NOT NULL DEFAULT 'OTHER',
        rating REAL NOT NULL DEFAULT 0 CHECK (rating BETWEEN 0 AND 5),
        is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
        created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
        updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
    );
    CREATE INDEX idx_pois_lat_lng ON pois(lat, lng);
    CREATE INDEX idx_pois_category ON pois(category);
    "#,
    r#"
    ALTER TABLE pois ADD COLUMN provider_place_id TEXT;
    ALTER TABLE pois ADD COLUMN provider_types TEXT;
    ALTER TABLE pois ADD COLUMN last_synced_at TEXT;
    ALTER TABLE pois ADD COLUMN version INTEGER NOT NULL DEFAULT 1;
    CREATE INDEX idx_pois_provider_place ON pois(provider_place_id);
    "#,
    r#"
    CREATE VIRTUAL TABLE pois_fts USING fts5(
        name, description, address,
        content = 'pois', content_rowid = 'rowid'
    );
    CREATE TRIGGER pois_fts_after_insert AFTER INSERT ON pois BEGIN
        INSERT INTO pois_fts(rowid, name, description, address)
        VALUES (new.rowid, new.name, new.description, new.address);
    END;
    CREATE TRIGGER pois_fts_after_delete AFTER DELETE ON pois BEGIN
        INSERT INTO pois_fts(pois_fts, rowid, name, description, address)
        VALUES ('delete', old.rowid, old.name, old.description, old.address);
    END;
    CREATE TRIGGER pois_fts_after_update AFTER UPDATE OF name, description, address ON pois BEGIN
        INSERT INTO pois_fts(pois_fts, rowid, name, description, address)
        VALUES ('delete', old.rowid, old.name, old.description, old.address);
        INSERT INTO pois_fts(rowid, name, description, address)
        VALUES (new.rowid, new.name, new.description, new.address);
    END;
    INSERT INTO pois_fts(pois_fts) VALUES ('rebuild');
    "#,
    r#"
    ALTER TABLE pois ADD COLUMN last_sync_attempt_at TEXT;
    CREATE INDEX idx_pois_sync_attempt ON pois(last_sync_attempt_at, created_at);
    "#,
];

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub struct DatabaseBootstrap {
    pub context: DatabaseContext,
    pub key_lifecycle: SecretLifecycle,
    pub recovered: bool,
}

/// Opens (or creates) the encrypted POI database under `data_dir`.
///
/// Only a store that the vault key cannot decrypt is removed (with its WAL
/// sidecars) and recreated; a key that was already in the vault is rotated
/// at that point. Every other failure is returned and the files are left
/// untouched.
pub fn bootstrap<P: AsRef<Path>>(
    data_dir: P,
    database_file: &str,
    vault: &SecretVault,
) -> AppResult<DatabaseBootstrap> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(database_file);
    let key = vault.ensure(DB_KEY_ALIAS)?;

    let (connection, key, recovered) = match unlock(&path, key.secret()) {
        Ok(connection) => (connection, key, false),
        Err(AppError::Database(err)) if path.exists() && is_wrong_key(&err) => {
            warn!(
                target: "database_bootstrap",
                path = %path.display(),
                lifecycle = key.lifecycle().as_str(),
                error = %err,
                "poi store not readable with current key, recreating"
            );
            discard_store(&path)?;
            let key = replacement_key(vault, key)?;
            (unlock(&path, key.secret())?, key, true)
        }
        Err(err) => return Err(err),
    };
    prepare(&connection, &path)?;

    info!(
        target: "database_bootstrap",
        path = %path.display(),
        lifecycle = key.lifecycle().as_str(),
        recovered,
        "poi store ready"
    );
    Ok(DatabaseBootstrap {
        context: DatabaseContext { connection, path },
        key_lifecycle: key.lifecycle(),
        recovered,
    })
}

fn replacement_key(vault: &SecretVault, current: SecretMaterial) -> AppResult<SecretMaterial> {
    match current.lifecycle() {
        SecretLifecycle::Retrieved => vault.rotate(DB_KEY_ALIAS),
        _ => Ok(current),
    }
}

/// Opens the file and applies the key. The first page read happens here, so a
/// wrong key surfaces as `NotADatabase` before anything is written.
fn unlock(path: &Path, passphrase: &SecretString) -> AppResult<Connection> {
    let connection = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )?;
    connection.pragma_update(None, "key", passphrase.expose_secret())?;
    connection.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(connection)
}

fn prepare(connection: &Connection, path: &Path) -> AppResult<()> {
    connection.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    apply_schema(connection)?;
    ensure_ciphertext_on_disk(path)
}

pub(crate) fn apply_schema(connection: &Connection) -> AppResult<()> {
    let applied: i64 = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let applied = usize::try_from(applied).unwrap_or(0);
    for (index, step) in SCHEMA_STEPS.iter().enumerate().skip(applied) {
        let version = index as i64 + 1;
        let tx = connection.unchecked_transaction()?;
        tx.execute_batch(step)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        debug!(target: "database_bootstrap", version, "schema step applied");
    }
    Ok(())
}

fn ensure_ciphertext_on_disk(path: &Path) -> AppResult<()> {
    let mut header = Vec::with_capacity(PLAINTEXT_HEADER.len());
    File::open(path)
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => {
                AppError::Path(format!("poi store missing at {}", path.display()))
            }
            _ => AppError::Io(err),
        })?
        .take(PLAINTEXT_HEADER.len() as u64)
        .read_to_end(&mut header)?;
    if header.as_slice() == PLAINTEXT_HEADER {
        return Err(AppError::Config(
            "poi store was written without encryption".into(),
        ));
    }
    Ok(())
}

fn is_wrong_key(err: &SqliteError) -> bool {
    matches!(
        err,
        SqliteError::SqliteFailure(failure, _) if failure.code == ErrorCode::NotADatabase
    )
}

fn discard_store(path: &Path) -> AppResult<()> {
    for suffix in STORE_SIDECARS {
        let target = with_suffix(path, suffix);
        match std::fs::remove_file(&target) {
            Ok(()) => debug!(target: "database_bootstrap", file = %target.display(), "removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}
