//! Storage backends that hold replica databases.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;

use super::error::DbResult;

/// Where replica databases live.
///
/// Names passed in are already derived by [`super::DatabaseNaming`].
pub trait StorageBackend: Send + Sync {
    /// Open (creating if needed) the database with this name.
    fn open(&self, name: &str) -> DbResult<Connection>;

    /// Names of every stored database.
    fn list(&self) -> DbResult<Vec<String>>;

    /// Remove a stored database. Removing a missing database succeeds.
    fn delete(&self, name: &str) -> DbResult<()>;
}

/// One SQLite file per database inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the main database file for a name.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.db"))
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl StorageBackend for FileStorage {
    fn open(&self, name: &str) -> DbResult<Connection> {
        fs::create_dir_all(&self.dir)?;
        let conn = Connection::open(self.path_for(name))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn list(&self) -> DbResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".db")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> DbResult<()> {
        let main = self.path_for(name);
        remove_if_exists(&main)?;
        for suffix in ["-wal", "-shm", "-journal"] {
            remove_if_exists(&self.dir.join(format!("{name}.db{suffix}")))?;
        }
        Ok(())
    }
}

/// In-memory databases; only the set of names is tracked.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    names: Mutex<BTreeSet<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn names(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageBackend for MemoryStorage {
    fn open(&self, name: &str) -> DbResult<Connection> {
        let conn = Connection::open_in_memory()?;
        self.names().insert(name.to_string());
        Ok(conn)
    }

    fn list(&self) -> DbResult<Vec<String>> {
        Ok(self.names().iter().cloned().collect())
    }

    fn delete(&self, name: &str) -> DbResult<()> {
        self.names().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("replicas"));

        assert!(storage.list().unwrap().is_empty());

        let conn = storage.open("shapesync-u1-v1").unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        drop(conn);

        assert_eq!(storage.list().unwrap(), vec!["shapesync-u1-v1".to_string()]);
        assert!(storage.path_for("shapesync-u1-v1").exists());

        storage.delete("shapesync-u1-v1").unwrap();
        assert!(storage.list().unwrap().is_empty());

        // Deleting twice is fine.
        storage.delete("shapesync-u1-v1").unwrap();
    }

    #[test]
    fn test_file_storage_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("a.db-wal"), "x").unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.list().unwrap().is_empty());
    }

    #[test]
    fn test_memory_storage_tracks_names() {
        let storage = MemoryStorage::new();
        let _a = storage.open("a").unwrap();
        let _b = storage.open("b").unwrap();
        assert_eq!(storage.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
        storage.delete("a").unwrap();
        assert_eq!(storage.list().unwrap(), vec!["b".to_string()]);
    }
}
