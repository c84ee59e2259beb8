//! Table-backed catalog on SQLite: one row per directory, one row per entry.
//! Works on every platform and supports fine-grained child operations.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::codec::{self, OverlayDir, OverlayEntry};
use crate::dir::PathComponent;
use crate::error::{check_invariant, OverlayError, Result};
use crate::inode::{InodeNumber, ROOT_INODE};
use crate::model::ObjectId;

use super::InodeCatalog;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Database file name inside the overlay's local directory.
const DB_FILE: &str = "store.db";

const NEXT_INODE_KEY: &str = "next_inode_number";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dirs (
    ino INTEGER PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS entries (
    parent INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    name TEXT NOT NULL,
    mode INTEGER NOT NULL,
    ino INTEGER NOT NULL,
    id BLOB,
    PRIMARY KEY (parent, name)
);
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pub struct SqliteInodeCatalog {
    /// `None` selects a transient in-memory database.
    db_path: Option<PathBuf>,
    synchronous_off: bool,
    conn: Mutex<Option<Connection>>,
}

impl SqliteInodeCatalog {
    pub fn new(local_dir: &Path, synchronous_off: bool) -> Self {
        SqliteInodeCatalog {
            db_path: Some(local_dir.join(DB_FILE)),
            synchronous_off,
            conn: Mutex::new(None),
        }
    }

    pub fn in_memory() -> Self {
        SqliteInodeCatalog {
            db_path: None,
            synchronous_off: false,
            conn: Mutex::new(None),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap();
        let conn = guard.as_mut().ok_or_else(|| {
            OverlayError::InvariantViolation("sqlite catalog used before initialize".into())
        })?;
        f(conn)
    }

    fn load_rows(conn: &Connection, parent: InodeNumber) -> Result<Option<OverlayDir>> {
        let present: Option<i64> = conn
            .query_row(
                "SELECT ino FROM dirs WHERE ino = ?1",
                params![parent.get() as i64],
                |row| row.get(0),
            )
            .optional()?;
        if present.is_none() {
            return Ok(None);
        }

        let mut stmt = conn.prepare(
            "SELECT name, mode, ino, id FROM entries WHERE parent = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![parent.get() as i64], |row| {
            let name: String = row.get(0)?;
            let mode: i64 = row.get(1)?;
            let ino: i64 = row.get(2)?;
            let id: Option<Vec<u8>> = row.get(3)?;
            Ok((name, mode, ino, id))
        })?;

        let mut dir = OverlayDir::new();
        for row in rows {
            let (name, mode, ino, id) = row?;
            let name = PathComponent::new(name.as_str()).map_err(|_| {
                OverlayError::corrupt(parent, format!("invalid entry name {:?}", name))
            })?;
            let ino = InodeNumber::from_raw(ino as u64)
                .ok_or_else(|| OverlayError::corrupt(parent, "entry has inode number 0"))?;
            let id = id.filter(|bytes| !bytes.is_empty()).map(ObjectId::from_bytes);
            dir.entries.push((
                name,
                OverlayEntry {
                    mode: mode as u32,
                    inode: ino,
                    id,
                },
            ));
        }
        Ok(Some(dir))
    }

    fn delete_rows(conn: &Connection, parent: InodeNumber) -> Result<()> {
        conn.execute(
            "DELETE FROM entries WHERE parent = ?1",
            params![parent.get() as i64],
        )?;
        conn.execute(
            "DELETE FROM dirs WHERE ino = ?1",
            params![parent.get() as i64],
        )?;
        Ok(())
    }

    fn insert_rows(conn: &Connection, parent: InodeNumber, dir: &OverlayDir) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO dirs (ino) VALUES (?1)",
            params![parent.get() as i64],
        )?;
        conn.execute(
            "DELETE FROM entries WHERE parent = ?1",
            params![parent.get() as i64],
        )?;
        let mut stmt = conn.prepare(
            "INSERT INTO entries (parent, seq, name, mode, ino, id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for (seq, (name, entry)) in dir.entries.iter().enumerate() {
            stmt.execute(params![
                parent.get() as i64,
                seq as i64,
                name.as_str(),
                entry.mode as i64,
                entry.inode.get() as i64,
                entry.id.as_ref().map(|id| id.as_bytes()),
            ])?;
        }
        Ok(())
    }

    fn next_seq(conn: &Connection, parent: InodeNumber) -> Result<i64> {
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM entries WHERE parent = ?1",
            params![parent.get() as i64],
            |row| row.get(0),
        )?;
        Ok(seq)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl InodeCatalog for SqliteInodeCatalog {
    fn initialize(&self, create_if_missing: bool) -> Result<Option<InodeNumber>> {
        let mut guard = self.conn.lock().unwrap();
        check_invariant!(guard.is_none(), "sqlite catalog initialized twice");

        let (conn, fresh) = match &self.db_path {
            Some(path) => {
                let existed = path.exists();
                if !existed && !create_if_missing {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("overlay database not found at {}", path.display()),
                    )
                    .into());
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                let synchronous = if self.synchronous_off {
                    debug!("sqlite catalog running with synchronous = OFF");
                    "OFF"
                } else {
                    "NORMAL"
                };
                conn.pragma_update(None, "synchronous", synchronous)?;
                (conn, !existed)
            }
            None => (Connection::open_in_memory()?, true),
        };

        conn.execute_batch(SCHEMA)?;

        let stored: Option<i64> = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![NEXT_INODE_KEY],
                |row| row.get(0),
            )
            .optional()?;

        let next = match stored {
            Some(value) => {
                // Consumed on open, like the filesystem backend's marker
                // file: it only exists again after a clean shutdown.
                conn.execute(
                    "DELETE FROM config WHERE key = ?1",
                    params![NEXT_INODE_KEY],
                )?;
                InodeNumber::from_raw(value as u64)
            }
            None if fresh => Some(InodeNumber::new(ROOT_INODE.get() + 1)),
            None => None,
        };

        *guard = Some(conn);
        Ok(next)
    }

    fn initialized(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }

    fn close(&self, next_inode: Option<InodeNumber>) {
        let mut guard = self.conn.lock().unwrap();
        if let Some(conn) = guard.take() {
            if let Some(next) = next_inode {
                let result = conn.execute(
                    "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
                    params![NEXT_INODE_KEY, next.get() as i64],
                );
                if let Err(err) = result {
                    warn!("failed to record next inode number on close: {}", err);
                }
            }
        }
    }

    fn supports_semantic_operations(&self) -> bool {
        true
    }

    fn load_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        self.with_conn(|conn| Self::load_rows(conn, ino))
    }

    fn load_directory_raw(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>> {
        Ok(self.load_directory(ino)?.map(|dir| codec::encode_dir(&dir)))
    }

    fn save_directory(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            Self::insert_rows(&tx, ino, dir)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn has_directory(&self, ino: InodeNumber) -> Result<bool> {
        self.with_conn(|conn| {
            let present: Option<i64> = conn
                .query_row(
                    "SELECT ino FROM dirs WHERE ino = ?1",
                    params![ino.get() as i64],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(present.is_some())
        })
    }

    fn remove_directory(&self, ino: InodeNumber) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            Self::delete_rows(&tx, ino)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn load_and_remove_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let dir = Self::load_rows(&tx, ino)?;
            if dir.is_some() {
                Self::delete_rows(&tx, ino)?;
            }
            tx.commit()?;
            Ok(dir)
        })
    }

    fn list_directories(&self) -> Result<Vec<InodeNumber>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT ino FROM dirs")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut result = Vec::new();
            for row in rows {
                if let Some(ino) = InodeNumber::from_raw(row? as u64) {
                    result.push(ino);
                }
            }
            Ok(result)
        })
    }

    fn add_child(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
        entry: OverlayEntry,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO dirs (ino) VALUES (?1)",
                params![parent.get() as i64],
            )?;
            let seq = Self::next_seq(&tx, parent)?;
            tx.execute(
                "INSERT OR REPLACE INTO entries (parent, seq, name, mode, ino, id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    parent.get() as i64,
                    seq,
                    name.as_str(),
                    entry.mode as i64,
                    entry.inode.get() as i64,
                    entry.id.as_ref().map(|id| id.as_bytes()),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn remove_child(&self, parent: InodeNumber, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM entries WHERE parent = ?1 AND name = ?2",
                params![parent.get() as i64, name],
            )?;
            Ok(removed > 0)
        })
    }

    fn rename_child(
        &self,
        src: InodeNumber,
        dst: InodeNumber,
        src_name: &str,
        dst_name: &PathComponent,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let row: Option<(i64, i64, Option<Vec<u8>>)> = tx
                .query_row(
                    "SELECT mode, ino, id FROM entries WHERE parent = ?1 AND name = ?2",
                    params![src.get() as i64, src_name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let (mode, ino, id) = row.ok_or(OverlayError::NotFound(src))?;
            tx.execute(
                "DELETE FROM entries WHERE parent = ?1 AND name = ?2",
                params![src.get() as i64, src_name],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO dirs (ino) VALUES (?1)",
                params![dst.get() as i64],
            )?;
            let seq = Self::next_seq(&tx, dst)?;
            tx.execute(
                "INSERT OR REPLACE INTO entries (parent, seq, name, mode, ino, id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![dst.get() as i64, seq, dst_name.as_str(), mode, ino, id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn maintenance(&self) -> Result<()> {
        if self.db_path.is_none() {
            return Ok(());
        }
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
