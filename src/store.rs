//! `MetaStore` — the prepared-statement-driven wrapper over the embedded
//! SQL database (spec §4.1).
//!
//! Schema (spec §6):
//! ```text
//! stats(inode INTEGER PRIMARY KEY AUTOINCREMENT, stat BLOB NOT NULL)
//! paths(path BLOB PRIMARY KEY, inode INTEGER NOT NULL REFERENCES stats)
//! meta(db_inode INTEGER)   -- single row
//! ```
//!
//! Every operation here assumes it runs inside an active transaction
//! (spec §4.2); `MetaStore` itself holds no mutex — that's [`crate::mount::Mount`]'s
//! job, since the mutex must also span the host-FS call sandwiched between
//! `begin` and `commit`/`rollback`.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::stat::IshStat;

/// Schema DDL, applied idempotently by [`MetaStore::migrate`].
const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS stats (
        inode INTEGER PRIMARY KEY AUTOINCREMENT,
        stat  BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS paths (
        path  BLOB PRIMARY KEY,
        inode INTEGER NOT NULL REFERENCES stats(inode)
    );
    CREATE TABLE IF NOT EXISTS meta (
        db_inode INTEGER
    );
";

/// Extension trait converting `rusqlite::Result` into `crate::Result`.
trait DbResultExt<T> {
    fn db(self) -> Result<T>;
}

impl<T> DbResultExt<T> for rusqlite::Result<T> {
    fn db(self) -> Result<T> {
        self.map_err(Error::Db)
    }
}

/// A fake inode — a 64-bit identifier assigned by the shadow store,
/// unrelated to any host inode number.
pub type Ino = u64;

/// Thin wrapper over a `rusqlite::Connection`, exposing spec §4.1's typed
/// operations. Owned by exactly one [`crate::mount::Mount`], guarded by that
/// mount's mutex.
pub struct MetaStore {
    conn: Connection,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").field("conn", &"<sqlite>").finish()
    }
}

impl MetaStore {
    /// Opens (or creates) the database at `path` and applies WAL journaling.
    ///
    /// Does not run [`migrate`](Self::migrate) — callers decide when
    /// (spec §4.4 separates "open" from "migrate" into distinct steps so
    /// the magic-byte check in between can observe a pre-migration file).
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).db()?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .db()?;
        Ok(Self { conn })
    }

    /// Runs the schema migration. Idempotent — safe to call on every mount.
    pub fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA).db()
    }

    /// Warms the statement cache for every SQL text this module issues, so
    /// the first real transaction doesn't pay compilation cost (spec §4.4
    /// step 9, "prepare and cache all per-mount statements").
    pub fn warm_statement_cache(&self) -> Result<()> {
        for sql in ALL_STATEMENTS {
            self.conn.prepare_cached(sql).db()?;
        }
        Ok(())
    }

    /// Direct access to the underlying connection, for operations (like
    /// `BEGIN`/`COMMIT`/`ROLLBACK`) that [`crate::tx::Tx`] issues itself.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// `path_get_inode(path) → inode | 0`. Returns `0` when absent.
    pub fn path_get_inode(&self, path: &[u8]) -> Result<Ino> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT inode FROM paths WHERE path = ?1")
            .db()?;
        let ino: Option<i64> = stmt.query_row(params![path], |r| r.get(0)).optional().db()?;
        Ok(ino.map_or(0, |v| v as Ino))
    }

    /// `path_read_stat(path) → (inode, ishstat) | absent`.
    pub fn path_read_stat(&self, path: &[u8]) -> Result<Option<(Ino, IshStat)>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT paths.inode, stats.stat FROM paths \
                 JOIN stats ON stats.inode = paths.inode \
                 WHERE paths.path = ?1",
            )
            .db()?;
        let row: Option<(i64, Vec<u8>)> = stmt
            .query_row(params![path], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()
            .db()?;
        match row {
            None => Ok(None),
            Some((ino, blob)) => Ok(Some((ino as Ino, IshStat::from_blob(&blob)?))),
        }
    }

    /// `inode_read_stat(inode) → ishstat`.
    ///
    /// Invariant 1 (every `paths.inode` names an existing `stats` row) means
    /// a caller holding an `inode` reachable by path should never see this
    /// return `None`; `None` here is an invariant violation the caller
    /// (spec §7: "missing inode row") must treat as fatal.
    pub fn inode_read_stat(&self, inode: Ino) -> Result<Option<IshStat>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT stat FROM stats WHERE inode = ?1")
            .db()?;
        let blob: Option<Vec<u8>> = stmt
            .query_row(params![inode as i64], |r| r.get(0))
            .optional()
            .db()?;
        blob.map(|b| IshStat::from_blob(&b)).transpose()
    }

    /// `inode_write_stat(inode, ishstat)`.
    pub fn inode_write_stat(&self, inode: Ino, stat: IshStat) -> Result<()> {
        self.conn
            .prepare_cached("UPDATE stats SET stat = ?2 WHERE inode = ?1")
            .db()?
            .execute(params![inode as i64, stat.to_blob().to_vec()])
            .db()?;
        Ok(())
    }

    /// `path_create(path, ishstat)`: inserts a `stats` row, then a `paths`
    /// row bound to the just-inserted row id. Returns the new inode.
    pub fn path_create(&self, path: &[u8], stat: IshStat) -> Result<Ino> {
        self.conn
            .prepare_cached("INSERT INTO stats (stat) VALUES (?1)")
            .db()?
            .execute(params![stat.to_blob().to_vec()])
            .db()?;
        let inode = self.conn.last_insert_rowid() as Ino;
        self.conn
            .prepare_cached("INSERT INTO paths (path, inode) VALUES (?1, ?2)")
            .db()?
            .execute(params![path, inode as i64])
            .db()?;
        Ok(inode)
    }

    /// `path_link(src, dst)`: reads `src`'s inode; inserts `(dst, inode)`.
    ///
    /// Returns `Ok(None)` if `src` has no shadow row — callers must prevent
    /// this (spec: "fails fatally when src inode does not exist").
    pub fn path_link(&self, src: &[u8], dst: &[u8]) -> Result<Option<Ino>> {
        let inode = self.path_get_inode(src)?;
        if inode == 0 {
            return Ok(None);
        }
        self.conn
            .prepare_cached("INSERT INTO paths (path, inode) VALUES (?1, ?2)")
            .db()?
            .execute(params![dst, inode as i64])
            .db()?;
        Ok(Some(inode))
    }

    /// `path_unlink(path)`: deletes the `paths` row. Never deletes the
    /// stat row — it becomes orphaned if now unreferenced, swept at the
    /// next mount.
    pub fn path_unlink(&self, path: &[u8]) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM paths WHERE path = ?1")
            .db()?
            .execute(params![path])
            .db()?;
        Ok(())
    }

    /// `path_rename(src, dst)`: replace semantics. Any existing `paths` row
    /// at `dst` is displaced first (its inode, if now unreferenced, becomes
    /// orphaned); the `src` row's path column is then updated to `dst`.
    pub fn path_rename(&self, src: &[u8], dst: &[u8]) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM paths WHERE path = ?1")
            .db()?
            .execute(params![dst])
            .db()?;
        self.conn
            .prepare_cached("UPDATE paths SET path = ?2 WHERE path = ?1")
            .db()?
            .execute(params![src, dst])
            .db()?;
        Ok(())
    }

    /// Reads `meta.db_inode`, the host inode of the database file as of the
    /// most recent successful mount. `None` if never set (fresh database).
    pub fn meta_get_db_inode(&self) -> Result<Option<u64>> {
        let v: Option<i64> = self
            .conn
            .query_row("SELECT db_inode FROM meta LIMIT 1", [], |r| r.get(0))
            .optional()
            .db()?;
        Ok(v.map(|v| v as u64))
    }

    /// Writes the host inode of the database file into the `meta` singleton,
    /// replacing any prior row.
    pub fn meta_set_db_inode(&self, inode: u64) -> Result<()> {
        self.conn.execute("DELETE FROM meta", []).db()?;
        self.conn
            .execute("INSERT INTO meta (db_inode) VALUES (?1)", params![inode as i64])
            .db()?;
        Ok(())
    }

    /// Deletes every `stats` row not referenced by any `paths` row
    /// (invariant 2, enforced once at mount time — spec §4.4 step 8).
    /// Returns the number of rows removed.
    pub fn orphan_sweep(&self) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "DELETE FROM stats WHERE inode NOT IN (SELECT inode FROM paths)",
                [],
            )
            .db()?;
        Ok(n)
    }

    /// Lists every `(path, inode)` pair currently in the shadow store.
    /// Used by the rebuild walk (spec §4.4 step 6) to reconcile against the
    /// host tree.
    pub fn all_paths(&self) -> Result<Vec<(Vec<u8>, Ino)>> {
        let mut stmt = self.conn.prepare_cached("SELECT path, inode FROM paths").db()?;
        let rows = stmt
            .query_map([], |r| {
                let path: Vec<u8> = r.get(0)?;
                let inode: i64 = r.get(1)?;
                Ok((path, inode as Ino))
            })
            .db()?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.db()?);
        }
        Ok(out)
    }
}

/// Every SQL text issued by [`MetaStore`], for cache warm-up.
const ALL_STATEMENTS: &[&str] = &[
    "SELECT inode FROM paths WHERE path = ?1",
    "SELECT paths.inode, stats.stat FROM paths JOIN stats ON stats.inode = paths.inode WHERE paths.path = ?1",
    "SELECT stat FROM stats WHERE inode = ?1",
    "UPDATE stats SET stat = ?2 WHERE inode = ?1",
    "INSERT INTO stats (stat) VALUES (?1)",
    "INSERT INTO paths (path, inode) VALUES (?1, ?2)",
    "DELETE FROM paths WHERE path = ?1",
    "UPDATE paths SET path = ?2 WHERE path = ?1",
    "SELECT path, inode FROM paths",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory() -> MetaStore {
        let store = MetaStore {
            conn: Connection::open_in_memory().unwrap(),
        };
        store.migrate().unwrap();
        store
    }

    #[test]
    fn create_then_get_inode() {
        let store = open_memory();
        let stat = IshStat::new_reg(0o644, 0, 0);
        let ino = store.path_create(b"/a", stat).unwrap();
        assert_ne!(ino, 0);
        assert_eq!(store.path_get_inode(b"/a").unwrap(), ino);
    }

    #[test]
    fn get_inode_absent_is_zero() {
        let store = open_memory();
        assert_eq!(store.path_get_inode(b"/nope").unwrap(), 0);
    }

    #[test]
    fn link_shares_inode() {
        let store = open_memory();
        let stat = IshStat::new_reg(0o644, 0, 0);
        let ino = store.path_create(b"/a", stat).unwrap();
        let linked = store.path_link(b"/a", b"/b").unwrap().unwrap();
        assert_eq!(linked, ino);
        assert_eq!(store.path_get_inode(b"/b").unwrap(), ino);
    }

    #[test]
    fn link_missing_source_returns_none() {
        let store = open_memory();
        assert!(store.path_link(b"/nope", b"/b").unwrap().is_none());
    }

    #[test]
    fn unlink_does_not_delete_stat_row() {
        let store = open_memory();
        let stat = IshStat::new_reg(0o644, 0, 0);
        let ino = store.path_create(b"/a", stat).unwrap();
        store.path_unlink(b"/a").unwrap();
        assert_eq!(store.path_get_inode(b"/a").unwrap(), 0);
        // stat row survives until orphan sweep
        assert!(store.inode_read_stat(ino).unwrap().is_some());
    }

    #[test]
    fn orphan_sweep_removes_unreferenced_stats() {
        let store = open_memory();
        let stat = IshStat::new_reg(0o644, 0, 0);
        let ino = store.path_create(b"/a", stat).unwrap();
        store.path_unlink(b"/a").unwrap();
        let swept = store.orphan_sweep().unwrap();
        assert_eq!(swept, 1);
        assert!(store.inode_read_stat(ino).unwrap().is_none());
    }

    #[test]
    fn rename_displaces_destination_and_moves_source() {
        let store = open_memory();
        let ino_a = store.path_create(b"/a", IshStat::new_reg(0o644, 0, 0)).unwrap();
        let _ino_b = store.path_create(b"/b", IshStat::new_reg(0o600, 1, 1)).unwrap();
        store.path_rename(b"/a", b"/b").unwrap();
        assert_eq!(store.path_get_inode(b"/a").unwrap(), 0);
        assert_eq!(store.path_get_inode(b"/b").unwrap(), ino_a);
    }

    #[test]
    fn db_inode_roundtrip() {
        let store = open_memory();
        assert_eq!(store.meta_get_db_inode().unwrap(), None);
        store.meta_set_db_inode(42).unwrap();
        assert_eq!(store.meta_get_db_inode().unwrap(), Some(42));
        store.meta_set_db_inode(43).unwrap();
        assert_eq!(store.meta_get_db_inode().unwrap(), Some(43));
    }
}
