//! `TxCoordinator` — the `begin`/`commit`/`rollback` envelope of spec §4.2.
//!
//! A transaction is a scoped acquisition of the mount mutex together with a
//! `BEGIN` on the store; release is guaranteed on every exit path and
//! paired with either `COMMIT` or `ROLLBACK`. Transactions are not nested —
//! callers must not invoke an operation already under a transaction.
//!
//! Grounded in the teacher's `unchecked_transaction()` + `tx.commit()`
//! pattern (`bux-oci/src/store.rs`), adapted into an RAII guard so the
//! mount mutex — which must span the host-FS call sandwiched between
//! `begin` and `commit`/`rollback` (spec §4.2 point 4) — is released on
//! every path including an early `?` return or a panic unwind.

use std::sync::MutexGuard;

use crate::error::Result;
use crate::stat::IshStat;
use crate::store::{Ino, MetaStore};

/// An open transaction: a held mount mutex plus an active `BEGIN`.
///
/// Every exported operation executes exactly one balanced
/// `begin`…`commit`/`rollback` envelope (spec §5). Dropping a `Tx` without
/// calling [`commit`](Self::commit) or [`rollback`](Self::rollback) rolls
/// back as a safety net (e.g. on an early-return panic) — this is belt and
/// suspenders, not the primary contract: callers are expected to always
/// explicitly finish the transaction.
pub struct Tx<'a> {
    guard: MutexGuard<'a, MetaStore>,
    finished: bool,
}

impl<'a> Tx<'a> {
    /// Acquires the mount mutex and starts a store transaction
    /// (`BEGIN IMMEDIATE`, to fail fast on write contention rather than
    /// upgrading a deferred read transaction mid-flight).
    pub(crate) fn begin(guard: MutexGuard<'a, MetaStore>) -> Result<Self> {
        guard.conn().execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            guard,
            finished: false,
        })
    }

    /// Finishes the transaction with `COMMIT`, then releases the mutex.
    pub fn commit(mut self) -> Result<()> {
        self.guard.conn().execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    /// Aborts the transaction with `ROLLBACK`, then releases the mutex.
    pub fn rollback(mut self) -> Result<()> {
        self.guard.conn().execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }

    /// `path_get_inode(path) → inode | 0`.
    pub fn path_get_inode(&self, path: &[u8]) -> Result<Ino> {
        self.guard.path_get_inode(path)
    }

    /// `path_read_stat(path) → (inode, ishstat) | absent`.
    pub fn path_read_stat(&self, path: &[u8]) -> Result<Option<(Ino, IshStat)>> {
        self.guard.path_read_stat(path)
    }

    /// `inode_read_stat(inode) → ishstat`. Returns `None` only on invariant
    /// violation — callers must treat that as fatal (spec §7).
    pub fn inode_read_stat(&self, inode: Ino) -> Result<Option<IshStat>> {
        self.guard.inode_read_stat(inode)
    }

    /// `inode_write_stat(inode, ishstat)`.
    pub fn inode_write_stat(&self, inode: Ino, stat: IshStat) -> Result<()> {
        self.guard.inode_write_stat(inode, stat)
    }

    /// `path_create(path, ishstat)`, returning the new inode.
    pub fn path_create(&self, path: &[u8], stat: IshStat) -> Result<Ino> {
        self.guard.path_create(path, stat)
    }

    /// `path_link(src, dst)`. `None` means `src` has no shadow row.
    pub fn path_link(&self, src: &[u8], dst: &[u8]) -> Result<Option<Ino>> {
        self.guard.path_link(src, dst)
    }

    /// `path_unlink(path)`.
    pub fn path_unlink(&self, path: &[u8]) -> Result<()> {
        self.guard.path_unlink(path)
    }

    /// `path_rename(src, dst)`.
    pub fn path_rename(&self, src: &[u8], dst: &[u8]) -> Result<()> {
        self.guard.path_rename(src, dst)
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.guard.conn().execute_batch("ROLLBACK");
        }
    }
}
