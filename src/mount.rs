//! `MountLifecycle` — opening, validating, migrating, and rebuilding a
//! fakefs mount (spec §4.4).
//!
//! Grounded on `bux-oci/src/store.rs::Store::open` (directory bootstrap,
//! `Connection::open` + pragma batch, idempotent schema application) and
//! `bux/src/disk.rs::DiskManager::open` (resolve-a-path-under-a-data-dir,
//! validate-or-create shape).

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::hostfs::{HostFs, LocalHostFs};
use crate::stat::IshStat;
use crate::store::MetaStore;
use crate::tx::Tx;

/// The ASCII magic every valid SQLite database file begins with.
const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// Configuration for opening a mount (`SPEC_FULL.md` §D).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct MountConfig {
    /// The data directory; its basename must be exactly `data`.
    pub data_dir: PathBuf,
    /// If `true` and `meta.db` doesn't exist yet, bootstrap a fresh
    /// database instead of requiring the magic-byte check to pass. Open
    /// Question decision — see `DESIGN.md`.
    pub create: bool,
}

impl MountConfig {
    /// A config pointing at `data_dir`, disallowing fresh-database
    /// bootstrap (the default — spec §4.4 assumes `meta.db` pre-exists).
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            create: false,
        }
    }

    /// Allows [`Mount::open`] to bootstrap a fresh `meta.db` when absent.
    #[must_use]
    pub fn allow_create(mut self) -> Self {
        self.create = true;
        self
    }
}

/// An open fakefs mount: owns the database handle, the mutex serializing
/// every transaction, the statement cache (via `rusqlite`'s own
/// per-connection cache), and the host-FS root.
pub struct Mount {
    store: Mutex<MetaStore>,
    host: LocalHostFs,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount").field("host", &self.host).finish_non_exhaustive()
    }
}

impl Mount {
    /// Opens a mount per spec §4.4 steps 1–9.
    pub fn open(config: &MountConfig) -> Result<Self> {
        // Step 1: resolve the metadata database path.
        let db_path = resolve_db_path(&config.data_dir)?;

        let is_fresh = !db_path.exists();
        if is_fresh && !config.create {
            return Err(Error::InvalidMount(format!(
                "{} does not exist and MountConfig::create was not set",
                db_path.display()
            )));
        }

        // Step 2: verify the SQLite magic, unless we're bootstrapping.
        if !is_fresh {
            verify_sqlite_magic(&db_path)?;
        }

        // Step 3: open read-write, WAL journaling.
        let store = MetaStore::open(&db_path)?;

        // Step 4: host-FS mount — make the root descriptor available.
        std::fs::create_dir_all(&config.data_dir)?;
        let host = LocalHostFs::new(&config.data_dir);

        // Step 5: schema migration (idempotent).
        store.migrate()?;

        // Step 6: inode-shift detection + rebuild.
        let host_inode = db_path.metadata()?.ino();
        let prior_inode = store.meta_get_db_inode()?;
        if prior_inode != Some(host_inode) {
            rebuild(&store, &host)?;
        }

        // Step 7: write back the current host inode.
        store.meta_set_db_inode(host_inode)?;

        // Step 8: orphan sweep.
        store.orphan_sweep()?;

        // Step 9: warm the statement cache.
        store.warm_statement_cache()?;

        Ok(Self {
            store: Mutex::new(store),
            host,
        })
    }

    /// Begins a transaction: acquires the mount mutex, then `BEGIN`s.
    /// Every exported operation calls this exactly once (spec §4.2/§5).
    pub(crate) fn begin(&self) -> Result<Tx<'_>> {
        let guard = self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Tx::begin(guard)
    }

    /// The host-FS collaborator for this mount.
    pub(crate) fn host(&self) -> &LocalHostFs {
        &self.host
    }

    /// Unmounts: closes the database. Host-FS unmount is a no-op in this
    /// core (spec §4.4).
    pub fn close(self) {}
}

/// Step 1: the metadata database path is the data directory's parent,
/// joined with `meta.db` — but only when the data directory's basename is
/// exactly `data` (spec §4.4 step 1: "Require exactly this naming;
/// otherwise abort").
fn resolve_db_path(data_dir: &Path) -> Result<PathBuf> {
    let basename = data_dir.file_name().and_then(|n| n.to_str());
    if basename != Some("data") {
        return Err(Error::InvalidMount(format!(
            "data directory basename must be `data`, got {data_dir:?}"
        )));
    }
    let parent = data_dir.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join("meta.db"))
}

/// Step 2: the database file must begin with the ASCII SQLite magic.
fn verify_sqlite_magic(db_path: &Path) -> Result<()> {
    use std::io::Read;
    let mut f = std::fs::File::open(db_path)?;
    let mut header = [0u8; SQLITE_MAGIC.len()];
    f.read_exact(&mut header).map_err(|_| {
        Error::InvalidMount(format!("{} is too short to be a SQLite database", db_path.display()))
    })?;
    if header != *SQLITE_MAGIC {
        return Err(Error::InvalidMount(format!(
            "{} is missing the SQLite magic header",
            db_path.display()
        )));
    }
    Ok(())
}

/// Reconciles `paths`/`stats` against the host tree after detecting a
/// relocation (spec §4.4 step 6; algorithm choice recorded in
/// `DESIGN.md`'s Open Question 4).
///
/// Required postcondition: invariant 3 (every shadow path has a host
/// object, and vice versa) plus invariant 1 (every `paths.inode` names an
/// existing `stats` row).
fn rebuild(store: &MetaStore, host: &LocalHostFs) -> Result<()> {
    use std::collections::HashSet;

    let shadow_paths = store.all_paths()?;
    let shadow_set: HashSet<&[u8]> = shadow_paths.iter().map(|(p, _)| p.as_slice()).collect();

    // Drop shadow paths whose host object is gone.
    for (path, _inode) in &shadow_paths {
        if !host.exists(path) {
            store.path_unlink(path)?;
        }
    }

    // Synthesize shadow rows for host objects with no path entry. uid/gid
    // default to 0 and permission bits are taken from the host — any prior
    // ownership/exact-mode information was already lost by the time this
    // ran (the whole point of rebuild is recovering from a state where
    // shadow and host had already diverged).
    for entry in host.walk()? {
        if shadow_set.contains(entry.path.as_slice()) {
            continue;
        }
        let stat = if entry.is_dir {
            IshStat::new_dir(entry.perm, 0, 0)
        } else {
            IshStat::new_reg(entry.perm, 0, 0)
        };
        store.path_create(&entry.path, stat)?;
    }

    Ok(())
}
