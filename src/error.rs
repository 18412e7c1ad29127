//! Error types for fakefs operations.

/// Alias for `Result<T, fakefs::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by fakefs operations.
///
/// These are the non-fatal error kinds of spec §7. Two conditions are
/// deliberately *not* representable here: a store error observed after a
/// host-FS mutation already committed, and a missing inode row reachable by
/// path. Both are invariant violations and abort the process via
/// [`fatal`] instead of being returned.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Shadow lookup found no row for the given path.
    #[error("no such entry: {0}")]
    NotFound(String),

    /// The shadow stat's type bits don't match what the operation expected
    /// (e.g. `readlink` on a path whose shadow `mode` isn't `S_IFLNK`).
    #[error("wrong file type: {0}")]
    WrongType(String),

    /// The mount's data directory or database file failed validation
    /// (basename isn't `data`, or `meta.db` is missing the SQLite magic).
    #[error("invalid mount: {0}")]
    InvalidMount(String),

    /// An I/O error from the host-FS collaborator or the database file
    /// itself, propagated verbatim.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A non-fatal SQLite error (e.g. during an optional migration step
    /// performed before any transaction is open).
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// Writes a diagnostic to stderr and aborts the process.
///
/// Per spec §7: a store error outside `OK`/`ROW`/`DONE` after a host-FS
/// mutation has already committed, or a missing `stats` row reachable by
/// path, means the shadow metadata has diverged from what this mount
/// promised the guest. Continuing would let the guest observe a
/// inconsistent filesystem; there is no in-band recovery, so the process
/// terminates instead. This mirrors the teacher's `bux-shim`, which treats
/// its own unrecoverable conditions the same way (stderr + process exit).
#[cold]
#[allow(clippy::print_stderr)]
pub fn fatal(context: &str) -> ! {
    eprintln!("fakefs: fatal: {context}");
    std::process::abort()
}
