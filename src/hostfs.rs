//! `HostFs` — the stand-in for the out-of-scope realfs pass-through layer.
//!
//! `spec.md` treats the host-filesystem collaborator as an external
//! component with an identical-signature operation for each fakefs
//! primitive. This module defines the narrow slice of that contract
//! `OpSemantics` actually calls (see `SPEC_FULL.md` §B) plus `LocalHostFs`,
//! a `std::fs`-backed implementation rooted at a mount directory.
//!
//! Grounded on `bux/src/disk.rs`'s root-relative path conventions
//! (join-under-root, `fs::rename` for atomic placement) and on the pack's
//! use of `nix::sys::stat::mknod` for device/FIFO/socket node creation,
//! which `std::fs` has no equivalent for.

use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use libc::mode_t;
use nix::sys::stat::{mknod, Mode, SFlag};

use crate::stat::{is_blk, is_chr, is_reg, S_IFMT};

/// One host directory entry discovered while walking the mount root for
/// rebuild (spec §4.4 step 6).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HostEntry {
    /// Path relative to the mount root, as raw bytes.
    pub path: Vec<u8>,
    /// Whether the host object is a directory.
    pub is_dir: bool,
    /// Host permission bits (`st_mode & 0o7777`).
    pub perm: u32,
}

/// The host-FS pass-through operations `OpSemantics` composes with
/// `MetaStore` updates. Every method operates on a path relative to the
/// mount root, as raw bytes (spec invariant 5: paths are byte blobs).
pub trait HostFs {
    /// Opens `path` for read/write, creating it with permissive bits
    /// (`0666`) if `create` is set and it doesn't exist (spec §4.3.2: the
    /// real file is always opened world-read-write; guest permissions live
    /// entirely in the shadow).
    fn open(&self, path: &[u8], create: bool) -> io::Result<File>;

    /// `link(2)` equivalent.
    fn link(&self, src: &[u8], dst: &[u8]) -> io::Result<()>;

    /// `unlink(2)` equivalent.
    fn unlink(&self, path: &[u8]) -> io::Result<()>;

    /// `rmdir(2)` equivalent.
    fn rmdir(&self, path: &[u8]) -> io::Result<()>;

    /// `rename(2)` equivalent.
    fn rename(&self, src: &[u8], dst: &[u8]) -> io::Result<()>;

    /// `mkdir(2)` equivalent, permissive bits (`0777`).
    fn mkdir(&self, path: &[u8]) -> io::Result<()>;

    /// Creates a host object for `mknod`. When `force_regular` is set (the
    /// guest type is a block or character device, which the host may
    /// refuse to store), creates an empty regular file instead of a true
    /// device node.
    fn mknod(&self, path: &[u8], guest_mode: u32, force_regular: bool) -> io::Result<()>;

    /// Writes `data` to a newly created regular file at `path` (used by
    /// `symlink` to store the link target as file contents, since the host
    /// may mangle broken symlinks).
    fn write_new_file(&self, path: &[u8], data: &[u8]) -> io::Result<()>;

    /// Reads a host regular file's entire contents (the `readlink`
    /// fallback of spec §4.3's table).
    fn read_file(&self, path: &[u8]) -> io::Result<Vec<u8>>;

    /// Host `readlink(2)`. Per spec, the caller falls back to
    /// [`read_file`](Self::read_file) when this returns `ErrorKind::InvalidInput`
    /// (`EINVAL`, "not a symbolic link").
    fn readlink(&self, path: &[u8]) -> io::Result<Vec<u8>>;

    /// Truncates a file by path to `size` bytes (setattr's size case,
    /// delegated entirely to the host per spec §4.3.1).
    fn truncate(&self, path: &[u8], size: u64) -> io::Result<()>;

    /// Truncates an already-open file to `size` bytes.
    fn ftruncate(&self, file: &File, size: u64) -> io::Result<()>;

    /// `true` if a host object exists at `path`.
    fn exists(&self, path: &[u8]) -> bool;

    /// Walks every host object under the mount root, for rebuild.
    fn walk(&self) -> io::Result<Vec<HostEntry>>;

    /// `lstat(2)`-equivalent existence/permission check, used by `stat`'s
    /// host-FS step to surface genuine host errors (`EACCES`, a dangling
    /// parent directory) rather than relying solely on the shadow lookup.
    fn stat(&self, path: &[u8]) -> io::Result<()>;

    /// Advisory whole-file lock on an already-open file (`flock(2)`).
    fn flock(&self, file: &File, exclusive: bool) -> io::Result<()>;

    /// Filesystem-level space usage for the mount root (`statvfs(2)`).
    fn statfs(&self) -> io::Result<HostStatfs>;

    /// Recovers the mount-relative path an open file was opened with, via
    /// `/proc/self/fd`.
    fn getpath(&self, file: &File) -> io::Result<Vec<u8>>;

    /// Updates access/modification times (`utimensat(2)`-equivalent, via
    /// `std::fs::FileTimes`). `None` leaves that timestamp untouched.
    fn utime(&self, path: &[u8], atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()>;
}

/// The subset of `statvfs(2)` fields a guest `statfs` call needs.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct HostStatfs {
    /// Filesystem block size, in bytes.
    pub block_size: u64,
    /// Total blocks.
    pub blocks_total: u64,
    /// Blocks free for unprivileged use.
    pub blocks_free: u64,
}

/// A `std::fs`-backed [`HostFs`] rooted at a directory on the real
/// filesystem.
#[derive(Debug, Clone)]
pub struct LocalHostFs {
    root: PathBuf,
}

impl LocalHostFs {
    /// Roots a new `LocalHostFs` at `root`, which must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves a mount-relative byte path to a real filesystem path.
    fn resolve(&self, path: &[u8]) -> PathBuf {
        let rel = std::ffi::OsStr::from_bytes(path);
        let rel = Path::new(rel);
        // Every fakefs path is guest-absolute (`/foo/bar`); join as relative
        // to avoid replacing the root outright.
        let rel = rel.strip_prefix("/").unwrap_or(rel);
        self.root.join(rel)
    }
}

impl HostFs for LocalHostFs {
    fn open(&self, path: &[u8], create: bool) -> io::Result<File> {
        let full = self.resolve(path);
        let mut opts = fs::OpenOptions::new();
        opts.read(true).write(true);
        if create {
            opts.create(true);
        }
        let file = opts.open(&full)?;
        if create {
            file.set_permissions(fs::Permissions::from_mode(0o666))?;
        }
        Ok(file)
    }

    fn link(&self, src: &[u8], dst: &[u8]) -> io::Result<()> {
        fs::hard_link(self.resolve(src), self.resolve(dst))
    }

    fn unlink(&self, path: &[u8]) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn rmdir(&self, path: &[u8]) -> io::Result<()> {
        fs::remove_dir(self.resolve(path))
    }

    fn rename(&self, src: &[u8], dst: &[u8]) -> io::Result<()> {
        fs::rename(self.resolve(src), self.resolve(dst))
    }

    fn mkdir(&self, path: &[u8]) -> io::Result<()> {
        let full = self.resolve(path);
        fs::create_dir(&full)?;
        fs::set_permissions(&full, fs::Permissions::from_mode(0o777))
    }

    fn mknod(&self, path: &[u8], guest_mode: u32, force_regular: bool) -> io::Result<()> {
        let full = self.resolve(path);
        if force_regular {
            File::create(&full)?;
            return Ok(());
        }
        let kind = match guest_mode & S_IFMT {
            m if is_blk(m) => SFlag::S_IFBLK,
            m if is_chr(m) => SFlag::S_IFCHR,
            m if is_reg(m) => {
                File::create(&full)?;
                return Ok(());
            }
            _ => SFlag::S_IFIFO,
        };
        let perm = Mode::from_bits_truncate((guest_mode & !S_IFMT) as mode_t);
        mknod(&full, kind, perm, 0).map_err(|e| io::Error::from_raw_os_error(e as i32))
    }

    fn write_new_file(&self, path: &[u8], data: &[u8]) -> io::Result<()> {
        let full = self.resolve(path);
        let mut file = File::create(&full)?;
        file.set_permissions(fs::Permissions::from_mode(0o666))?;
        std::io::Write::write_all(&mut file, data)
    }

    fn read_file(&self, path: &[u8]) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn readlink(&self, path: &[u8]) -> io::Result<Vec<u8>> {
        let target = fs::read_link(self.resolve(path))?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    fn truncate(&self, path: &[u8], size: u64) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(self.resolve(path))?;
        file.set_len(size)
    }

    fn ftruncate(&self, file: &File, size: u64) -> io::Result<()> {
        file.set_len(size)
    }

    fn exists(&self, path: &[u8]) -> bool {
        self.resolve(path).exists()
    }

    fn walk(&self) -> io::Result<Vec<HostEntry>> {
        let mut out = Vec::new();
        walk_dir(&self.root, &self.root, &mut out)?;
        Ok(out)
    }

    fn stat(&self, path: &[u8]) -> io::Result<()> {
        fs::symlink_metadata(self.resolve(path)).map(|_| ())
    }

    fn flock(&self, file: &File, exclusive: bool) -> io::Result<()> {
        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        // SAFETY: `file` is a valid open fd for the lifetime of this call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn statfs(&self) -> io::Result<HostStatfs> {
        let c_path = std::ffi::CString::new(self.root.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `buf` is fully initialized by a successful `statvfs` call
        // before any field is read; `c_path` is a valid NUL-terminated string.
        let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(HostStatfs {
            block_size: buf.f_frsize as u64,
            blocks_total: buf.f_blocks as u64,
            blocks_free: buf.f_bavail as u64,
        })
    }

    fn getpath(&self, file: &File) -> io::Result<Vec<u8>> {
        let proc_link = format!("/proc/self/fd/{}", file.as_raw_fd());
        let full = fs::read_link(proc_link)?;
        let rel = full.strip_prefix(&self.root).unwrap_or(&full);
        let mut out = vec![b'/'];
        out.extend_from_slice(rel.as_os_str().as_bytes());
        Ok(out)
    }

    fn utime(&self, path: &[u8], atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(self.resolve(path))?;
        let mut times = fs::FileTimes::new();
        if let Some(a) = atime {
            times = times.set_accessed(a);
        }
        if let Some(m) = mtime {
            times = times.set_modified(m);
        }
        file.set_times(times)
    }
}

/// Recursively walks `dir`, recording paths relative to `root`.
fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<HostEntry>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        let rel = path.strip_prefix(root).unwrap_or(&path);
        let mut rel_bytes = vec![b'/'];
        rel_bytes.extend_from_slice(rel.as_os_str().as_bytes());
        out.push(HostEntry {
            path: rel_bytes,
            is_dir: meta.is_dir(),
            perm: meta.permissions().mode() & 0o7777,
        });
        if meta.is_dir() {
            walk_dir(root, &path, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let hfs = LocalHostFs::new(dir.path());
        hfs.write_new_file(b"/link_target", b"/target").unwrap();
        assert_eq!(hfs.read_file(b"/link_target").unwrap(), b"/target");
        assert!(hfs.exists(b"/link_target"));
    }

    #[test]
    fn mkdir_then_walk_finds_it() {
        let dir = tempfile::tempdir().unwrap();
        let hfs = LocalHostFs::new(dir.path());
        hfs.mkdir(b"/sub").unwrap();
        let entries = hfs.walk().unwrap();
        assert!(entries.iter().any(|e| e.path == b"/sub" && e.is_dir));
    }

    #[test]
    fn readlink_on_regular_file_is_einval() {
        let dir = tempfile::tempdir().unwrap();
        let hfs = LocalHostFs::new(dir.path());
        hfs.write_new_file(b"/plain", b"data").unwrap();
        let err = hfs.readlink(b"/plain").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn stat_reports_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let hfs = LocalHostFs::new(dir.path());
        assert!(hfs.stat(b"/nope").is_err());
        hfs.write_new_file(b"/present", b"x").unwrap();
        assert!(hfs.stat(b"/present").is_ok());
    }

    #[test]
    fn getpath_recovers_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let hfs = LocalHostFs::new(dir.path());
        hfs.mkdir(b"/a").unwrap();
        let file = hfs.open(b"/a/file", true).unwrap();
        assert_eq!(hfs.getpath(&file).unwrap(), b"/a/file");
    }

    #[test]
    fn statfs_reports_nonzero_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let hfs = LocalHostFs::new(dir.path());
        let stats = hfs.statfs().unwrap();
        assert!(stats.blocks_total > 0);
    }
}
