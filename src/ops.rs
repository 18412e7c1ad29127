//! `OpSemantics` — spec §4.3's operation table, realized as an `impl Mount`
//! block. Each method opens exactly one transaction (via `Mount::begin`),
//! drives the host-FS collaborator, and updates the shadow metadata to
//! match — rolling back on any host-FS failure so the two sides never
//! diverge (spec §4.2 point 4, §5).
//!
//! Grounded on `bux-oci/src/store.rs`'s operation methods, each of which
//! opens one `unchecked_transaction`, performs its writes, and either
//! commits or propagates the error; and on spec §4.3's table directly for
//! the host-then-metadata ordering and error precedence within each op.

use std::fs::File;

use crate::error::{fatal, Error, Result};
use crate::hostfs::{HostFs, HostStatfs};
use crate::mount::Mount;
use crate::stat::{is_blk, is_chr, is_lnk, IshStat, S_IFMT};
use crate::store::Ino;

/// The fd-layer magic fakefs stamps on every descriptor it hands back to a
/// guest, so a caller mixing real and fake fds can tell them apart (spec
/// §6).
pub const FAKE_MAGIC: u32 = 0x6661_6b65;

/// A single-field mutation for `setattr`/`fsetattr` (spec §4.3.1: "carries
/// a kind tag and one payload field").
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum SetAttr {
    /// Change the owning user ID.
    Uid(u32),
    /// Change the owning group ID.
    Gid(u32),
    /// Change the permission bits (type bits in `mode` are preserved).
    Mode(u32),
    /// Truncate/extend to this size. Delegated entirely to the host-FS;
    /// the shadow carries no size field.
    Size(u64),
}

/// The result of a successful `open`: the live host-FS file plus the
/// shadow inode backing it, which the caller threads through to
/// `fstat`/`fsetattr`/`getpath`.
#[derive(Debug)]
#[non_exhaustive]
pub struct OpenFile {
    /// The real, host-FS-backed file descriptor.
    pub file: File,
    /// The shadow inode this descriptor is bound to.
    pub fake_inode: Ino,
}

fn not_found(path: &[u8]) -> Error {
    Error::NotFound(String::from_utf8_lossy(path).into_owned())
}

fn wrong_type(path: &[u8], want: &str) -> Error {
    Error::WrongType(format!("{} is not a {want}", String::from_utf8_lossy(path)))
}

/// Applies a non-size `SetAttr` to an in-memory stat record, preserving
/// the `S_IFMT` type bits untouched (spec §4.3.1).
fn apply_setattr(stat: &mut IshStat, attr: SetAttr) {
    match attr {
        SetAttr::Uid(uid) => stat.uid = uid,
        SetAttr::Gid(gid) => stat.gid = gid,
        SetAttr::Mode(mode) => stat.mode = (stat.mode & S_IFMT) | (mode & !S_IFMT),
        SetAttr::Size(_) => unreachable!("size is handled by the host-only branch"),
    }
}

impl Mount {
    /// `open(path, create, mode)`: host-FS open always happens first (with
    /// permissive `0666` bits); the shadow lookup/creation follows inside
    /// the same transaction. If the shadow still has no row after an
    /// attempted creation — meaning the path existed on the host but was
    /// never shadowed, or `create` wasn't set and no shadow row exists —
    /// the host fd is dropped and "no such entry" is surfaced, since the
    /// shadow is authoritative for guest-visible existence.
    pub fn open(&self, path: &[u8], create: bool, mode: u32, euid: u32, egid: u32) -> Result<OpenFile> {
        let tx = self.begin()?;
        let file = match self.host().open(path, create) {
            Ok(f) => f,
            Err(e) => {
                tx.rollback()?;
                return Err(e.into());
            }
        };

        let mut inode = tx.path_get_inode(path)?;
        if create && inode == 0 {
            let stat = IshStat::new_reg(mode, euid, egid);
            inode = tx
                .path_create(path, stat)
                .unwrap_or_else(|e| fatal(&format!("open: shadow create failed after host open succeeded: {e}")));
        }
        if inode == 0 {
            tx.rollback()?;
            drop(file);
            return Err(not_found(path));
        }

        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("open: commit failed after host mutation succeeded: {e}")));
        Ok(OpenFile { file, fake_inode: inode })
    }

    /// `link(src, dst)`: host `link(2)`, then `path_link` mirrors the new
    /// name onto `src`'s inode. A missing shadow row for `src` is an
    /// invariant violation once the host link already succeeded — the host
    /// and shadow sides would otherwise disagree about which names exist.
    pub fn link(&self, src: &[u8], dst: &[u8]) -> Result<()> {
        let tx = self.begin()?;
        if let Err(e) = self.host().link(src, dst) {
            tx.rollback()?;
            return Err(e.into());
        }
        match tx
            .path_link(src, dst)
            .unwrap_or_else(|e| fatal(&format!("link: shadow update failed after host link succeeded: {e}")))
        {
            Some(_) => {
                tx.commit()
                    .unwrap_or_else(|e| fatal(&format!("link: commit failed after host link succeeded: {e}")));
                Ok(())
            }
            None => fatal("link: host link succeeded but src has no shadow row"),
        }
    }

    /// `unlink(path)`: host `unlink(2)` then `path_unlink`.
    pub fn unlink(&self, path: &[u8]) -> Result<()> {
        let tx = self.begin()?;
        if let Err(e) = self.host().unlink(path) {
            tx.rollback()?;
            return Err(e.into());
        }
        tx.path_unlink(path)
            .unwrap_or_else(|e| fatal(&format!("unlink: shadow update failed after host unlink succeeded: {e}")));
        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("unlink: commit failed after host unlink succeeded: {e}")));
        Ok(())
    }

    /// `rmdir(path)`: host `rmdir(2)` then `path_unlink`.
    pub fn rmdir(&self, path: &[u8]) -> Result<()> {
        let tx = self.begin()?;
        if let Err(e) = self.host().rmdir(path) {
            tx.rollback()?;
            return Err(e.into());
        }
        tx.path_unlink(path)
            .unwrap_or_else(|e| fatal(&format!("rmdir: shadow update failed after host rmdir succeeded: {e}")));
        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("rmdir: commit failed after host rmdir succeeded: {e}")));
        Ok(())
    }

    /// `rename(src, dst)`: host `rename(2)` then `path_rename`, which
    /// overwrites any existing shadow row at `dst` the same way the host
    /// rename overwrote any existing host object there.
    pub fn rename(&self, src: &[u8], dst: &[u8]) -> Result<()> {
        let tx = self.begin()?;
        if let Err(e) = self.host().rename(src, dst) {
            tx.rollback()?;
            return Err(e.into());
        }
        tx.path_rename(src, dst)
            .unwrap_or_else(|e| fatal(&format!("rename: shadow update failed after host rename succeeded: {e}")));
        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("rename: commit failed after host rename succeeded: {e}")));
        Ok(())
    }

    /// `symlink(target, link)`: the link target is stored as the contents
    /// of a regular host file (since the host may refuse to create a
    /// dangling symlink), then shadowed with `S_IFLNK | 0777`. If the write
    /// fails partway, the half-created host file is removed best-effort
    /// before rolling back.
    pub fn symlink(&self, target: &[u8], link: &[u8], euid: u32, egid: u32) -> Result<()> {
        let tx = self.begin()?;
        if let Err(e) = self.host().write_new_file(link, target) {
            let _ = self.host().unlink(link);
            tx.rollback()?;
            return Err(e.into());
        }
        let stat = IshStat::new_lnk(euid, egid);
        tx.path_create(link, stat)
            .unwrap_or_else(|e| fatal(&format!("symlink: shadow create failed after host write succeeded: {e}")));
        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("symlink: commit failed after host write succeeded: {e}")));
        Ok(())
    }

    /// `mknod(path, mode, dev)`: block/character device types are forced to
    /// an empty regular host file (most hosts refuse unprivileged `mknod`
    /// for real device nodes); FIFOs are created as true host FIFOs. The
    /// shadow always records the guest's requested type bits and, for
    /// device types, `dev`.
    pub fn mknod(&self, path: &[u8], mode: u32, dev: u32, euid: u32, egid: u32) -> Result<()> {
        let tx = self.begin()?;
        let force_regular = is_blk(mode) || is_chr(mode);
        if let Err(e) = self.host().mknod(path, mode, force_regular) {
            tx.rollback()?;
            return Err(e.into());
        }
        let stat = IshStat::new_node(mode, euid, egid, dev);
        tx.path_create(path, stat)
            .unwrap_or_else(|e| fatal(&format!("mknod: shadow create failed after host mknod succeeded: {e}")));
        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("mknod: commit failed after host mknod succeeded: {e}")));
        Ok(())
    }

    /// `mkdir(path, mode)`: host `mkdir(2)` with permissive `0777` bits,
    /// then shadow the guest's requested permission bits under `S_IFDIR`.
    pub fn mkdir(&self, path: &[u8], mode: u32, euid: u32, egid: u32) -> Result<()> {
        let tx = self.begin()?;
        if let Err(e) = self.host().mkdir(path) {
            tx.rollback()?;
            return Err(e.into());
        }
        let stat = IshStat::new_dir(mode, euid, egid);
        tx.path_create(path, stat)
            .unwrap_or_else(|e| fatal(&format!("mkdir: shadow create failed after host mkdir succeeded: {e}")));
        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("mkdir: commit failed after host mkdir succeeded: {e}")));
        Ok(())
    }

    /// `stat(path)`: a host-FS existence/permission check (to surface
    /// genuine host errors such as `EACCES`) followed by the authoritative
    /// shadow lookup. Host size/time/link-count fields are the realfs
    /// pass-through layer's responsibility and aren't part of this shadow
    /// (spec's data model names only `mode`/`uid`/`gid`/`rdev`).
    pub fn stat(&self, path: &[u8]) -> Result<(Ino, IshStat)> {
        let tx = self.begin()?;
        if let Err(e) = self.host().stat(path) {
            tx.rollback()?;
            return Err(e.into());
        }
        let Some(entry) = tx.path_read_stat(path)? else {
            tx.rollback()?;
            return Err(not_found(path));
        };
        tx.commit()?;
        Ok(entry)
    }

    /// `fstat(fd)`: looks the shadow stat up directly by `fake_inode`.
    /// A missing row here is an invariant violation (invariant 1) — the fd
    /// was only ever handed out bound to a live inode — so it's fatal
    /// rather than a normal error.
    pub fn fstat(&self, open: &OpenFile) -> Result<IshStat> {
        let tx = self.begin()?;
        let Some(stat) = tx.inode_read_stat(open.fake_inode)? else {
            fatal("fstat: fake_inode has no stats row");
        };
        tx.commit()?;
        Ok(stat)
    }

    /// `setattr(path, attr)`: a size change delegates entirely to the
    /// host-FS with no shadow mutation; every other field is read from the
    /// shadow by path, mutated, and written back.
    pub fn setattr(&self, path: &[u8], attr: SetAttr) -> Result<()> {
        let tx = self.begin()?;
        if let SetAttr::Size(size) = attr {
            if let Err(e) = self.host().truncate(path, size) {
                tx.rollback()?;
                return Err(e.into());
            }
            tx.commit()
                .unwrap_or_else(|e| fatal(&format!("setattr: commit failed after host truncate succeeded: {e}")));
            return Ok(());
        }
        let Some((inode, mut stat)) = tx.path_read_stat(path)? else {
            tx.rollback()?;
            return Err(not_found(path));
        };
        apply_setattr(&mut stat, attr);
        tx.inode_write_stat(inode, stat)
            .unwrap_or_else(|e| fatal(&format!("setattr: shadow write failed: {e}")));
        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("setattr: commit failed: {e}")));
        Ok(())
    }

    /// `fsetattr(fd, attr)`: the by-inode counterpart of [`setattr`](Self::setattr).
    /// A missing shadow row for an already-open fd is fatal, same as
    /// [`fstat`](Self::fstat).
    pub fn fsetattr(&self, open: &OpenFile, attr: SetAttr) -> Result<()> {
        let tx = self.begin()?;
        if let SetAttr::Size(size) = attr {
            if let Err(e) = self.host().ftruncate(&open.file, size) {
                tx.rollback()?;
                return Err(e.into());
            }
            tx.commit()
                .unwrap_or_else(|e| fatal(&format!("fsetattr: commit failed after host ftruncate succeeded: {e}")));
            return Ok(());
        }
        let Some(mut stat) = tx.inode_read_stat(open.fake_inode)? else {
            fatal("fsetattr: fake_inode has no stats row");
        };
        apply_setattr(&mut stat, attr);
        tx.inode_write_stat(open.fake_inode, stat)
            .unwrap_or_else(|e| fatal(&format!("fsetattr: shadow write failed: {e}")));
        tx.commit()
            .unwrap_or_else(|e| fatal(&format!("fsetattr: commit failed: {e}")));
        Ok(())
    }

    /// `readlink(path)`: the shadow must name a symlink, or this rejects
    /// with [`Error::WrongType`]. The host `readlink(2)` call is tried
    /// first; `EINVAL` ("not a symbolic link" — the link's target is
    /// instead stored as the contents of a plain host file per
    /// [`symlink`](Self::symlink)) falls back to reading the file whole.
    pub fn readlink(&self, path: &[u8]) -> Result<Vec<u8>> {
        let tx = self.begin()?;
        let Some((_inode, stat)) = tx.path_read_stat(path)? else {
            tx.rollback()?;
            return Err(not_found(path));
        };
        if !is_lnk(stat.mode) {
            tx.rollback()?;
            return Err(wrong_type(path, "symlink"));
        }
        let data = match self.host().readlink(path) {
            Ok(d) => d,
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => match self.host().read_file(path) {
                Ok(d) => d,
                Err(e2) => {
                    tx.rollback()?;
                    return Err(e2.into());
                }
            },
            Err(e) => {
                tx.rollback()?;
                return Err(e.into());
            }
        };
        tx.commit()?;
        Ok(data)
    }

    /// Drops an open file. The pass-through vtable entries below (`close`
    /// through `utime`) are implemented directly by the host-FS
    /// collaborator with no shadow-metadata step and so don't open a
    /// transaction at all.
    pub fn close(&self, open: OpenFile) {
        drop(open.file);
    }

    /// Whole-file advisory lock, forwarded to the host-FS collaborator.
    pub fn flock(&self, open: &OpenFile, exclusive: bool) -> Result<()> {
        self.host().flock(&open.file, exclusive).map_err(Into::into)
    }

    /// Filesystem-level space usage, forwarded to the host-FS collaborator.
    pub fn statfs(&self) -> Result<HostStatfs> {
        self.host().statfs().map_err(Into::into)
    }

    /// Recovers the mount-relative path an open file was opened with.
    pub fn getpath(&self, open: &OpenFile) -> Result<Vec<u8>> {
        self.host().getpath(&open.file).map_err(Into::into)
    }

    /// Updates access/modification times, forwarded to the host-FS
    /// collaborator.
    pub fn utime(
        &self,
        path: &[u8],
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) -> Result<()> {
        self.host().utime(path, atime, mtime).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountConfig;

    fn open_mount(dir: &std::path::Path) -> Mount {
        let data_dir = dir.join("data");
        Mount::open(&MountConfig::new(&data_dir).allow_create()).unwrap()
    }

    #[test]
    fn mkdir_then_stat_reports_shadowed_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mount = open_mount(dir.path());
        mount.mkdir(b"/sub", 0o750, 1000, 1000).unwrap();
        let (_inode, stat) = mount.stat(b"/sub").unwrap();
        assert!(crate::stat::is_dir(stat.mode));
        assert_eq!(stat.mode & !S_IFMT, 0o750);
        assert_eq!(stat.uid, 1000);
    }

    #[test]
    fn mknod_char_device_forces_regular_host_file() {
        let dir = tempfile::tempdir().unwrap();
        let mount = open_mount(dir.path());
        let dev = crate::stat::makedev(1, 3);
        mount
            .mknod(b"/null", crate::stat::S_IFCHR | 0o666, dev, 0, 0)
            .unwrap();
        let (_inode, stat) = mount.stat(b"/null").unwrap();
        assert!(is_chr(stat.mode));
        assert_eq!(stat.rdev, dev);
        assert!(dir.path().join("data/null").is_file());
    }

    #[test]
    fn mknod_regular_file_creates_host_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let mount = open_mount(dir.path());
        mount
            .mknod(b"/f", crate::stat::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        let (_inode, stat) = mount.stat(b"/f").unwrap();
        assert!(crate::stat::is_reg(stat.mode));
        let meta = std::fs::symlink_metadata(dir.path().join("data/f")).unwrap();
        assert!(meta.is_file(), "mknod of a regular file must not create a host FIFO");
    }

    #[test]
    fn symlink_then_readlink_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mount = open_mount(dir.path());
        mount.symlink(b"/etc/passwd", b"/link", 0, 0).unwrap();
        let target = mount.readlink(b"/link").unwrap();
        assert_eq!(target, b"/etc/passwd");
    }

    #[test]
    fn open_create_then_setattr_then_fstat() {
        let dir = tempfile::tempdir().unwrap();
        let mount = open_mount(dir.path());
        let open = mount.open(b"/file", true, 0o600, 0, 0).unwrap();
        mount.setattr(b"/file", SetAttr::Mode(0o644)).unwrap();
        let stat = mount.fstat(&open).unwrap();
        assert_eq!(stat.mode & !S_IFMT, 0o644);
        mount.fsetattr(&open, SetAttr::Uid(42)).unwrap();
        assert_eq!(mount.fstat(&open).unwrap().uid, 42);
    }

    #[test]
    fn link_then_unlink_then_stat_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mount = open_mount(dir.path());
        mount.open(b"/a", true, 0o644, 0, 0).unwrap();
        mount.link(b"/a", b"/b").unwrap();
        let (inode_a, _) = mount.stat(b"/a").unwrap();
        let (inode_b, _) = mount.stat(b"/b").unwrap();
        assert_eq!(inode_a, inode_b);
        mount.unlink(b"/a").unwrap();
        assert!(mount.stat(b"/a").is_err());
        assert!(mount.stat(b"/b").is_ok());
    }

    #[test]
    fn readlink_on_non_symlink_is_wrong_type() {
        let dir = tempfile::tempdir().unwrap();
        let mount = open_mount(dir.path());
        mount.open(b"/plain", true, 0o644, 0, 0).unwrap();
        let err = mount.readlink(b"/plain").unwrap_err();
        assert!(matches!(err, Error::WrongType(_)));
    }
}
