//! The shadow stat record (`ishstat`) and file-type helpers.
//!
//! Spec §3/§6: a fixed 16-byte blob, four little-endian `u32` fields in
//! order `mode, uid, gid, rdev`. No padding, no version byte — the layout
//! must be identical across every host that shares the data directory.

use crate::error::{Error, Result};

/// Size in bytes of a serialized [`IshStat`].
pub const BLOB_LEN: usize = 16;

/// The guest-visible identity/type/ownership record shadowed for one inode.
///
/// `mode` carries both file-type bits (`S_IFMT`) and permission bits.
/// `rdev` is meaningful only when the type bits name a block or character
/// device; it is `0` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IshStat {
    /// File-type bits (`S_IFMT`) plus permission bits.
    pub mode: u32,
    /// Owning user ID.
    pub uid: u32,
    /// Owning group ID.
    pub gid: u32,
    /// Device number, populated only for block/character devices.
    pub rdev: u32,
}

impl IshStat {
    /// Builds a regular-file stat with the given mode's permission bits.
    #[must_use]
    pub fn new_reg(perm: u32, uid: u32, gid: u32) -> Self {
        Self {
            mode: (perm & !S_IFMT) | S_IFREG,
            uid,
            gid,
            rdev: 0,
        }
    }

    /// Builds a directory stat with the given mode's permission bits.
    #[must_use]
    pub fn new_dir(perm: u32, uid: u32, gid: u32) -> Self {
        Self {
            mode: (perm & !S_IFMT) | S_IFDIR,
            uid,
            gid,
            rdev: 0,
        }
    }

    /// Builds a symlink stat (permissions are conventionally `0777`).
    #[must_use]
    pub fn new_lnk(uid: u32, gid: u32) -> Self {
        Self {
            mode: 0o777 | S_IFLNK,
            uid,
            gid,
            rdev: 0,
        }
    }

    /// Builds a device-node stat; `rdev` is kept only when `mode` names a
    /// block or character device.
    #[must_use]
    pub fn new_node(mode: u32, uid: u32, gid: u32, rdev: u32) -> Self {
        let rdev = if is_blk(mode) || is_chr(mode) { rdev } else { 0 };
        Self { mode, uid, gid, rdev }
    }

    /// Returns the `S_IFMT` file-type bits.
    #[must_use]
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    /// Serializes to the 16-byte little-endian blob layout.
    #[must_use]
    pub fn to_blob(self) -> [u8; BLOB_LEN] {
        let mut out = [0u8; BLOB_LEN];
        out[0..4].copy_from_slice(&self.mode.to_le_bytes());
        out[4..8].copy_from_slice(&self.uid.to_le_bytes());
        out[8..12].copy_from_slice(&self.gid.to_le_bytes());
        out[12..16].copy_from_slice(&self.rdev.to_le_bytes());
        out
    }

    /// Deserializes from a blob of exactly [`BLOB_LEN`] bytes.
    pub fn from_blob(data: &[u8]) -> Result<Self> {
        if data.len() != BLOB_LEN {
            return Err(Error::InvalidMount(format!(
                "stat blob has {} bytes, expected {BLOB_LEN}",
                data.len()
            )));
        }
        let field = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(data[range].try_into().unwrap_or_default())
        };
        Ok(Self {
            mode: field(0..4),
            uid: field(4..8),
            gid: field(8..12),
            rdev: field(12..16),
        })
    }
}

/// File-type mask (`S_IFMT`).
pub const S_IFMT: u32 = libc::S_IFMT as u32;
/// Regular file type bits.
pub const S_IFREG: u32 = libc::S_IFREG as u32;
/// Directory type bits.
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
/// Symbolic link type bits.
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;
/// Character device type bits.
pub const S_IFCHR: u32 = libc::S_IFCHR as u32;
/// Block device type bits.
pub const S_IFBLK: u32 = libc::S_IFBLK as u32;
/// FIFO type bits.
pub const S_IFIFO: u32 = libc::S_IFIFO as u32;
/// Socket type bits.
pub const S_IFSOCK: u32 = libc::S_IFSOCK as u32;

/// Returns `true` if `mode`'s type bits name a regular file.
#[must_use]
pub fn is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

/// Returns `true` if `mode`'s type bits name a directory.
#[must_use]
pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Returns `true` if `mode`'s type bits name a symbolic link.
#[must_use]
pub fn is_lnk(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Returns `true` if `mode`'s type bits name a character device.
#[must_use]
pub fn is_chr(mode: u32) -> bool {
    mode & S_IFMT == S_IFCHR
}

/// Returns `true` if `mode`'s type bits name a block device.
#[must_use]
pub fn is_blk(mode: u32) -> bool {
    mode & S_IFMT == S_IFBLK
}

/// Composes a `rdev` value from major/minor device numbers.
///
/// `rdev` is a 32-bit field in this shadow store (spec §3/§6), so this uses
/// the classic 8-bit-minor/24-bit-major packing rather than glibc's 64-bit
/// `makedev` — the exact bit layout is host-kernel-specific and out of
/// scope for this core; `makedev`/`major`/`minor` only need to round-trip
/// with each other.
#[must_use]
pub fn makedev(major: u32, minor: u32) -> u32 {
    (major << 8) | (minor & 0xff)
}

/// Extracts the major device number from a `rdev` value.
#[must_use]
pub fn major(rdev: u32) -> u32 {
    rdev >> 8
}

/// Extracts the minor device number from a `rdev` value.
#[must_use]
pub fn minor(rdev: u32) -> u32 {
    rdev & 0xff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let s = IshStat {
            mode: S_IFREG | 0o644,
            uid: 1000,
            gid: 1000,
            rdev: 0,
        };
        let blob = s.to_blob();
        assert_eq!(blob.len(), BLOB_LEN);
        let back = IshStat::from_blob(&blob).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn blob_field_order_is_mode_uid_gid_rdev() {
        let s = IshStat {
            mode: 1,
            uid: 2,
            gid: 3,
            rdev: 4,
        };
        let blob = s.to_blob();
        assert_eq!(&blob[0..4], &1u32.to_le_bytes());
        assert_eq!(&blob[4..8], &2u32.to_le_bytes());
        assert_eq!(&blob[8..12], &3u32.to_le_bytes());
        assert_eq!(&blob[12..16], &4u32.to_le_bytes());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(IshStat::from_blob(&[0u8; 15]).is_err());
        assert!(IshStat::from_blob(&[0u8; 17]).is_err());
    }

    #[test]
    fn new_node_drops_rdev_for_non_devices() {
        let s = IshStat::new_node(S_IFREG | 0o644, 0, 0, makedev(1, 3));
        assert_eq!(s.rdev, 0);
    }

    #[test]
    fn new_node_keeps_rdev_for_devices() {
        let s = IshStat::new_node(S_IFCHR | 0o666, 0, 0, makedev(1, 3));
        assert_eq!(s.rdev, makedev(1, 3));
        assert_eq!(major(s.rdev), 1);
        assert_eq!(minor(s.rdev), 3);
    }

    #[test]
    fn setattr_mode_preserves_type_bits() {
        let mut s = IshStat::new_dir(0o700, 0, 0);
        let prior_type = s.file_type();
        s.mode = (s.mode & S_IFMT) | (0o755 & !S_IFMT);
        assert_eq!(s.file_type(), prior_type);
        assert_eq!(s.mode & !S_IFMT, 0o755);
    }
}
