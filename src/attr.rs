//! Translating a host `lstat` record into the wire `fuse_attr`, enforcing
//! the fixed ownership/permission policy.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use crate::abi::FuseAttr;
use crate::node::NodeId;
use crate::policy::Policy;

const S_IXUSR: u32 = 0o100;
const MODE_BITS: u32 = 0o777;
const DIR_MODE: u32 = 0o775;
const FILE_MODE: u32 = 0o664;

/// Map a host `lstat` result plus the node's kernel-visible id into the
/// wire attribute record.
pub fn attr_from_metadata(meta: &Metadata, node: NodeId, policy: &Policy) -> FuseAttr {
    let host_mode = meta.mode();
    let perm_bits = if host_mode & S_IXUSR != 0 {
        DIR_MODE
    } else {
        FILE_MODE
    };
    let mode = (host_mode & !MODE_BITS) | perm_bits;

    FuseAttr {
        ino: node.0,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: meta.atime() as u64,
        mtime: meta.mtime() as u64,
        ctime: meta.ctime() as u64,
        atimensec: meta.atime_nsec() as u32,
        mtimensec: meta.mtime_nsec() as u32,
        ctimensec: meta.ctime_nsec() as u32,
        mode,
        nlink: meta.nlink() as u32,
        uid: 0,
        gid: policy.sdcard_gid,
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        padding: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn policy() -> Policy {
        Policy {
            force_lower_case: false,
            sdcard_gid: 1015,
            mount_uid: 9999,
            mount_gid: 9999,
        }
    }

    #[test]
    fn non_executable_file_gets_0664() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hi").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let meta = fs::symlink_metadata(&path).unwrap();
        let attr = attr_from_metadata(&meta, NodeId(2), &policy());
        assert_eq!(attr.mode & 0o777, 0o664);
        assert_eq!(attr.uid, 0);
        assert_eq!(attr.gid, 1015);
        assert_eq!(attr.ino, 2);
        assert_eq!(attr.size, 2);
    }

    #[test]
    fn executable_file_gets_0775() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hi").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700)).unwrap();
        let meta = fs::symlink_metadata(&path).unwrap();
        let attr = attr_from_metadata(&meta, NodeId(3), &policy());
        assert_eq!(attr.mode & 0o777, 0o775);
    }

    #[test]
    fn file_type_bits_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let meta = fs::symlink_metadata(dir.path()).unwrap();
        let attr = attr_from_metadata(&meta, NodeId::ROOT, &policy());
        assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFDIR);
        assert_eq!(attr.mode & 0o777, 0o775);
    }
}
