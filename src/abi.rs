//! FUSE kernel wire structs.
//!
//! Only the fields this filesystem actually speaks are declared. The layout
//! still has to match the kernel's `struct fuse_*` definitions exactly
//! (`#[repr(C)]`, no implicit padding reordering), so structs are parsed and
//! serialized with `zerocopy` rather than copied field by field.

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Root nodeid, reserved by the protocol.
pub const ROOT_ID: u64 = 1;

/// Sentinel ino used for every READDIR entry; the backing filesystem's real
/// ino is intentionally hidden from the kernel.
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

/// Entry/attribute cache validity advertised on every LOOKUP/GETATTR reply.
pub const ATTR_TTL_SECS: u64 = 10;

/// Largest READ the handle table will service.
pub const MAX_READ_SIZE: u32 = 128 * 1024;

/// `max_write` negotiated at INIT.
pub const MAX_WRITE_SIZE: u32 = 256 * 1024;

/// Receive buffer size: has to comfortably fit a WRITE of `MAX_WRITE_SIZE`
/// bytes plus its header and argument struct.
pub const BUFFER_SIZE: usize = MAX_WRITE_SIZE as usize + 4096;

const OUR_MAJOR: u32 = 7;
const OUR_MINOR: u32 = 22;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InitFlags: u32 {
        const ATOMIC_O_TRUNC = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetattrValid: u32 {
        const MODE = 1 << 0;
        const UID = 1 << 1;
        const GID = 1 << 2;
        const SIZE = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    GetAttr = 3,
    SetAttr = 4,
    MkNod = 8,
    MkDir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Open = 14,
    Read = 15,
    Write = 16,
    StatFs = 17,
    Release = 18,
    Flush = 25,
    Init = 26,
    OpenDir = 27,
    ReadDir = 28,
    ReleaseDir = 29,
}

impl Opcode {
    pub fn from_raw(n: u32) -> Option<Opcode> {
        use Opcode::*;
        Some(match n {
            1 => Lookup,
            2 => Forget,
            3 => GetAttr,
            4 => SetAttr,
            8 => MkNod,
            9 => MkDir,
            10 => Unlink,
            11 => Rmdir,
            12 => Rename,
            14 => Open,
            15 => Read,
            16 => Write,
            17 => StatFs,
            18 => Release,
            25 => Flush,
            26 => Init,
            27 => OpenDir,
            28 => ReadDir,
            29 => ReleaseDir,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
}

impl InitOut {
    pub fn reply_for(req: &InitIn) -> InitOut {
        InitOut {
            major: OUR_MAJOR,
            minor: OUR_MINOR,
            max_readahead: req.max_readahead,
            flags: InitFlags::ATOMIC_O_TRUNC.bits(),
            max_background: 32,
            congestion_threshold: 32,
            max_write: MAX_WRITE_SIZE,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, KnownLayout, Immutable)]
pub struct FuseAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable)]
pub struct AttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: FuseAttr,
}

impl AttrOut {
    pub fn new(attr: FuseAttr) -> AttrOut {
        AttrOut {
            attr_valid: ATTR_TTL_SECS,
            attr_valid_nsec: 0,
            dummy: 0,
            attr,
        }
    }
}

#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: FuseAttr,
}

impl EntryOut {
    pub fn new(nodeid: u64, generation: u64, attr: FuseAttr) -> EntryOut {
        EntryOut {
            nodeid,
            generation,
            entry_valid: ATTR_TTL_SECS,
            attr_valid: ATTR_TTL_SECS,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ForgetIn {
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SetAttrIn {
    pub valid: u32,
    pub padding: u32,
    pub fh: u64,
    pub size: u64,
    pub lock_owner: u64,
    pub atime: u64,
    pub mtime: u64,
    pub unused2: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub unused3: u32,
    pub mode: u32,
    pub unused4: u32,
    pub uid: u32,
    pub gid: u32,
    pub unused5: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MkNodIn {
    pub mode: u32,
    pub rdev: u32,
    pub umask: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MkDirIn {
    pub mode: u32,
    pub umask: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RenameIn {
    pub newdir: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OpenIn {
    pub flags: u32,
    pub unused: u32,
}

#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WriteOut {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReleaseIn {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable)]
pub struct StatfsOut {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
    pub padding: u32,
    pub spare: [u32; 6],
}

#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable)]
pub struct Dirent {
    pub ino: u64,
    pub off: u64,
    pub namelen: u32,
    pub typ: u32,
    // followed by `namelen` bytes of name, not padded here; the caller pads
    // the whole entry up to an 8-byte boundary before the next one.
}

pub fn dirent_align(len: usize) -> usize {
    (len + 7) & !7
}
