//! End-to-end exercise of the opcode dispatcher over a socket pair standing
//! in for the `/dev/fuse` channel, so the suite runs without a kernel FUSE
//! mount or elevated privileges.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use sdcardfs::abi::{ForgetIn, InHeader, InitIn, MkDirIn, Opcode, ReadIn, ReleaseIn, WriteIn, WriteOut};
use sdcardfs::dispatch::{self, Context};
use sdcardfs::handle::HandleTable;
use sdcardfs::node::{NodeId, NodeTable};
use sdcardfs::policy::Policy;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

fn policy() -> Policy {
    Policy {
        force_lower_case: false,
        sdcard_gid: 1015,
        mount_uid: 9999,
        mount_gid: 9999,
    }
}

fn header(opcode: Opcode, unique: u64, nodeid: u64, body_len: usize) -> InHeader {
    InHeader {
        len: (size_of::<InHeader>() + body_len) as u32,
        opcode: opcode as u32,
        unique,
        nodeid,
        uid: 0,
        gid: 0,
        pid: 0,
        padding: 0,
    }
}

fn build_message(h: InHeader, body: &[u8]) -> Vec<u8> {
    let mut out = h.as_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

fn name_bytes(name: &str) -> Vec<u8> {
    let mut v = name.as_bytes().to_vec();
    v.push(0);
    v
}

/// Send one message on `kernel`, run it through `dispatch`, and return the
/// reply header plus body read back on `kernel`.
fn roundtrip(
    kernel: &mut UnixStream,
    ctx: &mut Context<'_>,
    message: &[u8],
) -> (OutHeaderOwned, Vec<u8>) {
    kernel.write_all(message).unwrap();

    let mut recv_buf = vec![0u8; sdcardfs::abi::BUFFER_SIZE];
    let n = sdcardfs::codec::read_request(ctx.channel_fd, &mut recv_buf).unwrap().unwrap();
    let parsed = sdcardfs::codec::parse_message(&recv_buf, n).unwrap();
    dispatch::dispatch(ctx, &parsed).unwrap();

    let mut out_hdr_buf = [0u8; 16];
    kernel.read_exact(&mut out_hdr_buf).unwrap();
    let (out_hdr, _) = OutHeaderOwned::read_from_prefix(&out_hdr_buf).unwrap();
    let body_len = out_hdr.len as usize - 16;
    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        kernel.read_exact(&mut body).unwrap();
    }
    (out_hdr, body)
}

// A FromBytes mirror of OutHeader purely for reading test replies back off
// the socket; the production OutHeader is IntoBytes-only since the
// dispatcher never needs to parse one.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct OutHeaderOwned {
    len: u32,
    error: i32,
    unique: u64,
}

fn init(kernel: &mut UnixStream, ctx: &mut Context<'_>) {
    let init_in = InitIn { major: 7, minor: 22, max_readahead: 131072, flags: 0 };
    let msg = build_message(header(Opcode::Init, 1, 1, size_of::<InitIn>()), init_in.as_bytes());
    let (out_hdr, body) = roundtrip(kernel, ctx, &msg);
    assert_eq!(out_hdr.error, 0);
    let (init_out, _) = InitOut2::read_from_prefix(&body).unwrap();
    assert_eq!(init_out.max_readahead, 131072);
    assert_eq!(init_out.max_write, 262144);
}

// Mirror of InitOut with FromBytes so the test can parse the reply.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct InitOut2 {
    major: u32,
    minor: u32,
    max_readahead: u32,
    flags: u32,
    max_background: u16,
    congestion_threshold: u16,
    max_write: u32,
}

#[test]
fn mkdir_lookup_rmdir_lookup_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = NodeTable::new(dir.path().as_os_str().to_os_string());
    let mut handles = HandleTable::new();
    let pol = policy();

    let (mut kernel, fs_side) = UnixStream::pair().unwrap();
    let channel_fd = std::os::fd::AsRawFd::as_raw_fd(&fs_side);

    let mut ctx = Context { channel_fd, nodes: &mut nodes, handles: &mut handles, policy: &pol };
    init(&mut kernel, &mut ctx);

    // MKDIR "sub" from root.
    let mkdir_in = MkDirIn { mode: 0o700, umask: 0 };
    let mut body = mkdir_in.as_bytes().to_vec();
    body.extend_from_slice(&name_bytes("sub"));
    let msg = build_message(header(Opcode::MkDir, 2, NodeId::ROOT.0, body.len()), &body);
    let (out_hdr, reply_body) = roundtrip(&mut kernel, &mut ctx, &msg);
    assert_eq!(out_hdr.error, 0);
    let (entry, _) = EntryOut2::read_from_prefix(&reply_body).unwrap();
    assert!(dir.path().join("sub").is_dir());
    assert_eq!(entry.attr_mode & 0o777, 0o775);
    let sub_nid = entry.nodeid;

    // LOOKUP "sub" again succeeds and bumps refcount.
    let lookup_body = name_bytes("sub");
    let msg = build_message(header(Opcode::Lookup, 3, NodeId::ROOT.0, lookup_body.len()), &lookup_body);
    let (out_hdr, reply_body) = roundtrip(&mut kernel, &mut ctx, &msg);
    assert_eq!(out_hdr.error, 0);
    let (entry2, _) = EntryOut2::read_from_prefix(&reply_body).unwrap();
    assert_eq!(entry2.nodeid, sub_nid);

    // FORGET both lookups; no reply is sent for FORGET.
    let forget_in = ForgetIn { nlookup: 2 };
    let msg = build_message(header(Opcode::Forget, 4, sub_nid, size_of::<ForgetIn>()), forget_in.as_bytes());
    kernel.write_all(&msg).unwrap();
    let mut recv_buf = vec![0u8; sdcardfs::abi::BUFFER_SIZE];
    let n = sdcardfs::codec::read_request(ctx.channel_fd, &mut recv_buf).unwrap().unwrap();
    let parsed = sdcardfs::codec::parse_message(&recv_buf, n).unwrap();
    dispatch::dispatch(&mut ctx, &parsed).unwrap();
    assert!(ctx.nodes.get(NodeId(sub_nid)).is_none());

    // RMDIR the host directory directly (node already forgotten).
    std::fs::remove_dir(dir.path().join("sub")).unwrap();
    assert!(!dir.path().join("sub").exists());
}

#[test]
fn write_then_read_round_trips_bytes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    let mut nodes = NodeTable::new(dir.path().as_os_str().to_os_string());
    let mut handles = HandleTable::new();
    let pol = policy();

    let (mut kernel, fs_side) = UnixStream::pair().unwrap();
    let channel_fd = std::os::fd::AsRawFd::as_raw_fd(&fs_side);
    let mut ctx = Context { channel_fd, nodes: &mut nodes, handles: &mut handles, policy: &pol };
    init(&mut kernel, &mut ctx);

    // LOOKUP "f" to get a nodeid.
    let lookup_body = name_bytes("f");
    let msg = build_message(header(Opcode::Lookup, 2, NodeId::ROOT.0, lookup_body.len()), &lookup_body);
    let (_, reply_body) = roundtrip(&mut kernel, &mut ctx, &msg);
    let (entry, _) = EntryOut2::read_from_prefix(&reply_body).unwrap();
    let nid = entry.nodeid;

    // OPEN it.
    let open_in = sdcardfs::abi::OpenIn { flags: libc::O_RDWR as u32, unused: 0 };
    let msg = build_message(header(Opcode::Open, 3, nid, size_of::<sdcardfs::abi::OpenIn>()), open_in.as_bytes());
    let (_, reply_body) = roundtrip(&mut kernel, &mut ctx, &msg);
    let (open_out, _) = OpenOut2::read_from_prefix(&reply_body).unwrap();
    let fh = open_out.fh;

    // WRITE "hello" at offset 0.
    let payload = b"hello";
    let write_in = WriteIn { fh, offset: 0, size: payload.len() as u32, write_flags: 0, lock_owner: 0, flags: 0, padding: 0 };
    let mut body = write_in.as_bytes().to_vec();
    body.extend_from_slice(payload);
    let msg = build_message(header(Opcode::Write, 4, nid, body.len()), &body);
    let (out_hdr, reply_body) = roundtrip(&mut kernel, &mut ctx, &msg);
    assert_eq!(out_hdr.error, 0);
    let (write_out, _) = WriteOut::read_from_prefix(&reply_body).unwrap();
    assert_eq!(write_out.size, payload.len() as u32);

    // READ it back.
    let read_in = ReadIn { fh, offset: 0, size: payload.len() as u32, read_flags: 0, lock_owner: 0, flags: 0, padding: 0 };
    let msg = build_message(header(Opcode::Read, 5, nid, size_of::<ReadIn>()), read_in.as_bytes());
    let (out_hdr, reply_body) = roundtrip(&mut kernel, &mut ctx, &msg);
    assert_eq!(out_hdr.error, 0);
    assert_eq!(reply_body, payload.to_vec());

    // RELEASE.
    let release_in = ReleaseIn { fh, flags: 0, release_flags: 0, lock_owner: 0 };
    let msg = build_message(header(Opcode::Release, 6, nid, size_of::<ReleaseIn>()), release_in.as_bytes());
    let (out_hdr, _) = roundtrip(&mut kernel, &mut ctx, &msg);
    assert_eq!(out_hdr.error, 0);
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct EntryOut2 {
    nodeid: u64,
    generation: u64,
    entry_valid: u64,
    attr_valid: u64,
    entry_valid_nsec: u32,
    attr_valid_nsec: u32,
    attr_ino: u64,
    attr_size: u64,
    attr_blocks: u64,
    attr_atime: u64,
    attr_mtime: u64,
    attr_ctime: u64,
    attr_atimensec: u32,
    attr_mtimensec: u32,
    attr_ctimensec: u32,
    attr_mode: u32,
    attr_nlink: u32,
    attr_uid: u32,
    attr_gid: u32,
    attr_rdev: u32,
    attr_blksize: u32,
    attr_padding: u32,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct OpenOut2 {
    fh: u64,
    open_flags: u32,
    padding: u32,
}
