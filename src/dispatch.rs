//! The opcode switch: resolves the target node, runs the opcode's contract
//! against the host filesystem, and writes exactly one reply.

use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::RawFd;

use zerocopy::IntoBytes;

use crate::abi::{
    self, AttrOut, Dirent, EntryOut, InHeader, InitIn, InitOut, MkDirIn, MkNodIn, Opcode, OpenIn,
    OpenOut, ReadIn, ReleaseIn, RenameIn, SetAttrIn, SetattrValid, StatfsOut, WriteIn, WriteOut,
};
use crate::attr::attr_from_metadata;
use crate::codec::{self, ArgReader, Message};
use crate::error::{Errno, OpResult};
use crate::handle::{DirStream, Handle, HandleTable};
use crate::node::{NodeId, NodeTable};
use crate::path::build_path;
use crate::policy::Policy;

const DT_UNKNOWN: u8 = 0;

/// Shared dispatch state, owned by the session loop and threaded through
/// every opcode handler.
pub struct Context<'a> {
    pub channel_fd: RawFd,
    pub nodes: &'a mut NodeTable,
    pub handles: &'a mut HandleTable,
    pub policy: &'a Policy,
}

/// Handle one parsed message. Writes exactly one reply to the channel,
/// except for FORGET which writes none.
pub fn dispatch(ctx: &mut Context<'_>, msg: &Message<'_>) -> std::io::Result<()> {
    let header = &msg.header;
    let Some(opcode) = Opcode::from_raw(header.opcode) else {
        return codec::write_status(ctx.channel_fd, header.unique, Errno::ENOSYS.to_wire());
    };

    let result = run(ctx, header, opcode, msg.body);
    match result {
        Ok(Reply::None) => Ok(()),
        Ok(Reply::Status) => codec::write_status(ctx.channel_fd, header.unique, 0),
        Ok(Reply::Body(body)) => codec::write_ok(ctx.channel_fd, header.unique, &body),
        Ok(Reply::Entry(body, node)) => {
            let result = codec::write_ok(ctx.channel_fd, header.unique, &body);
            if result.is_err() {
                log::warn!("reply write failed for nodeid={}, rolling back lookup refcount", node.0);
                ctx.nodes.release(node, 1);
            }
            result
        }
        Err(errno) => codec::write_status(ctx.channel_fd, header.unique, errno.to_wire()),
    }
}

enum Reply {
    None,
    Status,
    Body(Vec<u8>),
    /// An entry reply (LOOKUP, MKNOD, MKDIR) that advertised a node and
    /// bumped its refcount; on write failure the bump must be undone.
    Entry(Vec<u8>, NodeId),
}

fn run(ctx: &mut Context<'_>, header: &InHeader, opcode: Opcode, body: &[u8]) -> OpResult<Reply> {
    if opcode == Opcode::Init {
        let mut args = ArgReader::new(body);
        let init_in: &InitIn = args.fetch().ok_or(Errno::EINVAL)?;
        log::debug!("INIT major={} minor={}", init_in.major, init_in.minor);
        let out = InitOut::reply_for(init_in);
        return Ok(Reply::Body(out.as_bytes().to_vec()));
    }

    let node = resolve_node(ctx.nodes, header.nodeid)?;
    log::debug!("dispatch opcode={:?} nodeid={}", opcode, header.nodeid);

    match opcode {
        Opcode::Init => unreachable!("handled above"),
        Opcode::Lookup => {
            let mut args = ArgReader::new(body);
            let name = args.fetch_name().ok_or(Errno::EINVAL)?;
            do_lookup(ctx, node, name)
        }
        Opcode::Forget => {
            let mut args = ArgReader::new(body);
            let forget: &abi::ForgetIn = args.fetch().ok_or(Errno::EINVAL)?;
            ctx.nodes.release(node, forget.nlookup as u32);
            Ok(Reply::None)
        }
        Opcode::GetAttr => do_getattr(ctx, node),
        Opcode::SetAttr => {
            let mut args = ArgReader::new(body);
            let set: &SetAttrIn = args.fetch().ok_or(Errno::EINVAL)?;
            do_setattr(ctx, node, set)
        }
        Opcode::MkNod => {
            let mut args = ArgReader::new(body);
            let mknod: &MkNodIn = args.fetch().ok_or(Errno::EINVAL)?;
            let name = args.fetch_name().ok_or(Errno::EINVAL)?;
            do_mknod(ctx, node, name, mknod)
        }
        Opcode::MkDir => {
            let mut args = ArgReader::new(body);
            let mkdir: &MkDirIn = args.fetch().ok_or(Errno::EINVAL)?;
            let name = args.fetch_name().ok_or(Errno::EINVAL)?;
            do_mkdir(ctx, node, name, mkdir)
        }
        Opcode::Unlink => {
            let mut args = ArgReader::new(body);
            let name = args.fetch_name().ok_or(Errno::EINVAL)?;
            do_unlink(ctx, node, name, false)
        }
        Opcode::Rmdir => {
            let mut args = ArgReader::new(body);
            let name = args.fetch_name().ok_or(Errno::EINVAL)?;
            do_unlink(ctx, node, name, true)
        }
        Opcode::Rename => {
            let mut args = ArgReader::new(body);
            let rename: &RenameIn = args.fetch().ok_or(Errno::EINVAL)?;
            let oldname = args.fetch_name().ok_or(Errno::EINVAL)?;
            let newname = args.fetch_name().ok_or(Errno::EINVAL)?;
            do_rename(ctx, node, oldname, NodeId(rename.newdir), newname)
        }
        Opcode::Open => {
            let mut args = ArgReader::new(body);
            let open: &OpenIn = args.fetch().ok_or(Errno::EINVAL)?;
            do_open(ctx, node, open)
        }
        Opcode::Read => {
            let mut args = ArgReader::new(body);
            let read: &ReadIn = args.fetch().ok_or(Errno::EINVAL)?;
            do_read(ctx, read)
        }
        Opcode::Write => {
            let mut args = ArgReader::new(body);
            let write: &WriteIn = args.fetch().ok_or(Errno::EINVAL)?;
            let data = args.fetch_all();
            do_write(ctx, write, data)
        }
        Opcode::StatFs => do_statfs(ctx),
        Opcode::Release => {
            let mut args = ArgReader::new(body);
            let release: &ReleaseIn = args.fetch().ok_or(Errno::EINVAL)?;
            ctx.handles.remove(release.fh);
            Ok(Reply::Status)
        }
        Opcode::Flush => Ok(Reply::Status),
        Opcode::OpenDir => do_opendir(ctx, node),
        Opcode::ReadDir => {
            let mut args = ArgReader::new(body);
            let read: &ReadIn = args.fetch().ok_or(Errno::EINVAL)?;
            do_readdir(ctx, read.fh)
        }
        Opcode::ReleaseDir => {
            let mut args = ArgReader::new(body);
            let release: &ReleaseIn = args.fetch().ok_or(Errno::EINVAL)?;
            ctx.handles.remove(release.fh);
            Ok(Reply::Status)
        }
    }
}

fn resolve_node(nodes: &NodeTable, nodeid: u64) -> OpResult<NodeId> {
    if nodeid == 0 {
        return Ok(NodeId::ROOT);
    }
    let id = NodeId(nodeid);
    if nodes.get(id).is_some() {
        Ok(id)
    } else {
        Err(Errno::ENOENT)
    }
}

fn lstat(path: &[u8]) -> OpResult<std::fs::Metadata> {
    std::fs::symlink_metadata(OsStr::from_bytes(path)).map_err(Errno::from)
}

fn host_path(ctx: &Context<'_>, node: NodeId, extra: Option<&OsStr>) -> OpResult<Vec<u8>> {
    build_path(ctx.nodes, node, extra, ctx.policy.force_lower_case)
}

fn do_lookup(ctx: &mut Context<'_>, parent: NodeId, name: &[u8]) -> OpResult<Reply> {
    let name_os = OsStr::from_bytes(name);
    let path = host_path(ctx, parent, Some(name_os))?;
    let meta = lstat(&path)?;

    let stored_name = if ctx.policy.force_lower_case {
        OsString::from_vec(name.to_ascii_lowercase())
    } else {
        OsString::from(name_os)
    };

    let child = match ctx.nodes.lookup_child(parent, &stored_name) {
        Some(id) => id,
        None => ctx.nodes.create_child(parent, stored_name),
    };
    ctx.nodes.bump(child, 1);

    let generation = ctx.nodes.get(child).map(|n| n.generation).unwrap_or(0);
    let attr = attr_from_metadata(&meta, child, ctx.policy);
    let out = EntryOut::new(child.0, generation, attr);
    Ok(Reply::Entry(out.as_bytes().to_vec(), child))
}

fn do_getattr(ctx: &mut Context<'_>, node: NodeId) -> OpResult<Reply> {
    let path = host_path(ctx, node, None)?;
    let meta = lstat(&path)?;
    let attr = attr_from_metadata(&meta, node, ctx.policy);
    let out = AttrOut::new(attr);
    Ok(Reply::Body(out.as_bytes().to_vec()))
}

fn do_setattr(ctx: &mut Context<'_>, node: NodeId, set: &SetAttrIn) -> OpResult<Reply> {
    let valid = SetattrValid::from_bits_truncate(set.valid);
    if valid.contains(SetattrValid::SIZE) {
        let path = host_path(ctx, node, None)?;
        let cpath = std::ffi::CString::new(path).map_err(|_| Errno::EINVAL)?;
        let rc = unsafe { libc::truncate(cpath.as_ptr(), set.size as libc::off_t) };
        if rc != 0 {
            return Err(Errno::from_io(&std::io::Error::last_os_error()));
        }
    }
    // mode/uid/gid/atime/mtime changes are silently dropped by policy.
    do_getattr(ctx, node)
}

fn do_mknod(ctx: &mut Context<'_>, parent: NodeId, name: &[u8], args: &MkNodIn) -> OpResult<Reply> {
    let name_os = OsStr::from_bytes(name);
    let path = host_path(ctx, parent, Some(name_os))?;
    let cpath = std::ffi::CString::new(path).map_err(|_| Errno::EINVAL)?;
    let mode = (args.mode & !0o777) | 0o664;
    let rc = unsafe { libc::mknod(cpath.as_ptr(), mode, args.rdev as libc::dev_t) };
    if rc != 0 {
        return Err(Errno::from_io(&std::io::Error::last_os_error()));
    }
    do_lookup(ctx, parent, name)
}

fn do_mkdir(ctx: &mut Context<'_>, parent: NodeId, name: &[u8], args: &MkDirIn) -> OpResult<Reply> {
    let name_os = OsStr::from_bytes(name);
    let path = host_path(ctx, parent, Some(name_os))?;
    let cpath = std::ffi::CString::new(path).map_err(|_| Errno::EINVAL)?;
    let mode = (args.mode & !0o777) | 0o775;
    let rc = unsafe { libc::mkdir(cpath.as_ptr(), mode) };
    if rc != 0 {
        return Err(Errno::from_io(&std::io::Error::last_os_error()));
    }
    do_lookup(ctx, parent, name)
}

fn do_unlink(ctx: &mut Context<'_>, parent: NodeId, name: &[u8], is_dir: bool) -> OpResult<Reply> {
    let name_os = OsStr::from_bytes(name);
    let path = host_path(ctx, parent, Some(name_os))?;
    let cpath = std::ffi::CString::new(path).map_err(|_| Errno::EINVAL)?;
    let rc = if is_dir {
        unsafe { libc::rmdir(cpath.as_ptr()) }
    } else {
        unsafe { libc::unlink(cpath.as_ptr()) }
    };
    if rc != 0 {
        return Err(Errno::from_io(&std::io::Error::last_os_error()));
    }
    Ok(Reply::Status)
}

fn do_rename(
    ctx: &mut Context<'_>,
    old_parent: NodeId,
    oldname: &[u8],
    new_parent: NodeId,
    newname: &[u8],
) -> OpResult<Reply> {
    let oldname_os = OsStr::from_bytes(oldname);
    let lookup_name = if ctx.policy.force_lower_case {
        OsString::from_vec(oldname.to_ascii_lowercase())
    } else {
        OsString::from(oldname_os)
    };
    let child = ctx
        .nodes
        .lookup_child(old_parent, &lookup_name)
        .ok_or(Errno::ENOENT)?;

    let old_path = host_path(ctx, old_parent, Some(oldname_os))?;
    let new_path = host_path(ctx, new_parent, Some(OsStr::from_bytes(newname)))?;

    let new_stored_name = if ctx.policy.force_lower_case {
        OsString::from_vec(newname.to_ascii_lowercase())
    } else {
        OsString::from(OsStr::from_bytes(newname))
    };

    // Commit the in-memory mutation before the host rename; on host failure
    // the graph and host tree can diverge, matching the original tool's
    // wire-visible contract rather than rolling back.
    let _ = ctx.nodes.detach(old_parent, child);
    ctx.nodes.rename(child, new_stored_name);
    ctx.nodes.attach(new_parent, child);

    let old_cpath = std::ffi::CString::new(old_path).map_err(|_| Errno::EINVAL)?;
    let new_cpath = std::ffi::CString::new(new_path).map_err(|_| Errno::EINVAL)?;
    let rc = unsafe { libc::rename(old_cpath.as_ptr(), new_cpath.as_ptr()) };
    if rc != 0 {
        return Err(Errno::from_io(&std::io::Error::last_os_error()));
    }
    Ok(Reply::Status)
}

fn do_open(ctx: &mut Context<'_>, node: NodeId, args: &OpenIn) -> OpResult<Reply> {
    let path = host_path(ctx, node, None)?;
    let os_path = OsStr::from_bytes(&path);
    let flags = args.flags as i32;

    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => opts.read(true),
        libc::O_WRONLY => opts.write(true),
        libc::O_RDWR => opts.read(true).write(true),
        _ => return Err(Errno::EINVAL),
    };
    let file = opts
        .custom_flags(flags & !libc::O_ACCMODE)
        .open(os_path)
        .map_err(Errno::from)?;
    let fh = ctx.handles.insert(Handle::File(file));
    let out = OpenOut { fh, open_flags: 0, padding: 0 };
    Ok(Reply::Body(out.as_bytes().to_vec()))
}

fn with_file<T>(handles: &HandleTable, fh: u64, f: impl FnOnce(&File) -> OpResult<T>) -> OpResult<T> {
    match handles.get(fh) {
        Some(Handle::File(file)) => f(file),
        _ => Err(Errno::EINVAL),
    }
}

fn do_read(ctx: &mut Context<'_>, args: &ReadIn) -> OpResult<Reply> {
    if args.size > abi::MAX_READ_SIZE {
        return Err(Errno::EINVAL);
    }
    let mut buf = vec![0u8; args.size as usize];
    let n = with_file(ctx.handles, args.fh, |file| {
        file.read_at(&mut buf, args.offset).map_err(Errno::from)
    })?;
    buf.truncate(n);
    Ok(Reply::Body(buf))
}

fn do_write(ctx: &mut Context<'_>, args: &WriteIn, data: &[u8]) -> OpResult<Reply> {
    let n = with_file(ctx.handles, args.fh, |file| {
        file.write_at(data, args.offset).map_err(Errno::from)
    })?;
    let out = WriteOut { size: n as u32, padding: 0 };
    Ok(Reply::Body(out.as_bytes().to_vec()))
}

fn do_statfs(ctx: &mut Context<'_>) -> OpResult<Reply> {
    let path = host_path(ctx, NodeId::ROOT, None)?;
    let cpath = std::ffi::CString::new(path).map_err(|_| Errno::EINVAL)?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(Errno::from_io(&std::io::Error::last_os_error()));
    }
    let out = StatfsOut {
        blocks: st.f_blocks as u64,
        bfree: st.f_bfree as u64,
        bavail: st.f_bavail as u64,
        files: st.f_files as u64,
        ffree: st.f_ffree as u64,
        bsize: st.f_bsize as u32,
        namelen: st.f_namemax as u32,
        frsize: st.f_frsize as u32,
        padding: 0,
        spare: [0; 6],
    };
    Ok(Reply::Body(out.as_bytes().to_vec()))
}

fn do_opendir(ctx: &mut Context<'_>, node: NodeId) -> OpResult<Reply> {
    let path = host_path(ctx, node, None)?;
    let dir = DirStream::open(&path).ok_or_else(|| Errno::from_io(&std::io::Error::last_os_error()))?;
    let fh = ctx.handles.insert(Handle::Dir(dir));
    let out = OpenOut { fh, open_flags: 0, padding: 0 };
    Ok(Reply::Body(out.as_bytes().to_vec()))
}

fn do_readdir(ctx: &mut Context<'_>, fh: u64) -> OpResult<Reply> {
    let entry = match ctx.handles.get_mut(fh) {
        Some(Handle::Dir(dir)) => dir.next(),
        _ => return Err(Errno::EINVAL),
    };
    let Some((name, d_type)) = entry else {
        return Ok(Reply::Body(Vec::new()));
    };

    let dtype = if d_type == libc::DT_UNKNOWN { DT_UNKNOWN } else { d_type };
    let header = Dirent {
        ino: abi::UNKNOWN_INO,
        off: 0,
        namelen: name.len() as u32,
        typ: dtype as u32,
    };
    let mut body = header.as_bytes().to_vec();
    body.extend_from_slice(&name);
    let padded = abi::dirent_align(body.len());
    body.resize(padded, 0);
    Ok(Reply::Body(body))
}
