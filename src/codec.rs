//! Wire framing: turning a raw kernel read into a parsed header plus body,
//! and writing replies back as a single scatter-gather `writev`.

use std::io::{self, IoSlice};
use std::os::fd::RawFd;

use smallvec::SmallVec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::abi::{InHeader, OutHeader};
use crate::error::FatalError;

/// A single parsed kernel request: the fixed header plus whatever bytes
/// follow it (the opcode-specific argument struct and/or name bytes).
#[derive(Debug)]
pub struct Message<'a> {
    pub header: InHeader,
    pub body: &'a [u8],
}

/// Read one message out of `buf`, which holds `n` valid bytes starting at
/// index 0. Mirrors the source's framing check: the declared `len` must
/// match what's actually in the buffer and must be at least big enough for
/// the header.
pub fn parse_message(buf: &[u8], n: usize) -> Result<Message<'_>, FatalError> {
    let header_size = size_of::<InHeader>();
    if n < header_size {
        return Err(FatalError::ShortHeader(n));
    }
    if n > buf.len() {
        return Err(FatalError::OversizedMessage {
            declared: n as u32,
            capacity: buf.len(),
        });
    }
    let (header, rest) = InHeader::read_from_prefix(&buf[..n]).expect("checked above");
    if header.len as usize > n {
        return Err(FatalError::OversizedMessage {
            declared: header.len,
            capacity: n,
        });
    }
    Ok(Message {
        header,
        body: &rest[..header.len as usize - header_size],
    })
}

/// Walks a request body, handing out fixed-size argument structs and a
/// trailing run of bytes (a NUL-terminated name, or raw write data).
pub struct ArgReader<'a> {
    data: &'a [u8],
}

impl<'a> ArgReader<'a> {
    pub fn new(data: &'a [u8]) -> ArgReader<'a> {
        ArgReader { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Fetch a fixed-size argument struct from the front of the buffer.
    pub fn fetch<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Option<&'a T> {
        let (value, rest) = T::ref_from_prefix(self.data).ok()?;
        self.data = rest;
        Some(value)
    }

    /// Fetch the rest of the buffer verbatim (e.g. WRITE's payload).
    pub fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Fetch a single NUL-terminated name and advance past its terminator.
    pub fn fetch_name(&mut self) -> Option<&'a [u8]> {
        let nul = self.data.iter().position(|&b| b == 0)?;
        let name = &self.data[..nul];
        self.data = &self.data[nul + 1..];
        Some(name)
    }
}

/// Read exactly one request from `fd` into `buf`, retrying transparently on
/// `EINTR`. Returns `Ok(None)` when the device signals there is nothing more
/// to read (the filesystem was unmounted).
pub fn read_request(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>, FatalError> {
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc >= 0 {
            return Ok(Some(rc as usize));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ENODEV) => return Ok(None),
            _ => return Err(FatalError::ChannelRead(err)),
        }
    }
}

/// Write a status-only reply (`error` possibly nonzero, no body).
pub fn write_status(fd: RawFd, unique: u64, error: i32) -> io::Result<()> {
    write_reply(fd, unique, error, &[])
}

/// Write a successful reply carrying `body` (already-serialized wire bytes).
pub fn write_ok(fd: RawFd, unique: u64, body: &[u8]) -> io::Result<()> {
    write_reply(fd, unique, 0, body)
}

fn write_reply(fd: RawFd, unique: u64, error: i32, body: &[u8]) -> io::Result<()> {
    let header = OutHeader {
        len: (size_of::<OutHeader>() + body.len()) as u32,
        error,
        unique,
    };
    let header_bytes = header.as_bytes();
    let mut iov: SmallVec<[IoSlice<'_>; 2]> = SmallVec::new();
    iov.push(IoSlice::new(header_bytes));
    if !body.is_empty() {
        iov.push(IoSlice::new(body));
    }
    writev_all(fd, &iov)
}

fn writev_all(fd: RawFd, iov: &[IoSlice<'_>]) -> io::Result<()> {
    use std::os::fd::BorrowedFd;
    // SAFETY: `fd` is the kernel channel descriptor owned by the session for
    // the duration of the call; it outlives this borrow.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match nix::sys::uio::writev(borrowed, iov) {
        Ok(_) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}
