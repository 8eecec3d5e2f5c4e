//! Crate-wide error types.
//!
//! Two distinct error surfaces exist. [`FatalError`] covers failures that
//! terminate the dispatch loop outright (malformed framing, an unrecoverable
//! channel read). Individual opcode handlers instead work in terms of a raw,
//! positive `errno` value (see [`Errno`]) since that is what ends up on the
//! wire; building a heap-allocated error for every host syscall on the hot
//! path would be wasteful.

use std::fmt;
use std::io;

/// A positive errno value, as returned by `libc`/`nix` on syscall failure.
///
/// The wire protocol wants the *negated* value; callers convert at the last
/// possible moment via [`Errno::to_wire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const EIO: Errno = Errno(libc::EIO);

    /// The negated value to place in the reply header's `error` field.
    pub fn to_wire(self) -> i32 {
        -self.0
    }

    pub fn from_io(err: &io::Error) -> Errno {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }

    pub fn from_nix(err: nix::Error) -> Errno {
        Errno(err as i32)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno::from_io(&err)
    }
}

impl From<nix::Error> for Errno {
    fn from(err: nix::Error) -> Self {
        Errno::from_nix(err)
    }
}

/// Outcome of a single opcode handler: either the handler already wrote its
/// own reply (entries, data, directory listings, ...) or it failed and the
/// dispatcher should write a status-only error reply on its behalf.
pub type OpResult<T> = Result<T, Errno>;

/// A failure that ends the request loop. Framing errors and channel read
/// errors other than `EINTR` fall in this category; the session has no way
/// to keep interpreting the byte stream afterwards.
#[derive(Debug)]
pub enum FatalError {
    /// The kernel's message length was shorter than a `fuse_in_header`.
    ShortHeader(usize),
    /// The header declared a length than does not fit in the receive buffer.
    OversizedMessage { declared: u32, capacity: usize },
    /// The declared length didn't leave enough bytes for the opcode's
    /// fixed-size argument struct.
    ShortArgument { opcode: u32, needed: usize, have: usize },
    /// Reading from the kernel channel failed for a reason other than
    /// `EINTR`.
    ChannelRead(io::Error),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::ShortHeader(len) => {
                write!(f, "short read of fuse_in_header ({len} bytes)")
            }
            FatalError::OversizedMessage { declared, capacity } => write!(
                f,
                "message declared length {declared} exceeds buffer capacity {capacity}"
            ),
            FatalError::ShortArgument { opcode, needed, have } => write!(
                f,
                "opcode {opcode} needs {needed} argument bytes, only {have} available"
            ),
            FatalError::ChannelRead(err) => write!(f, "channel read failed: {err}"),
        }
    }
}

impl std::error::Error for FatalError {}

/// Failures that can occur before a FUSE channel even exists: argument
/// validation, mounting, and privilege dropping. These are reported on
/// stderr via the logging facade and turn into a nonzero process exit code,
/// never into a wire reply.
#[derive(Debug)]
pub enum BootstrapError {
    InvalidArgument(String),
    Io(io::Error),
    Nix(nix::Error),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            BootstrapError::Io(err) => write!(f, "I/O error: {err}"),
            BootstrapError::Nix(err) => write!(f, "system call failed: {err}"),
        }
    }
}

impl std::error::Error for BootstrapError {}

impl From<io::Error> for BootstrapError {
    fn from(err: io::Error) -> Self {
        BootstrapError::Io(err)
    }
}

impl From<nix::Error> for BootstrapError {
    fn from(err: nix::Error) -> Self {
        BootstrapError::Nix(err)
    }
}
