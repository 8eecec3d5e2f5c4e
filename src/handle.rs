//! Open file and open-directory descriptors, keyed by an opaque 64-bit id
//! surfaced to the kernel as `fh`.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

/// A directory stream opened via `opendir`. Entries are served one at a
/// time from `readdir`'s own cursor; offsets sent by the kernel are not
/// honored.
pub struct DirStream {
    dir: *mut libc::DIR,
}

// The stream is only ever touched from the single dispatch thread.
unsafe impl Send for DirStream {}

impl DirStream {
    pub fn open(path: &[u8]) -> Option<DirStream> {
        let cpath = std::ffi::CString::new(path).ok()?;
        let dir = unsafe { libc::opendir(cpath.as_ptr()) };
        if dir.is_null() {
            None
        } else {
            Some(DirStream { dir })
        }
    }

    /// Advance the stream and return the next entry's name and `d_type`,
    /// or `None` at end-of-stream.
    pub fn next(&mut self) -> Option<(Vec<u8>, u8)> {
        unsafe {
            *libc::__errno_location() = 0;
            let entry = libc::readdir(self.dir);
            if entry.is_null() {
                return None;
            }
            let name = std::ffi::CStr::from_ptr((*entry).d_name.as_ptr()).to_bytes().to_vec();
            let d_type = (*entry).d_type;
            Some((name, d_type))
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.dir);
        }
    }
}

pub enum Handle {
    File(File),
    Dir(DirStream),
}

/// Monotonically-allocated 64-bit handle ids, never recycled while the
/// kernel might still hold one.
pub struct HandleTable {
    handles: HashMap<u64, Handle>,
    next_fh: u64,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    pub fn insert(&mut self, handle: Handle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<&Handle> {
        self.handles.get(&fh)
    }

    pub fn get_mut(&mut self, fh: u64) -> Option<&mut Handle> {
        self.handles.get_mut(&fh)
    }

    pub fn remove(&mut self, fh: u64) -> Option<Handle> {
        self.handles.remove(&fh)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

pub fn file_fd(handle: &Handle) -> Option<RawFd> {
    match handle {
        Handle::File(f) => Some(f.as_raw_fd()),
        Handle::Dir(_) => None,
    }
}
