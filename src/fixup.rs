//! Offline pre-mount pass: chown every entry under the host root to the
//! configured uid/gid and rename anything not already lower case.
//!
//! Runs once before the dispatcher exists and never touches the FUSE
//! channel or the node table.

use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

pub fn run(root: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    walk(root, uid, gid)
}

fn walk(dir: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let mut path = entry.path();
        let file_type = entry.file_type()?;

        if let Err(err) = chown(&path, uid, gid) {
            log::warn!("chown failed for {}: {err}", path.display());
        }

        let name = entry.file_name();
        if let Some(lower) = lowercase_if_needed(&name) {
            let mut new_path = path.clone();
            new_path.set_file_name(&lower);
            match fs::rename(&path, &new_path) {
                Ok(()) => path = new_path,
                Err(err) => {
                    log::warn!("rename failed for {}: {err}", path.display());
                }
            }
        }

        if file_type.is_dir() {
            walk(&path, uid, gid)?;
        }
    }
    Ok(())
}

fn lowercase_if_needed(name: &std::ffi::OsStr) -> Option<OsString> {
    let bytes = name.as_bytes();
    if bytes.iter().any(u8::is_ascii_uppercase) {
        Some(OsString::from_vec(bytes.to_ascii_lowercase()))
    } else {
        None
    }
}

fn chown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
    if rc != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn renames_mixed_case_entries_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("Foo");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("BAR.txt"), b"hi").unwrap();

        let my_uid = unsafe { libc::getuid() };
        let my_gid = unsafe { libc::getgid() };
        run(dir.path(), my_uid, my_gid).unwrap();

        assert!(dir.path().join("foo").is_dir());
        assert!(dir.path().join("foo").join("bar.txt").exists());
        assert!(!dir.path().join("Foo").exists());
    }

    #[test]
    fn already_lower_case_entries_are_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plain.txt"), b"hi").unwrap();
        let my_uid = unsafe { libc::getuid() };
        let my_gid = unsafe { libc::getgid() };
        run(dir.path(), my_uid, my_gid).unwrap();
        let meta = fs::metadata(dir.path().join("plain.txt")).unwrap();
        assert_eq!(meta.uid(), my_uid);
    }
}
