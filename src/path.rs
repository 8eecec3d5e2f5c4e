//! Reconstructing an absolute host path from a node plus an optional
//! trailing child name.
//!
//! The builder walks parent pointers root-ward and writes into the tail of
//! a caller-supplied buffer, mirroring the source's back-to-front
//! construction (it never has to know the final length up front).

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use crate::error::{Errno, OpResult};
use crate::node::{NodeId, NodeTable};

/// Minimum buffer size a caller must provide; chosen to match the source's
/// fixed-size stack buffer.
pub const PATH_BUFFER_SIZE: usize = 1024;

/// Build the absolute host path for `node`, optionally suffixed with
/// `extra` (an un-normalized child name). Returns `-EINVAL` if the result
/// would not fit in `PATH_BUFFER_SIZE` bytes.
pub fn build_path(
    nodes: &NodeTable,
    node: NodeId,
    extra: Option<&OsStr>,
    lower_case: bool,
) -> OpResult<Vec<u8>> {
    let mut buf = vec![0u8; PATH_BUFFER_SIZE];
    let mut cursor = buf.len();

    let mut push = |bytes: &[u8]| -> OpResult<()> {
        let needed = bytes.len() + 1; // +1 for the leading '/'
        if needed > cursor {
            return Err(Errno::EINVAL);
        }
        cursor -= bytes.len();
        buf[cursor..cursor + bytes.len()].copy_from_slice(bytes);
        cursor -= 1;
        buf[cursor] = b'/';
        Ok(())
    };

    if let Some(name) = extra {
        push(name.as_bytes())?;
    }

    let mut current = Some(node);
    while let Some(id) = current {
        let n = nodes.get(id).expect("dangling node reference");
        if id == NodeId::ROOT {
            // The root's stored name is the absolute backing directory
            // path; it supplies its own leading content, not a single
            // component, so splice it in directly instead of treating it
            // like a path segment.
            let root_bytes = n.name.as_os_str().as_bytes();
            if root_bytes.len() > cursor {
                return Err(Errno::EINVAL);
            }
            cursor -= root_bytes.len();
            buf[cursor..cursor + root_bytes.len()].copy_from_slice(root_bytes);
            break;
        }
        push(n.name.as_os_str().as_bytes())?;
        current = n.parent;
    }

    let mut result = buf[cursor..].to_vec();
    if lower_case {
        for byte in &mut result {
            if byte.is_ascii_uppercase() {
                *byte = byte.to_ascii_lowercase();
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn root_path_with_no_extra() {
        let nodes = NodeTable::new(OsString::from("/srv/root"));
        let p = build_path(&nodes, NodeId::ROOT, None, false).unwrap();
        assert_eq!(p, b"/srv/root");
    }

    #[test]
    fn root_path_with_child_name() {
        let nodes = NodeTable::new(OsString::from("/srv/root"));
        let p = build_path(&nodes, NodeId::ROOT, Some(OsStr::new("FILE")), false).unwrap();
        assert_eq!(p, b"/srv/root/FILE");
    }

    #[test]
    fn nested_path_and_lower_case_folding() {
        let mut nodes = NodeTable::new(OsString::from("/srv/root"));
        let dir = nodes.create_child(NodeId::ROOT, OsString::from("Dir"));
        let p = build_path(&nodes, dir, Some(OsStr::new("Leaf.TXT")), true).unwrap();
        assert_eq!(p, b"/srv/root/dir/leaf.txt");
    }

    #[test]
    fn oversized_path_is_rejected() {
        let nodes = NodeTable::new(OsString::from("/srv/root"));
        let long_name = "x".repeat(PATH_BUFFER_SIZE);
        let err = build_path(&nodes, NodeId::ROOT, Some(OsStr::new(&long_name)), false)
            .unwrap_err();
        assert_eq!(err, Errno::EINVAL);
    }
}
