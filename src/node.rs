//! The in-memory inode graph.
//!
//! Nodes are owned by a single [`NodeTable`] arena keyed by nodeid; a child
//! only ever references its parent (and vice versa) through that id, never
//! through a pointer, so the table stays a safe, ordinary `HashMap`.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};

use crate::abi::ROOT_ID;

/// Opaque 64-bit id surfaced to the kernel as the nodeid. Root is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(ROOT_ID);
}

impl From<u64> for NodeId {
    fn from(v: u64) -> Self {
        NodeId(v)
    }
}

impl From<NodeId> for u64 {
    fn from(v: NodeId) -> Self {
        v.0
    }
}

pub struct Node {
    pub id: NodeId,
    pub generation: u64,
    pub name: OsString,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub refcount: u32,
}

/// Refcount seeded on the root so that no realistic stream of FORGETs can
/// ever drive it to zero.
const ROOT_REFCOUNT: u32 = u32::MAX / 2;

pub struct NodeTable {
    nodes: HashMap<u64, Node>,
    next_nid: u64,
    next_gen: u64,
}

impl NodeTable {
    /// Creates the table with just the root node, whose `name` is the host
    /// directory path this filesystem re-exports.
    pub fn new(root_host_path: OsString) -> NodeTable {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node {
                id: NodeId::ROOT,
                generation: 0,
                name: root_host_path,
                parent: None,
                children: Vec::new(),
                refcount: ROOT_REFCOUNT,
            },
        );
        NodeTable {
            nodes,
            next_nid: 2,
            next_gen: 0,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id.0)
    }

    /// Find a direct child of `parent` by exact name, as already stored
    /// (case folding, if any, must already have been applied by the
    /// caller).
    pub fn lookup_child(&self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
        let parent = self.nodes.get(&parent.0)?;
        parent
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[&child.0].name == name)
    }

    /// Allocate a new node, link it as a child of `parent`, and bump
    /// `parent`'s refcount by one (the parent holds a reference for each
    /// live child). The new node's own refcount starts at zero; callers
    /// that are about to advertise it to the kernel (LOOKUP, MKNOD, MKDIR)
    /// bump it themselves right after.
    pub fn create_child(&mut self, parent: NodeId, name: OsString) -> NodeId {
        let id = NodeId(self.next_nid);
        let generation = self.next_gen;
        self.next_nid += 1;
        self.next_gen += 1;

        self.nodes.insert(
            id.0,
            Node {
                id,
                generation,
                name,
                parent: Some(parent),
                children: Vec::new(),
                refcount: 0,
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent.0) {
            p.children.push(id);
            p.refcount += 1;
        }
        id
    }

    pub fn bump(&mut self, id: NodeId, n: u32) {
        if let Some(node) = self.nodes.get_mut(&id.0) {
            node.refcount += n;
        }
    }

    pub fn rename(&mut self, id: NodeId, new_name: OsString) {
        if let Some(node) = self.nodes.get_mut(&id.0) {
            node.name = new_name;
        }
    }

    /// Unlink `child` from `parent.children` and decrement `parent`'s
    /// refcount by one (balancing the increment from [`create_child`]).
    /// Fails when `child` is not a direct child of `parent`.
    pub fn detach(&mut self, parent: NodeId, child: NodeId) -> Option<()> {
        let pos = {
            let p = self.nodes.get(&parent.0)?;
            p.children.iter().position(|&c| c == child)?
        };
        let p = self.nodes.get_mut(&parent.0).unwrap();
        p.children.remove(pos);
        p.refcount = p.refcount.saturating_sub(1);
        Some(())
    }

    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(&child.0) {
            node.parent = Some(parent);
        }
        if let Some(p) = self.nodes.get_mut(&parent.0) {
            p.children.push(child);
        }
    }

    /// Release `n` outstanding kernel references on `id`. When the refcount
    /// reaches zero the node is detached from its parent and freed, and the
    /// parent itself is released by one (cascading up the tree). The root
    /// is never freed: its refcount is seeded far out of FORGET's reach.
    pub fn release(&mut self, id: NodeId, n: u32) {
        let (refcount, parent) = match self.nodes.get_mut(&id.0) {
            Some(node) => {
                node.refcount = node.refcount.saturating_sub(n);
                (node.refcount, node.parent)
            }
            None => return,
        };
        if refcount != 0 {
            return;
        }
        let Some(parent) = parent else {
            // Root: never freed regardless of refcount.
            return;
        };
        self.detach(parent, id);
        self.nodes.remove(&id.0);
        self.release(parent, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> NodeTable {
        NodeTable::new(OsString::from("/srv/root"))
    }

    #[test]
    fn root_is_preseeded_and_unfreeable() {
        let mut t = table();
        assert!(t.get(NodeId::ROOT).is_some());
        t.release(NodeId::ROOT, u32::MAX);
        assert!(t.get(NodeId::ROOT).is_some());
    }

    #[test]
    fn create_child_bumps_parent_refcount() {
        let mut t = table();
        let before = t.get(NodeId::ROOT).unwrap().refcount;
        let child = t.create_child(NodeId::ROOT, OsString::from("a"));
        assert_eq!(t.get(NodeId::ROOT).unwrap().refcount, before + 1);
        assert_eq!(t.get(child).unwrap().refcount, 0);
        assert_eq!(t.lookup_child(NodeId::ROOT, OsStr::new("a")), Some(child));
    }

    #[test]
    fn lookup_forget_balanced_frees_node() {
        let mut t = table();
        let before = t.get(NodeId::ROOT).unwrap().refcount;
        let child = t.create_child(NodeId::ROOT, OsString::from("a"));
        t.bump(child, 3);
        t.release(child, 3);
        assert!(t.get(child).is_none());
        assert_eq!(t.get(NodeId::ROOT).unwrap().refcount, before);
        assert_eq!(t.lookup_child(NodeId::ROOT, OsStr::new("a")), None);
    }

    #[test]
    fn partial_forget_keeps_node_alive() {
        let mut t = table();
        let child = t.create_child(NodeId::ROOT, OsString::from("a"));
        t.bump(child, 2);
        t.release(child, 1);
        assert!(t.get(child).is_some());
    }

    #[test]
    fn interleaved_lookup_forget_frees_every_node() {
        let mut t = table();
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = t.create_child(NodeId::ROOT, OsString::from(format!("f{i}")));
            t.bump(id, 1);
            ids.push(id);
        }
        for i in 0..5 {
            t.bump(ids[i], 1);
        }
        for i in 0..5 {
            t.release(ids[i], 2);
        }
        for id in ids {
            assert!(t.get(id).is_none());
        }
        assert!(t.get(NodeId::ROOT).unwrap().children.is_empty());
    }

    #[test]
    fn rename_does_not_move_between_parents() {
        let mut t = table();
        let child = t.create_child(NodeId::ROOT, OsString::from("a"));
        t.rename(child, OsString::from("b"));
        assert_eq!(t.get(child).unwrap().name, OsStr::new("b"));
        assert_eq!(t.get(child).unwrap().parent, Some(NodeId::ROOT));
    }

    #[test]
    fn detach_then_attach_moves_node() {
        let mut t = table();
        let dir = t.create_child(NodeId::ROOT, OsString::from("dir"));
        t.bump(dir, 1);
        let child = t.create_child(NodeId::ROOT, OsString::from("a"));
        t.bump(child, 1);

        t.detach(NodeId::ROOT, child).unwrap();
        t.attach(dir, child);

        assert_eq!(t.get(child).unwrap().parent, Some(dir));
        assert_eq!(t.lookup_child(NodeId::ROOT, OsStr::new("a")), None);
        assert_eq!(t.lookup_child(dir, OsStr::new("a")), Some(child));
    }
}
