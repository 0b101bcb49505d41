// SPDX-License-Identifier: CEPL-1.0
//! Ownership tree of game allocations.
//!
//! Each node is either an independent allocation, released on its own, or an
//! internal sub-range of its parent that goes away with the parent. Release
//! walks leaves-first.

use bitflags::bitflags;
use tracing::trace;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        /// Not preserved across save/load.
        const TEMP = 0b01;
        /// Lives inside the parent's allocation; never released separately.
        const INTERNAL = 0b10;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug)]
pub struct MemNode {
    pub label: &'static str,
    pub size: usize,
    pub flags: MemFlags,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    released: bool,
}

impl MemNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemTree {
    nodes: Vec<MemNode>,
}

impl MemTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, label: &'static str, size: usize, flags: MemFlags) -> NodeId {
        self.push(label, size, flags, None)
    }

    /// Internal children must fit inside whatever the parent has not already
    /// handed to other internal children.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        label: &'static str,
        size: usize,
        flags: MemFlags,
    ) -> Option<NodeId> {
        let p = self.nodes.get(parent.0)?;
        if flags.contains(MemFlags::INTERNAL) {
            let carved: usize = p
                .children
                .iter()
                .map(|&c| &self.nodes[c.0])
                .filter(|n| n.flags.contains(MemFlags::INTERNAL))
                .map(|n| n.size)
                .sum();
            if carved + size > p.size {
                return None;
            }
        }
        let id = self.push(label, size, flags, Some(parent));
        self.nodes[parent.0].children.push(id);
        Some(id)
    }

    fn push(
        &mut self,
        label: &'static str,
        size: usize,
        flags: MemFlags,
        parent: Option<NodeId>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(MemNode {
            label,
            size,
            flags,
            parent,
            children: Vec::new(),
            released: false,
        });
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&MemNode> {
        self.nodes.get(id.0)
    }

    /// Bytes owned by independent allocations under (and including) `id`.
    pub fn owned_bytes(&self, id: NodeId) -> usize {
        let Some(node) = self.nodes.get(id.0) else {
            return 0;
        };
        let own = if node.flags.contains(MemFlags::INTERNAL) {
            0
        } else {
            node.size
        };
        own + node
            .children
            .iter()
            .map(|&c| self.owned_bytes(c))
            .sum::<usize>()
    }

    /// Releases `id` and everything beneath it. Returns the independent
    /// allocations in the order they were freed; internal nodes are marked
    /// released along with their parent but never appear in the list.
    pub fn release(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        self.release_into(id, &mut order);
        order
    }

    fn release_into(&mut self, id: NodeId, order: &mut Vec<NodeId>) {
        let Some(node) = self.nodes.get(id.0) else {
            return;
        };
        if node.released {
            return;
        }
        let children = node.children.clone();
        for child in children {
            if self.nodes[child.0].flags.contains(MemFlags::INTERNAL) {
                // Freed with us; its own children still own storage.
                let grandchildren = self.nodes[child.0].children.clone();
                for g in grandchildren {
                    self.release_into(g, order);
                }
                self.nodes[child.0].released = true;
            } else {
                self.release_into(child, order);
            }
        }
        let node = &mut self.nodes[id.0];
        node.released = true;
        if !node.flags.contains(MemFlags::INTERNAL) {
            trace!(label = node.label, size = node.size, "release");
            order.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game_layout() -> (MemTree, NodeId, NodeId, NodeId) {
        let mut t = MemTree::new();
        let root = t.add_root("game", 4096, MemFlags::empty());
        let stack = t
            .add_child(root, "stack", 3072, MemFlags::INTERNAL)
            .unwrap();
        let temp = t.add_child(root, "temp", 1024, MemFlags::TEMP).unwrap();
        (t, root, stack, temp)
    }

    #[test]
    fn release_is_leaves_first_and_skips_internal() {
        let (mut t, root, stack, temp) = game_layout();
        let order = t.release(root);
        assert_eq!(order, vec![temp, root]);
        assert!(t.get(stack).unwrap().is_released());
        assert!(t.get(root).unwrap().is_released());
    }

    #[test]
    fn release_twice_frees_nothing_new() {
        let (mut t, root, _, _) = game_layout();
        let _ = t.release(root);
        assert!(t.release(root).is_empty());
    }

    #[test]
    fn independent_children_of_internal_nodes_are_still_released() {
        let (mut t, root, stack, temp) = game_layout();
        let nested = t.add_child(stack, "nested", 64, MemFlags::empty()).unwrap();
        let order = t.release(root);
        assert_eq!(order, vec![nested, temp, root]);
    }

    #[test]
    fn internal_children_cannot_exceed_parent() {
        let (mut t, root, _, _) = game_layout();
        assert!(t.add_child(root, "too-big", 2048, MemFlags::INTERNAL).is_none());
        assert!(t.add_child(root, "fits", 1024, MemFlags::INTERNAL).is_some());
    }

    #[test]
    fn owned_bytes_ignores_internal_ranges() {
        let (t, root, _, _) = game_layout();
        assert_eq!(t.owned_bytes(root), 4096 + 1024);
    }
}
