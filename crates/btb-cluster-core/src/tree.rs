use crate::animal::{BadgerId, CowId};
use std::collections::BTreeMap;

/// A node in the infection ancestry: the synthetic root, a cow or a badger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Node {
    Root,
    Cow(CowId),
    Badger(BadgerId),
}

/// Directed infection ancestry rooted at a synthetic node.
///
/// Removing a node reparents its children onto the node's parent, so every
/// surviving descendant stays reachable from the root.
#[derive(Clone, Debug, Default)]
pub struct InfectionTree {
    parent: BTreeMap<Node, Node>,
    children: BTreeMap<Node, Vec<Node>>,
}

impl InfectionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `child` under `parent`. The parent must be the root or already
    /// present in the tree.
    pub fn insert(&mut self, child: Node, parent: Node) {
        debug_assert!(
            parent == Node::Root || self.parent.contains_key(&parent),
            "parent must be present in the tree"
        );
        self.parent.insert(child, parent);
        self.children.entry(parent).or_default().push(child);
    }

    pub fn contains(&self, node: Node) -> bool {
        node == Node::Root || self.parent.contains_key(&node)
    }

    pub fn parent_of(&self, node: Node) -> Option<Node> {
        self.parent.get(&node).copied()
    }

    pub fn children_of(&self, node: Node) -> &[Node] {
        self.children.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Detach `node`, reparenting its children onto the node's parent.
    pub fn remove(&mut self, node: Node) {
        let Some(parent) = self.parent.remove(&node) else {
            return;
        };
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|&c| c != node);
        }
        if let Some(orphans) = self.children.remove(&node) {
            for orphan in &orphans {
                self.parent.insert(*orphan, parent);
            }
            self.children.entry(parent).or_default().extend(orphans);
        }
    }

    /// All cow nodes currently in the tree, in id order.
    pub fn cows(&self) -> impl Iterator<Item = CowId> + '_ {
        self.parent.keys().filter_map(|node| match node {
            Node::Cow(id) => Some(*id),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}
