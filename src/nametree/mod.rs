//! The name tree: an ordered, slab-backed index from domain name to node.
//!
//! Nodes are never freed individually (the usual arena trap with cyclic
//! parent/child pointers); instead a deleted node is swapped to the tail of
//! insertion order and the slab is truncated, which keeps `Node::number`
//! dense as required by the persistence format.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use bytes::Bytes;
use domain::base::name::Name;
use domain::base::CanonicalOrd;

use crate::rrstore::RrsetEntry;

pub type StoredName = Name<Bytes>;
pub type NodeId = u32;

const ROOT_ID: NodeId = 0;

/// NSEC3 denial links, populated by the `denial` module for signed zones.
#[derive(Debug, Clone, Default)]
pub struct Nsec3Links {
    pub cover: Option<NodeId>,
    pub wcard_child_cover: Option<NodeId>,
    pub ds_parent_cover: Option<NodeId>,
    pub exact: Option<NodeId>,
}

#[derive(Debug)]
pub struct Node {
    pub name: StoredName,
    pub parent: Option<NodeId>,
    /// The closest-match wildcard child: the greatest child name <= `*` at
    /// this level, or `self` when there are no children yet.
    pub wildcard_child_closest_match: NodeId,
    pub rrsets: Vec<RrsetEntry>,
    pub is_existing: bool,
    pub is_apex: bool,
    pub number: u32,
    pub nsec3: Nsec3Links,
    /// Insertion-order links used to keep `number` dense on delete.
    prev_in_order: Option<NodeId>,
    next_in_order: Option<NodeId>,
}

impl Node {
    fn new(name: StoredName, parent: Option<NodeId>, id: NodeId) -> Self {
        Node {
            name,
            parent,
            wildcard_child_closest_match: id,
            rrsets: Vec::new(),
            is_existing: false,
            is_apex: false,
            number: id,
            nsec3: Nsec3Links::default(),
            prev_in_order: None,
            next_in_order: None,
        }
    }
}

/// An ordered, owning index of [`Node`]s keyed by canonical DNS name.
///
/// Canonical order here is label-reversed, case-insensitive comparison, the
/// same order `domain::base::CanonicalOrd` gives for `Name`. We keep a
/// `BTreeMap` from the canonical key to slab index rather than reimplement
/// a balanced tree by hand: the invariants spec.md cares about (predecessor
/// lookup, closest encloser, wildcard closest match) are about the *order*,
/// not the data structure backing it.
#[derive(Debug)]
pub struct NameTree {
    slab: Vec<Node>,
    by_name: BTreeMap<CanonicalKey, NodeId>,
    order_head: Option<NodeId>,
    order_tail: Option<NodeId>,
}

/// Wrapper giving `Name<Bytes>` the canonical (label-reversed,
/// case-insensitive) ordering `BTreeMap` needs, instead of its `Ord`
/// impl's left-to-right label order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CanonicalKey(StoredName);

impl PartialOrd for CanonicalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.canonical_cmp(&other.0)
    }
}

pub struct SearchResult {
    pub exact: bool,
    pub closest_match: NodeId,
    pub closest_encloser: NodeId,
}

impl NameTree {
    pub fn new() -> Self {
        let root = Node::new(StoredName::root(), None, ROOT_ID);
        let mut by_name = BTreeMap::new();
        by_name.insert(CanonicalKey(StoredName::root()), ROOT_ID);
        NameTree {
            slab: vec![root],
            by_name,
            order_head: Some(ROOT_ID),
            order_tail: Some(ROOT_ID),
        }
    }

    pub fn root(&self) -> NodeId {
        ROOT_ID
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.slab[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.slab[id as usize]
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slab.iter().enumerate().map(|(i, n)| (i as NodeId, n))
    }

    fn find_exact(&self, name: &StoredName) -> Option<NodeId> {
        self.by_name.get(&CanonicalKey(name.clone())).copied()
    }

    /// Returns the canonical predecessor of `name`: the greatest existing
    /// name strictly less than `name`, or the tree maximum if `name` sorts
    /// before everything (wrap-around, mirrored by NSEC3 in `denial`).
    fn predecessor(&self, name: &StoredName) -> NodeId {
        let key = CanonicalKey(name.clone());
        match self.by_name.range(..key).next_back() {
            Some((_, &id)) => id,
            None => *self.by_name.values().next_back().unwrap(),
        }
    }

    /// insert(name): create all missing ancestors up to the root in one
    /// pass, returning the node for `name`.
    pub fn insert(&mut self, name: &StoredName) -> NodeId {
        if let Some(id) = self.find_exact(name) {
            return id;
        }

        // Walk from the full name down to the root, creating every missing
        // ancestor, then splice the chain together child-to-parent.
        let mut chain = Vec::new();
        let mut cur = name.clone();
        loop {
            if let Some(id) = self.find_exact(&cur) {
                chain.push(Ok(id));
                break;
            }
            chain.push(Err(cur.clone()));
            if cur.is_root() {
                break;
            }
            cur = cur.parent().unwrap().to_name();
        }

        // chain is ordered from `name` up to the first existing ancestor
        // (or the root); build parents first.
        let mut parent_id = match chain.last().unwrap() {
            Ok(id) => *id,
            Err(_) => unreachable!("root always exists"),
        };
        for entry in chain.into_iter().rev().skip(1) {
            let Err(new_name) = entry else { continue };
            let id = self.alloc_node(new_name, parent_id);
            self.link_order_tail(id);
            self.update_wildcard_match(parent_id, id);
            parent_id = id;
        }
        parent_id
    }

    fn alloc_node(&mut self, name: StoredName, parent: NodeId) -> NodeId {
        let id = self.slab.len() as NodeId;
        self.slab.push(Node::new(name.clone(), Some(parent), id));
        self.by_name.insert(CanonicalKey(name), id);
        id
    }

    fn link_order_tail(&mut self, id: NodeId) {
        if let Some(tail) = self.order_tail {
            self.node_mut(tail).next_in_order = Some(id);
            self.node_mut(id).prev_in_order = Some(tail);
        }
        self.order_tail = Some(id);
    }

    /// (c) wildcard_child_closest_match is the greatest child name <= `*`
    /// at that level; update it on insertion of `new_child` under `parent`.
    fn update_wildcard_match(&mut self, parent: NodeId, new_child: NodeId) {
        let wildcard_owner = {
            let parent_name = &self.node(parent).name;
            StoredName::bytes_from_str("*").unwrap().chain(parent_name.clone()).unwrap().to_bytes()
        };
        let child_name = self.node(new_child).name.clone();
        if child_name.canonical_cmp(&wildcard_owner) != Ordering::Greater {
            let current = self.node(parent).wildcard_child_closest_match;
            let replace = if current == parent {
                true
            } else {
                let current_name = self.node(current).name.clone();
                child_name.canonical_cmp(&current_name) == Ordering::Greater
            };
            if replace {
                self.node_mut(parent).wildcard_child_closest_match = new_child;
            }
        }
    }

    /// search(name): returns (exact, closest_match, closest_encloser).
    pub fn search(&self, name: &StoredName) -> SearchResult {
        if let Some(id) = self.find_exact(name) {
            return SearchResult {
                exact: true,
                closest_match: id,
                closest_encloser: id,
            };
        }

        let closest_match = self.predecessor(name);
        let encloser = self.closest_encloser_from(closest_match, name);
        SearchResult {
            exact: false,
            closest_match,
            closest_encloser: encloser,
        }
    }

    /// Walk up from `start` until its label count <= the number of labels
    /// `start` shares with `name`, i.e. until it is a proper ancestor.
    fn closest_encloser_from(&self, start: NodeId, name: &StoredName) -> NodeId {
        let mut cur = start;
        loop {
            let cur_name = &self.node(cur).name;
            if name.ends_with(cur_name) {
                return cur;
            }
            match self.node(cur).parent {
                Some(p) => cur = p,
                None => return cur,
            }
        }
    }

    pub fn add_rrset(&mut self, id: NodeId, entry: RrsetEntry) {
        self.node_mut(id).rrsets.push(entry);
        self.mark_existing(id);
    }

    fn mark_existing(&mut self, id: NodeId) {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if self.node(c).is_existing {
                break;
            }
            self.node_mut(c).is_existing = true;
            cur = self.node(c).parent;
        }
    }

    pub fn find_rrset(
        &self,
        id: NodeId,
        zone_number: u32,
        rtype: domain::base::Rtype,
    ) -> Option<&RrsetEntry> {
        self.node(id)
            .rrsets
            .iter()
            .find(|r| r.zone_number == zone_number && r.rtype == rtype)
    }

    /// Whether `id` may be deleted: no RRsets, no usage, and its canonical
    /// successor is not a proper subdomain (i.e. no existing descendants).
    fn domain_can_be_deleted(&self, id: NodeId, usage: u32) -> bool {
        if !self.node(id).rrsets.is_empty() || usage > 0 {
            return false;
        }
        let name = self.node(id).name.clone();
        let key = CanonicalKey(name.clone());
        if let Some((succ_key, _)) = self.by_name.range(key..).nth(1) {
            if succ_key.0.ends_with(&name) {
                return false;
            }
        }
        true
    }

    /// delete(node): cascade upward while `domain_can_be_deleted` holds.
    pub fn delete(&mut self, mut id: NodeId, usage_of: impl Fn(NodeId) -> u32) {
        while id != ROOT_ID && self.domain_can_be_deleted(id, usage_of(id)) {
            let parent = self.node(id).parent.unwrap();
            self.unlink(id);
            id = parent;
        }
    }

    fn unlink(&mut self, id: NodeId) {
        let name = self.node(id).name.clone();
        self.by_name.remove(&CanonicalKey(name));

        // Splice out of insertion order, then swap the tail element into
        // this slot to keep `number` dense.
        let prev = self.node(id).prev_in_order;
        let next = self.node(id).next_in_order;
        match prev {
            Some(p) => self.node_mut(p).next_in_order = next,
            None => self.order_head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev_in_order = prev,
            None => self.order_tail = prev,
        }

        let last = (self.slab.len() - 1) as NodeId;
        if id != last {
            self.swap_remove_slot(id, last);
        }
        self.slab.pop();
    }

    fn swap_remove_slot(&mut self, id: NodeId, last: NodeId) {
        self.slab.swap(id as usize, last as usize);
        self.node_mut(id).number = id;

        // Fix every reference the moved node is a target of.
        let name = self.node(id).name.clone();
        self.by_name.insert(CanonicalKey(name), id);

        let (parent, prev, next) = {
            let n = self.node(id);
            (n.parent, n.prev_in_order, n.next_in_order)
        };
        if let Some(p) = prev {
            self.node_mut(p).next_in_order = Some(id);
        } else {
            self.order_head = Some(id);
        }
        if let Some(n) = next {
            self.node_mut(n).prev_in_order = Some(id);
        } else {
            self.order_tail = Some(id);
        }
        let _ = parent;

        for i in 0..self.slab.len() {
            let n = &mut self.slab[i];
            if n.parent == Some(last) {
                n.parent = Some(id);
            }
            if n.wildcard_child_closest_match == last {
                n.wildcard_child_closest_match = id;
            }
        }
    }
}

impl Default for NameTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> StoredName {
        StoredName::bytes_from_str(s).unwrap()
    }

    #[test]
    fn insert_creates_ancestors() {
        let mut tree = NameTree::new();
        let id = tree.insert(&name("www.example.com."));
        assert_eq!(tree.node(id).name, name("www.example.com."));
        let parent = tree.node(id).parent.unwrap();
        assert_eq!(tree.node(parent).name, name("example.com."));
        let grandparent = tree.node(parent).parent.unwrap();
        assert_eq!(tree.node(grandparent).name, name("com."));
        assert_eq!(tree.node(grandparent).parent, Some(tree.root()));
    }

    #[test]
    fn insert_is_idempotent() {
        let mut tree = NameTree::new();
        let a = tree.insert(&name("example.com."));
        let b = tree.insert(&name("example.com."));
        assert_eq!(a, b);
        assert_eq!(tree.len(), 3); // root, com., example.com.
    }

    #[test]
    fn search_closest_encloser() {
        let mut tree = NameTree::new();
        tree.insert(&name("example.com."));
        let r = tree.search(&name("nope.example.com."));
        assert!(!r.exact);
        assert_eq!(tree.node(r.closest_encloser).name, name("example.com."));
    }

    #[test]
    fn search_exact_match() {
        let mut tree = NameTree::new();
        let id = tree.insert(&name("example.com."));
        let r = tree.search(&name("example.com."));
        assert!(r.exact);
        assert_eq!(r.closest_match, id);
    }

    #[test]
    fn wildcard_closest_match_tracks_greatest_child_leq_star() {
        let mut tree = NameTree::new();
        let apex = tree.insert(&name("wild.example."));
        assert_eq!(tree.node(apex).wildcard_child_closest_match, apex);

        let star = tree.insert(&name("*.wild.example."));
        assert_eq!(tree.node(apex).wildcard_child_closest_match, star);

        // a name greater than '*' must not replace the match.
        tree.insert(&name("zzz.wild.example."));
        assert_eq!(tree.node(apex).wildcard_child_closest_match, star);
    }

    #[test]
    fn delete_cascades_while_deletable() {
        let mut tree = NameTree::new();
        let leaf = tree.insert(&name("a.b.example."));
        let before = tree.len();
        tree.delete(leaf, |_| 0);
        assert!(tree.len() < before);
        // example. still exists as an ancestor structure only if nothing
        // references it; here the whole chain collapses to the root.
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn delete_stops_at_existing_descendant() {
        let mut tree = NameTree::new();
        let mid = tree.insert(&name("b.example."));
        let leaf = tree.insert(&name("a.b.example."));
        let sibling = tree.insert(&name("c.b.example."));
        tree.add_rrset(
            sibling,
            RrsetEntry::new(0, domain::base::Rtype::A, domain::base::Ttl::from_secs(300)),
        );

        // mid has another existing descendant (the sibling, which carries
        // an RRset), so deleting the unrelated leaf must not cascade past
        // mid even though mid itself carries no RRsets.
        tree.delete(leaf, |_| 0);
        assert!(tree.find_exact(&name("b.example.")).is_some());
        assert!(tree.find_exact(&name("c.b.example.")).is_some());
        let _ = mid;
    }
}
