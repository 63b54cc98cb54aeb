//! The in-memory zone database: one [`crate::nametree::NameTree`] shared by
//! every configured zone, plus per-zone metadata (spec.md §3 "Zone").

use std::collections::HashMap;

use bytes::Bytes;

use crate::nametree::{NameTree, NodeId, StoredName};

#[derive(Debug, Clone, Default)]
pub struct ZoneMeta {
    pub apex: NodeId,
    pub number: u32,
    pub soa_rrset: Option<NodeId>,
    pub ns_rrset: Option<NodeId>,
    pub is_secure: bool,
    pub nsec3_apex: Option<NodeId>,
    pub nsec3_last: Option<NodeId>,
}

/// The compiled database: a single name tree, indexed additionally by
/// zone. Zones are created at configuration load and destroyed on
/// `delzone`, independent of node lifetimes in the shared tree.
#[derive(Debug)]
pub struct Database {
    pub tree: NameTree,
    zones: Vec<ZoneMeta>,
    zone_names: Vec<StoredName>,
    by_apex: HashMap<Bytes, u32>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            tree: NameTree::new(),
            zones: Vec::new(),
            zone_names: Vec::new(),
            by_apex: HashMap::new(),
        }
    }

    /// Creates a zone at `apex_name`, returning its zone number. Idempotent
    /// for an already-configured apex.
    pub fn add_zone(&mut self, apex_name: &StoredName) -> u32 {
        let key = apex_name.to_bytes();
        if let Some(&n) = self.by_apex.get(&key) {
            return n;
        }
        let apex = self.tree.insert(apex_name);
        self.tree.node_mut(apex).is_apex = true;
        let number = self.zones.len() as u32;
        self.zones.push(ZoneMeta {
            apex,
            number,
            ..Default::default()
        });
        self.zone_names.push(apex_name.clone());
        self.by_apex.insert(key, number);
        number
    }

    pub fn delzone(&mut self, apex_name: &StoredName) {
        if let Some(&n) = self.by_apex.get(&apex_name.to_bytes()) {
            // Zone metadata is tombstoned rather than compacted: zone
            // numbers must stay stable references for any in-flight
            // transfer state keyed by them.
            self.zones[n as usize] = ZoneMeta::default();
            self.by_apex.remove(&apex_name.to_bytes());
        }
    }

    pub fn zone_number(&self, apex_name: &StoredName) -> Option<u32> {
        self.by_apex.get(&apex_name.to_bytes()).copied()
    }

    pub fn zone(&self, number: u32) -> &ZoneMeta {
        &self.zones[number as usize]
    }

    pub fn zone_mut(&mut self, number: u32) -> &mut ZoneMeta {
        &mut self.zones[number as usize]
    }

    pub fn zone_names(&self) -> &[StoredName] {
        &self.zone_names
    }

    pub fn zones(&self) -> impl Iterator<Item = (u32, &ZoneMeta)> {
        self.zones.iter().enumerate().map(|(i, z)| (i as u32, z))
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
