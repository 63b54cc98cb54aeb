//! Per-node RRset storage.
//!
//! An RR's rdata is kept as a fully typed [`domain::rdata::ZoneRecordData`]
//! rather than hand-rolled atoms: `domain` already carries the type
//! descriptor table (wire layout, compressible-name positions, max field
//! counts) the compiler and query engine both need, so there is nothing to
//! gain by re-deriving it. "Domain reference" vs. "opaque blob" atoms from
//! spec.md §3 correspond to `ZoneRecordData` variants that embed a `Name`
//! (NS, CNAME, MX, SOA, ...) vs. ones that are plain bytes (A, TXT, ...).

use bytes::Bytes;
use domain::base::{Rtype, Ttl};
use domain::rdata::ZoneRecordData;

pub type StoredName = domain::base::Name<Bytes>;
pub type StoredRecordData = ZoneRecordData<Bytes, StoredName>;

/// One RRset, scoped to a single zone, living on a single name-tree node.
#[derive(Debug, Clone)]
pub struct RrsetEntry {
    pub zone_number: u32,
    pub rtype: Rtype,
    pub ttl: Ttl,
    pub rrs: Vec<StoredRecordData>,
}

impl RrsetEntry {
    pub fn new(zone_number: u32, rtype: Rtype, ttl: Ttl) -> Self {
        RrsetEntry {
            zone_number,
            rtype,
            ttl,
            rrs: Vec::new(),
        }
    }

    /// Appends `rr` unless byte-identical to an existing member (duplicate
    /// RRs within an RRset are dropped silently per spec.md §4.2).
    pub fn push_dedup(&mut self, rr: StoredRecordData) {
        if !self.rrs.contains(&rr) {
            self.rrs.push(rr);
        }
    }

    pub fn len(&self) -> usize {
        self.rrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::rdata::A;
    use std::net::Ipv4Addr;

    #[test]
    fn dedup_drops_identical_rrs() {
        let mut set = RrsetEntry::new(0, Rtype::A, Ttl::from_secs(300));
        let rr = ZoneRecordData::A(A::new(Ipv4Addr::new(10, 0, 0, 1)));
        set.push_dedup(rr.clone());
        set.push_dedup(rr);
        assert_eq!(set.len(), 1);
    }
}
