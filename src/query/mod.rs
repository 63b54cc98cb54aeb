//! The query engine (spec.md §4.4).
//!
//! Unlike the compiler, which leans on `domain::zonefile` for grammar, the
//! engine here walks our own [`crate::nametree::NameTree`] directly: the
//! five name-resolution cases, the wildcard rewrite and the truncation
//! ordering are all spec-specific control flow that has no equivalent to
//! delegate to. Wire encoding and name compression still are delegated, to
//! `domain::base::MessageBuilder` — reimplementing a compression table
//! would just be redoing what the teacher's dependency already does well.

use bytes::Bytes;
use domain::base::iana::{Class, Opcode, Rcode};
use domain::base::message_builder::{AdditionalBuilder, AnswerBuilder};
use domain::base::name::{ToLabelIter, ToName};
use domain::base::{Message, Rtype, Ttl};
use domain::rdata::ZoneRecordData;

use crate::database::Database;
use crate::nametree::{NodeId, StoredName};
use crate::rrstore::RrsetEntry;

/// Maximum compression-pointer chase depth (spec.md §4.4.6): defuses a
/// crafted message that chains pointers into a cycle or very long walk.
pub const MAX_COMPRESSION_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Answered,
    Refused,
    FormErr,
    NotImp,
}

/// Runs the sanity + classify steps of spec.md §4.4 (1)-(2) against a
/// parsed incoming message. Does not look at any zone data.
pub fn sanity_and_classify(msg: &Message<Vec<u8>>) -> Result<(), Verdict> {
    let header = msg.header();
    if header.qr() {
        return Err(Verdict::FormErr);
    }
    if header.opcode() != Opcode::QUERY {
        return Err(Verdict::NotImp);
    }
    let counts = msg.header_counts();
    if counts.ancount() > 0 || counts.nscount() > 0 {
        return Err(Verdict::FormErr);
    }
    if counts.arcount() > 1 {
        return Err(Verdict::FormErr);
    }
    if counts.qdcount() != 1 {
        return Err(Verdict::FormErr);
    }

    let question = msg.sole_question().map_err(|_| Verdict::FormErr)?;
    if question.qname().to_bytes().len() > 255 {
        return Err(Verdict::FormErr);
    }

    match question.qtype() {
        Rtype::AXFR | Rtype::IXFR => {
            // UDP AXFR/IXFR is FORMERR; TCP is handled by the transfer
            // serving path (src/xfr), never reaches here over TCP.
            return Err(Verdict::FormErr);
        }
        _ => {}
    }
    match question.qclass() {
        Class::IN | Class::ANY => {}
        _ => return Err(Verdict::Refused),
    }

    Ok(())
}

/// Finds the longest-suffix zone apex that is a proper ancestor of (or
/// equal to) `qname`. Spec.md §4.4 (3).
pub fn resolve_zone(db: &Database, qname: &StoredName) -> Option<u32> {
    db.zones()
        .filter(|(_, z)| qname.ends_with(&db.tree.node(z.apex).name))
        .max_by_key(|(_, z)| db.tree.node(z.apex).name.label_count())
        .map(|(n, _)| n)
}

pub enum Resolution {
    /// Exact owner match with the requested type present.
    Answer(NodeId),
    /// Exact owner match, but the type is CNAME and the query asked for
    /// something else: the caller should follow the chain.
    Cname(NodeId),
    /// Exact owner match, type absent (NODATA).
    NoData(NodeId),
    /// A non-apex ancestor carries an NS RRset: delegation.
    Delegation(NodeId),
    /// No such name, but a wildcard exists at the closest encloser.
    Wildcard(NodeId),
    /// No such name, no applicable wildcard.
    NxDomain(NodeId),
}

/// Name resolution, spec.md §4.4 (4): walks CNAME chains internally is
/// left to the caller (each step calls `resolve` again on the target).
pub fn resolve(db: &Database, zone_number: u32, qname: &StoredName, qtype: Rtype) -> Resolution {
    // A delegation above the qname takes priority over exact match logic:
    // walk from the zone apex down, stopping at the first non-apex node
    // that owns NS, if it's a proper ancestor of qname.
    if let Some(deleg) = find_delegation(db, zone_number, qname) {
        return Resolution::Delegation(deleg);
    }

    let search = db.tree.search(qname);
    if search.exact {
        let node = search.closest_match;
        if !db.tree.node(node).is_existing {
            return nxdomain_or_wildcard(db, zone_number, search.closest_encloser, qname);
        }
        if qtype != Rtype::CNAME
            && db
                .tree
                .find_rrset(node, zone_number, Rtype::CNAME)
                .is_some()
        {
            return Resolution::Cname(node);
        }
        if qtype == Rtype::ANY {
            return Resolution::Answer(node);
        }
        return match db.tree.find_rrset(node, zone_number, qtype) {
            Some(_) => Resolution::Answer(node),
            None => Resolution::NoData(node),
        };
    }

    nxdomain_or_wildcard(db, zone_number, search.closest_encloser, qname)
}

fn nxdomain_or_wildcard(
    db: &Database,
    _zone_number: u32,
    closest_encloser: NodeId,
    _qname: &StoredName,
) -> Resolution {
    let wcard = db.tree.node(closest_encloser).wildcard_child_closest_match;
    if wcard != closest_encloser {
        let wcard_name = &db.tree.node(wcard).name;
        let is_wildcard = wcard_name
            .iter_labels()
            .next()
            .map(|l| l.as_slice() == b"*")
            .unwrap_or(false);
        if is_wildcard && db.tree.node(wcard).is_existing {
            return Resolution::Wildcard(wcard);
        }
    }
    Resolution::NxDomain(closest_encloser)
}

/// Walks from `qname` up to (but not including) the zone apex looking for
/// the first ancestor that carries an NS RRset: a delegation point.
fn find_delegation(db: &Database, zone_number: u32, qname: &StoredName) -> Option<NodeId> {
    let apex = db.zone(zone_number).apex;
    let mut cur = db.tree.search(qname).closest_encloser;
    loop {
        if cur == apex {
            return None;
        }
        if db.tree.find_rrset(cur, zone_number, Rtype::NS).is_some() {
            return Some(cur);
        }
        cur = db.tree.node(cur).parent?;
    }
}

/// Assembles the wire-format reply for a resolved query, following spec.md
/// §4.4 (4)-(8). `builder` already has the request's header/id/question
/// copied in (the teacher's `mk_builder_for_target` + `start_answer`
/// pattern), this just fills sections and sets flags.
pub struct ReplyPlan {
    pub rcode: Rcode,
    pub aa: bool,
    pub answer: Vec<(StoredName, Ttl, ZoneRecordData<Bytes, StoredName>)>,
    pub authority: Vec<(StoredName, Ttl, ZoneRecordData<Bytes, StoredName>)>,
    pub additional: Vec<(StoredName, Ttl, ZoneRecordData<Bytes, StoredName>)>,
}

impl ReplyPlan {
    fn empty(rcode: Rcode, aa: bool) -> Self {
        ReplyPlan {
            rcode,
            aa,
            answer: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }
}

fn rrset_triples(
    db: &Database,
    owner: &StoredName,
    entry: &RrsetEntry,
) -> Vec<(StoredName, Ttl, ZoneRecordData<Bytes, StoredName>)> {
    let _ = db;
    entry
        .rrs
        .iter()
        .map(|rd| (owner.clone(), entry.ttl, rd.clone()))
        .collect()
}

/// Builds glue (A/AAAA within this zone) for the NS names of a delegation.
fn glue_for_delegation(
    db: &Database,
    zone_number: u32,
    deleg: NodeId,
) -> Vec<(StoredName, Ttl, ZoneRecordData<Bytes, StoredName>)> {
    let mut out = Vec::new();
    let Some(ns_set) = db.tree.find_rrset(deleg, zone_number, Rtype::NS) else {
        return out;
    };
    for rr in &ns_set.rrs {
        let ZoneRecordData::Ns(ns) = rr else { continue };
        let target = ns.nsdname();
        if !target.ends_with(&db.tree.node(db.zone(zone_number).apex).name) {
            continue;
        }
        let search = db.tree.search(target);
        if !search.exact {
            continue;
        }
        for rtype in [Rtype::A, Rtype::AAAA] {
            if let Some(set) = db.tree.find_rrset(search.closest_match, zone_number, rtype) {
                out.extend(rrset_triples(db, target, set));
            }
        }
    }
    out
}

/// Builds the reply plan for a fully resolved (post-CNAME-chase) query.
pub fn build_plan(
    db: &Database,
    zone_number: u32,
    qname: &StoredName,
    qtype: Rtype,
    resolution: &Resolution,
) -> ReplyPlan {
    match resolution {
        Resolution::Answer(node) => {
            let mut plan = ReplyPlan::empty(Rcode::NOERROR, true);
            if qtype == Rtype::ANY {
                for set in &db.tree.node(*node).rrsets {
                    if set.zone_number == zone_number {
                        plan.answer.extend(rrset_triples(db, qname, set));
                    }
                }
            } else if let Some(set) = db.tree.find_rrset(*node, zone_number, qtype) {
                plan.answer.extend(rrset_triples(db, qname, set));
            }
            plan
        }
        Resolution::Wildcard(node) => {
            let mut plan = ReplyPlan::empty(Rcode::NOERROR, true);
            // Wildcard instantiation: owner name in the reply is the
            // original qname, not the `*.` owner (spec.md §4.4 rule).
            if let Some(set) = db.tree.find_rrset(*node, zone_number, qtype) {
                plan.answer.extend(rrset_triples(db, qname, set));
            }
            plan
        }
        Resolution::NoData(node) => {
            let mut plan = ReplyPlan::empty(Rcode::NOERROR, true);
            add_soa(db, zone_number, &mut plan.authority);
            let _ = node;
            plan
        }
        Resolution::NxDomain(_) => {
            let mut plan = ReplyPlan::empty(Rcode::NXDOMAIN, true);
            add_soa(db, zone_number, &mut plan.authority);
            plan
        }
        Resolution::Delegation(deleg) => {
            let mut plan = ReplyPlan::empty(Rcode::NOERROR, false);
            if let Some(set) = db.tree.find_rrset(*deleg, zone_number, Rtype::NS) {
                let owner = db.tree.node(*deleg).name.clone();
                plan.authority.extend(rrset_triples(db, &owner, set));
            }
            plan.additional.extend(glue_for_delegation(db, zone_number, *deleg));
            plan
        }
        Resolution::Cname(node) => {
            let mut plan = ReplyPlan::empty(Rcode::NOERROR, true);
            if let Some(set) = db.tree.find_rrset(*node, zone_number, Rtype::CNAME) {
                plan.answer.extend(rrset_triples(db, qname, set));
            }
            plan
        }
    }
}

fn add_soa(
    db: &Database,
    zone_number: u32,
    out: &mut Vec<(StoredName, Ttl, ZoneRecordData<Bytes, StoredName>)>,
) {
    let apex = db.zone(zone_number).apex;
    if let Some(set) = db.tree.find_rrset(apex, zone_number, Rtype::SOA) {
        let owner = db.tree.node(apex).name.clone();
        out.extend(rrset_triples(db, &owner, set));
    }
}

/// Follows a CNAME chain until a non-CNAME terminal, a zone cut, or
/// `max_chain` hops are exhausted (loop defusal; spec.md leaves the bound
/// unspecified so we pick a conservative one, same rationale as the
/// compiler's `$INCLUDE` depth).
pub const MAX_CNAME_CHAIN: usize = 16;

pub fn resolve_with_cname_chasing(
    db: &Database,
    zone_number: u32,
    qname: &StoredName,
    qtype: Rtype,
) -> (StoredName, Resolution, Vec<(StoredName, Ttl, ZoneRecordData<Bytes, StoredName>)>) {
    let mut current = qname.clone();
    let mut answer_prefix = Vec::new();
    for _ in 0..MAX_CNAME_CHAIN {
        let res = resolve(db, zone_number, &current, qtype);
        match res {
            Resolution::Cname(node) if qtype != Rtype::CNAME => {
                let set = db.tree.find_rrset(node, zone_number, Rtype::CNAME).unwrap();
                answer_prefix.extend(rrset_triples(db, &current, set));
                let ZoneRecordData::Cname(cname) = &set.rrs[0] else {
                    return (current, Resolution::NxDomain(node), answer_prefix);
                };
                let target = cname.cname().to_bytes();
                if !target.ends_with(&db.tree.node(db.zone(zone_number).apex).name) {
                    // Chain leaves the zone: stop, the answer stands as-is
                    // with just the CNAME (no further expansion here).
                    return (current, Resolution::Cname(node), answer_prefix);
                }
                current = target;
            }
            other => return (current, other, answer_prefix),
        }
    }
    (current, Resolution::NxDomain(db.tree.root()), answer_prefix)
}

/// Truncation ordering, spec.md §4.4 (7): drop additional first, then
/// authority (keeping SOA for NXDOMAIN/NODATA), then set TC with only the
/// header + question.
pub fn truncate_to_fit(plan: &mut ReplyPlan, budget: usize, keep_soa: bool) -> bool {
    fn estimate(triples: &[(StoredName, Ttl, ZoneRecordData<Bytes, StoredName>)]) -> usize {
        // Conservative estimate: owner (uncompressed) + fixed RR header +
        // a rough rdata size; real encoding is left to MessageBuilder,
        // this only drives the drop order.
        triples.iter().map(|(n, _, _)| n.len() + 16).sum()
    }

    let mut total = estimate(&plan.answer) + estimate(&plan.authority) + estimate(&plan.additional);
    if total <= budget {
        return false;
    }

    while total > budget && !plan.additional.is_empty() {
        plan.additional.pop();
        total = estimate(&plan.answer) + estimate(&plan.authority) + estimate(&plan.additional);
    }
    if total <= budget {
        return false;
    }

    while total > budget && plan.authority.len() > usize::from(keep_soa) {
        plan.authority.pop();
        total = estimate(&plan.answer) + estimate(&plan.authority) + estimate(&plan.additional);
    }
    if total <= budget {
        return false;
    }

    plan.answer.clear();
    plan.authority.clear();
    plan.additional.clear();
    true
}

/// Copies RD/CD from the query and sets QR/AA/RA/RCODE per spec.md §4.4
/// (8), writing into an already-started [`AnswerBuilder`].
pub fn apply_header<Target>(
    request: &Message<Vec<u8>>,
    answer: &mut AnswerBuilder<Target>,
    rcode: Rcode,
    aa: bool,
) where
    Target: AsMut<[u8]> + octseq::OctetsBuilder,
{
    let req_header = request.header();
    let header = answer.header_mut();
    header.set_qr(true);
    header.set_aa(aa);
    header.set_ra(false);
    header.set_rd(req_header.rd());
    header.set_cd(req_header.cd());
    header.set_rcode(rcode);
}

pub type AnswerAdditional<Target> = AdditionalBuilder<Target>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_zone;
    use std::io::Write;

    fn build_simple_zone() -> (Database, u32, StoredName) {
        let mut db = Database::new();
        let apex = StoredName::bytes_from_str("example.com.").unwrap();
        let dir = std::env::temp_dir().join(format!("query-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("example.com.zone");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "$ORIGIN example.com.\n\
             @ 3600 IN SOA ns1.example.com. hostmaster.example.com. 1 7200 3600 1209600 3600\n\
             @ 3600 IN NS ns1.example.com.\n\
             ns1 3600 IN A 192.0.2.1\n\
             www 3600 IN A 192.0.2.2\n\
             child 3600 IN NS ns1.child.example.com.\n\
             ns1.child 3600 IN A 192.0.2.3\n\
             *.wild 3600 IN A 192.0.2.9\n"
        )
        .unwrap();
        let report = compile_zone(&mut db, &apex, &path);
        assert!(report.ok(), "{:?}", report.errors);
        let number = db.zone_number(&apex).unwrap();
        (db, number, apex)
    }

    #[test]
    fn exact_match_answers() {
        let (db, zone, _apex) = build_simple_zone();
        let qname = StoredName::bytes_from_str("www.example.com.").unwrap();
        let res = resolve(&db, zone, &qname, Rtype::A);
        assert!(matches!(res, Resolution::Answer(_)));
    }

    #[test]
    fn missing_name_is_nxdomain() {
        let (db, zone, _apex) = build_simple_zone();
        let qname = StoredName::bytes_from_str("nope.example.com.").unwrap();
        let res = resolve(&db, zone, &qname, Rtype::A);
        assert!(matches!(res, Resolution::NxDomain(_)));
    }

    #[test]
    fn wildcard_match_synthesises() {
        let (db, zone, _apex) = build_simple_zone();
        let qname = StoredName::bytes_from_str("anything.wild.example.com.").unwrap();
        let res = resolve(&db, zone, &qname, Rtype::A);
        assert!(matches!(res, Resolution::Wildcard(_)));
    }

    #[test]
    fn delegation_clears_aa() {
        let (db, zone, _apex) = build_simple_zone();
        let qname = StoredName::bytes_from_str("host.child.example.com.").unwrap();
        let res = resolve(&db, zone, &qname, Rtype::A);
        assert!(matches!(res, Resolution::Delegation(_)));
        let plan = build_plan(&db, zone, &qname, Rtype::A, &res);
        assert!(!plan.aa);
    }

    #[test]
    fn nodata_keeps_soa_on_truncation() {
        let (db, zone, _apex) = build_simple_zone();
        let qname = StoredName::bytes_from_str("www.example.com.").unwrap();
        let res = resolve(&db, zone, &qname, Rtype::MX);
        assert!(matches!(res, Resolution::NoData(_)));
        let mut plan = build_plan(&db, zone, &qname, Rtype::MX, &res);
        truncate_to_fit(&mut plan, 0, true);
        assert_eq!(plan.authority.len(), 1, "SOA must survive truncation");
    }
}
