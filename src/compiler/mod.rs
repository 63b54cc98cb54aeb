//! The zone compiler (spec.md §4.2).
//!
//! Tokenisation, `$TTL`/`$ORIGIN` handling, escape sequences and the
//! per-type rdata grammar are all delegated to `domain::zonefile::inplace`,
//! which already carries the full RFC 1035 §5 grammar plus RFC 3597
//! generic rdata — the teacher's `domain` dependency already enables the
//! `zonefile` feature for exactly this. What domain.rs's scanner does not
//! do is enforce spec.md's zone invariants or decide where records land in
//! *our* name tree, which is what this module is for.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use domain::base::iana::Class;
use domain::base::{Rtype, Ttl};
use domain::zonefile::inplace::{self, Entry};

use crate::database::Database;
use crate::nametree::StoredName;
use crate::rrstore::RrsetEntry;

/// RFC 1035 doesn't bound `$INCLUDE` depth; NSD-style servers do, to stop a
/// zone file including itself. Chosen and documented per spec.md §9's
/// "open question" about unspecified implementation limits.
pub const MAX_INCLUDE_DEPTH: usize = 10;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub file: PathBuf,
    pub line: Option<usize>,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct CompileReport {
    pub errors: Vec<CompileError>,
    pub rrs_loaded: usize,
}

impl CompileReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn err(&mut self, file: &Path, line: Option<usize>, message: impl Into<String>) {
        self.errors.push(CompileError {
            file: file.to_path_buf(),
            line,
            message: message.into(),
        });
    }
}

/// Compiles `zone_file` as the contents of `apex_name`, inserting RRs into
/// `db`'s shared name tree under the zone already registered via
/// `Database::add_zone`. Returns a report; the caller (zonec or the
/// server's reload path) decides whether errors abort persistence.
pub fn compile_zone(
    db: &mut Database,
    apex_name: &StoredName,
    zone_file: &Path,
) -> CompileReport {
    let zone_number = db
        .zone_number(apex_name)
        .unwrap_or_else(|| db.add_zone(apex_name));

    let mut report = CompileReport::default();
    let mut soa_count = 0usize;
    load_file(db, apex_name, zone_number, zone_file, 0, &mut report, &mut soa_count);

    if soa_count != 1 {
        report.err(
            zone_file,
            None,
            format!(
                "zone {} must have exactly one SOA at the apex, found {}",
                apex_name, soa_count
            ),
        );
    }

    report
}

fn load_file(
    db: &mut Database,
    apex_name: &StoredName,
    zone_number: u32,
    path: &Path,
    depth: usize,
    report: &mut CompileReport,
    soa_count: &mut usize,
) {
    if depth > MAX_INCLUDE_DEPTH {
        report.err(path, None, "$INCLUDE nesting too deep");
        return;
    }

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            report.err(path, None, format!("cannot open zone file: {e}"));
            return;
        }
    };

    let mut zonefile = match read_into_scanner(path, file) {
        Ok(z) => z,
        Err(e) => {
            report.err(path, None, format!("cannot read zone file: {e}"));
            return;
        }
    };
    zonefile.set_origin(apex_name.clone());

    loop {
        let entry = match zonefile.next_entry() {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(e) => {
                report.err(path, None, format!("parse error: {e}"));
                continue;
            }
        };

        match entry {
            Entry::Record(record) => {
                process_record(db, apex_name, zone_number, path, record, report, soa_count);
            }
            Entry::Include { path: inc, origin } => {
                let inc_path = resolve_include(path, &inc);
                let origin = origin.unwrap_or_else(|| apex_name.clone());
                load_file(db, &origin, zone_number, &inc_path, depth + 1, report, soa_count);
            }
        }
    }
}

fn resolve_include(current: &Path, include: &str) -> PathBuf {
    let p = Path::new(include);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        current.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn read_into_scanner(path: &Path, mut file: File) -> io::Result<inplace::Zonefile> {
    let len = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
    let mut buf = inplace::Zonefile::with_capacity(len).writer();
    io::copy(&mut file, &mut buf)?;
    let _ = path;
    Ok(buf.into_inner())
}

type ScannedRecord = domain::base::Record<StoredName, crate::rrstore::StoredRecordData>;

fn process_record(
    db: &mut Database,
    apex_name: &StoredName,
    zone_number: u32,
    path: &Path,
    record: ScannedRecord,
    report: &mut CompileReport,
    soa_count: &mut usize,
) {
    if record.class() != Class::IN {
        report.err(
            path,
            None,
            format!("record class {} is not IN, rejected", record.class()),
        );
        return;
    }

    if !record.owner().ends_with(apex_name) {
        report.err(
            path,
            None,
            format!(
                "owner {} is outside the zone's origin {}",
                record.owner(),
                apex_name
            ),
        );
        return;
    }

    let owner = record.owner().clone();
    let node_id = db.tree.insert(&owner);

    if record.rtype() == Rtype::SOA {
        *soa_count += 1;
        if *soa_count > 1 {
            report.err(path, None, "extra SOA record discarded");
            return;
        }
        if node_id != db.zone(zone_number).apex {
            report.err(path, None, "SOA record must be at the zone apex");
            return;
        }
    }

    let ttl = record.ttl();
    let rtype = record.rtype();
    let rdata = record.into_data();
    process_rr(db, zone_number, node_id, ttl, rtype, rdata, path, report);
}

/// `process_rr` contract from spec.md §4.2: look up (domain, zone, type),
/// create the RRset on first sight, otherwise enforce TTL equality and
/// drop duplicate RRs, then append.
fn process_rr(
    db: &mut Database,
    zone_number: u32,
    node_id: crate::nametree::NodeId,
    ttl: Ttl,
    rtype: Rtype,
    rdata: crate::rrstore::StoredRecordData,
    path: &Path,
    report: &mut CompileReport,
) {
    let existing_idx = db
        .tree
        .node(node_id)
        .rrsets
        .iter()
        .position(|r| r.zone_number == zone_number && r.rtype == rtype);

    match existing_idx {
        None => {
            let mut entry = RrsetEntry::new(zone_number, rtype, ttl);
            entry.push_dedup(rdata);
            db.tree.add_rrset(node_id, entry);
            report.rrs_loaded += 1;
        }
        Some(idx) => {
            let current_ttl = db.tree.node(node_id).rrsets[idx].ttl;
            if current_ttl != ttl {
                report.err(
                    path,
                    None,
                    format!(
                        "TTL mismatch within RRset (had {}, got {}); RR rejected",
                        current_ttl.as_secs(),
                        ttl.as_secs()
                    ),
                );
                return;
            }
            let before = db.tree.node(node_id).rrsets[idx].len();
            db.tree.node_mut(node_id).rrsets[idx].push_dedup(rdata);
            if db.tree.node(node_id).rrsets[idx].len() > before {
                report.rrs_loaded += 1;
            }
        }
    }

    // First RR of the apex SOA/NS type dictates the zone's shortcut
    // pointers, per spec.md §4.2's process_rr contract.
    if rtype == Rtype::SOA && node_id == db.zone(zone_number).apex {
        let slot = db
            .tree
            .node(node_id)
            .rrsets
            .iter()
            .position(|r| r.zone_number == zone_number && r.rtype == Rtype::SOA);
        db.zone_mut(zone_number).soa_rrset = slot.map(|_| node_id);
    }
    if rtype == Rtype::NS && node_id == db.zone(zone_number).apex {
        db.zone_mut(zone_number).ns_rrset = Some(node_id);
    }
}

/// Bridges a compiled zone out of our own `nametree`/`rrstore` into a
/// `domain::zonetree::Zone`, the structure the teacher's serving layer
/// actually queries and walks (see `service::Dnsr`). Lives here rather than
/// in `service` since it is the compiler's output format, just a second one
/// alongside the persisted database image.
pub fn to_zone(db: &Database, zone_number: u32) -> crate::error::Result<domain::zonetree::Zone> {
    use domain::zonetree::{Rrset, ZoneBuilder};

    let apex_name = db.zone_names()[zone_number as usize].clone();
    let mut builder = ZoneBuilder::new(apex_name, Class::IN);

    for (_, node) in db.tree.iter() {
        let owned: Vec<&RrsetEntry> = node
            .rrsets
            .iter()
            .filter(|r| r.zone_number == zone_number)
            .collect();
        if owned.is_empty() {
            continue;
        }
        for entry in owned {
            let mut rrset = Rrset::new(entry.rtype, entry.ttl);
            for rr in &entry.rrs {
                rrset.push_data(rr.clone());
            }
            builder.insert_rrset(&node.name, rrset.into_shared())?;
        }
    }

    Ok(builder.build())
}
