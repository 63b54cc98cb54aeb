//! `zonec`: offline zone compiler, spec.md §6.
//!
//! `zonec [-v] [-f <db-file>] [-d <chdir>] <zone-list-file>`. Compiles every
//! zone named by the zone list file into a single database image
//! ([`adnsd::persist::write_database`]), the same pipeline `adnsd`'s
//! watcher runs in-process on every reload (see `service::watcher::reload`),
//! but as a one-shot batch job so the image can be validated and shipped
//! ahead of starting the server.

use std::path::PathBuf;
use std::process::exit;

use adnsd::database::Database;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "zonec", about = "compiles a zone list into a database image")]
struct Cli {
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[arg(short = 'f', long = "database")]
    database: Option<PathBuf>,

    #[arg(short = 'd', long = "chdir")]
    chdir: Option<PathBuf>,

    zone_list: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    adnsd::logger::Logger::new().with_level(level).with_stderr(true).init().expect("failed to initialise logger");

    if let Some(dir) = &cli.chdir {
        if let Err(e) = std::env::set_current_dir(dir) {
            log::error!(target: "zonec", "failed to chdir to {}: {e}", dir.display());
            exit(1);
        }
    }

    let text = match std::fs::read_to_string(&cli.zone_list) {
        Ok(text) => text,
        Err(e) => {
            log::error!(target: "zonec", "failed to read zone list '{}': {e}", cli.zone_list.display());
            exit(1);
        }
    };

    let entries = match adnsd::xfr::parse_zone_list(&text) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!(target: "zonec", "failed to parse zone list: {e}");
            exit(1);
        }
    };

    let database = cli.database.unwrap_or_else(|| PathBuf::from(adnsd::config::DEFAULT_DATABASE));

    let mut db = Database::new();
    let mut had_errors = false;

    for entry in &entries {
        let report = adnsd::compiler::compile_zone(&mut db, &entry.apex, &entry.file);
        for err in &report.errors {
            log::error!(target: "zonec", "{}: {}", entry.apex, err.message);
            had_errors = true;
        }
        if report.errors.is_empty() {
            let zone_number = db.zone_number(&entry.apex).expect("compile_zone adds the zone");
            adnsd::denial::precompute(&mut db, zone_number);
            log::info!(target: "zonec", "compiled zone '{}' ({} RRs)", entry.apex, report.rrs_loaded);
        }
    }

    if had_errors {
        log::error!(target: "zonec", "compilation failed, database not written");
        exit(1);
    }

    adnsd::denial::precompute_ds_covers(&mut db);

    if let Err(e) = adnsd::persist::write_database(&db, &database) {
        log::error!(target: "zonec", "failed to write database '{}': {e}", database.display());
        exit(1);
    }

    log::info!(target: "zonec", "wrote database '{}' with {} zones", database.display(), entries.len());
    exit(0);
}
