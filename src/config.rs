//! Configuration: a YAML file (teacher's original shape) merged with the
//! CLI surface from spec.md §6. CLI flags win over the YAML file so an
//! operator can override a single setting without editing the file.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::Result;

pub const BASE_CONFIG_FILE: &str = "/etc/adnsd/adnsd.yaml";
pub const DEFAULT_ZONE_LIST: &str = "/etc/adnsd/zones.list";
pub const DEFAULT_DATABASE: &str = "/var/db/adnsd/adnsd.db";
pub const DEFAULT_PID_FILE: &str = "/var/run/adnsd.pid";
pub const DEFAULT_PORT: u16 = 53;

/// Command-line surface from spec.md §6.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "adnsd", about = "authoritative DNS nameserver")]
pub struct Cli {
    /// Listen address, repeatable.
    #[arg(short = 'a', long = "address")]
    pub address: Vec<IpAddr>,
    /// Listen port (default 53).
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    /// Listen on IPv4 only.
    #[arg(short = '4')]
    pub ipv4_only: bool,
    /// Listen on IPv6 only.
    #[arg(short = '6')]
    pub ipv6_only: bool,
    /// Number of server worker tasks (default: one per core).
    #[arg(short = 'n', long = "server-count")]
    pub server_count: Option<usize>,
    /// Compiled database file path.
    #[arg(short = 'f', long = "database")]
    pub database: Option<PathBuf>,
    /// YAML config file path.
    #[arg(short = 'c', long = "config-file")]
    pub config_file: Option<PathBuf>,
    /// Zone list file path.
    #[arg(short = 'z', long = "zonelist")]
    pub zone_list: Option<PathBuf>,
    /// Pid file path.
    #[arg(short = 'P', long = "pidfile")]
    pub pid_file: Option<PathBuf>,
    /// Run in the foreground instead of daemonising.
    #[arg(short = 'd', long = "foreground")]
    pub foreground: bool,
    /// Verbosity, repeatable (`-V -V` for trace).
    #[arg(short = 'V', long = "verbosity", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    address: Vec<IpAddr>,
    port: Option<u16>,
    server_count: Option<usize>,
    database: Option<PathBuf>,
    zone_list: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    #[serde(default)]
    tsig_folder: Option<PathBuf>,
    #[serde(default)]
    log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub address: Vec<IpAddr>,
    pub port: u16,
    pub ipv4_only: bool,
    pub ipv6_only: bool,
    pub server_count: Option<usize>,
    pub database: PathBuf,
    pub zone_list: PathBuf,
    pub pid_file: PathBuf,
    pub tsig_folder: PathBuf,
    pub foreground: bool,
    pub log: LogConfig,
}

impl Config {
    /// Reads the YAML file named by `cli.config_file` (or [`BASE_CONFIG_FILE`])
    /// and layers the CLI flags on top of it.
    pub fn load(cli: Cli) -> Result<Config> {
        let config_path = cli
            .config_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(BASE_CONFIG_FILE));

        let file: FileConfig = match std::fs::read(&config_path) {
            Ok(bytes) => serde_yaml::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => return Err(e.into()),
        };

        let mut log = file.log;
        if cli.verbosity > 0 {
            log.level = verbosity_to_level(cli.verbosity);
        }

        Ok(Config {
            address: if cli.address.is_empty() { file.address } else { cli.address },
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            ipv4_only: cli.ipv4_only,
            ipv6_only: cli.ipv6_only,
            server_count: cli.server_count.or(file.server_count),
            database: cli
                .database
                .or(file.database)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)),
            zone_list: cli
                .zone_list
                .or(file.zone_list)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ZONE_LIST)),
            pid_file: cli
                .pid_file
                .or(file.pid_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
            tsig_folder: file
                .tsig_folder
                .unwrap_or_else(|| PathBuf::from(crate::key::TSIG_DIR)),
            foreground: cli.foreground,
            log,
        })
    }

    pub fn tsig_path(&self) -> &std::path::Path {
        &self.tsig_folder
    }
}

fn verbosity_to_level(v: u8) -> log::LevelFilter {
    match v {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

#[derive(Deserialize, Clone, Copy, Debug)]
pub struct LogConfig {
    #[serde(deserialize_with = "de_level_filter", default = "default_level")]
    pub level: log::LevelFilter,
    #[serde(default)]
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: log::LevelFilter::Info,
            color: false,
        }
    }
}

fn default_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn de_level_filter<'de, D>(deserializer: D) -> std::result::Result<log::LevelFilter, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: LevelFilter = Deserialize::deserialize(deserializer)?;
    match s {
        LevelFilter::Off => Ok(log::LevelFilter::Off),
        LevelFilter::Error => Ok(log::LevelFilter::Error),
        LevelFilter::Warn => Ok(log::LevelFilter::Warn),
        LevelFilter::Info => Ok(log::LevelFilter::Info),
        LevelFilter::Debug => Ok(log::LevelFilter::Debug),
        LevelFilter::Trace => Ok(log::LevelFilter::Trace),
    }
}

#[derive(Deserialize)]
enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
