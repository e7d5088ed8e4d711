//! Command line and `cashd.conf` parsing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cashd_chainstate::state::{
    ChainStateSettings, DEFAULT_DIRTY_FLUSH_THRESHOLD, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_UTXO_CACHE_ENTRIES,
};
use cashd_consensus::{hash256_from_hex, ConsensusParams, Hash256, Network};
use cashd_log as logging;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "cashd.conf";
const DEFAULT_MAX_BLOCK_FILE_MB: u64 = 128;
const DEFAULT_MEMPOOL_MAX_MB: u64 = 300;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

/// `--assume-valid`: the network default, disabled, or an explicit block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssumeValid {
    NetworkDefault,
    Disabled,
    Block(Hash256),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub backend: Backend,
    pub db_cache_mb: Option<u64>,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub debug_targets: Vec<String>,
    pub imports: Vec<PathBuf>,
    pub check_scripts: bool,
    pub assume_valid: AssumeValid,
    pub max_block_file_mb: u64,
    pub utxo_cache_entries: usize,
    pub flush_interval_secs: u64,
    pub verify_blocks: u32,
    pub mempool_max_mb: u64,
}

impl Config {
    fn defaults(data_dir: PathBuf, conf_path: PathBuf) -> Self {
        Self {
            data_dir,
            conf_path,
            network: Network::Mainnet,
            backend: Backend::Fjall,
            db_cache_mb: None,
            log_level: logging::Level::Info,
            log_format: logging::Format::Text,
            log_timestamps: true,
            debug_targets: Vec::new(),
            imports: Vec::new(),
            check_scripts: true,
            assume_valid: AssumeValid::NetworkDefault,
            max_block_file_mb: DEFAULT_MAX_BLOCK_FILE_MB,
            utxo_cache_entries: DEFAULT_UTXO_CACHE_ENTRIES,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL.as_secs(),
            verify_blocks: 6,
            mempool_max_mb: DEFAULT_MEMPOOL_MAX_MB,
        }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn mempool_max_bytes(&self) -> usize {
        (self.mempool_max_mb as usize).saturating_mul(1_000_000)
    }

    pub fn log_config(&self) -> logging::LogConfig {
        logging::LogConfig {
            level: self.log_level,
            format: self.log_format,
            timestamps: self.log_timestamps,
            debug_targets: self.debug_targets.clone(),
        }
    }

    pub fn chainstate_settings(&self, params: &ConsensusParams) -> ChainStateSettings {
        let assume_valid = match self.assume_valid {
            AssumeValid::NetworkDefault => params.default_assume_valid,
            AssumeValid::Disabled => None,
            AssumeValid::Block(hash) => Some(hash),
        };
        ChainStateSettings {
            check_scripts: self.check_scripts,
            assume_valid,
            utxo_cache_entries: self.utxo_cache_entries,
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            max_block_file_size: self.max_block_file_mb.saturating_mul(1024 * 1024),
            dirty_flush_threshold: DEFAULT_DIRTY_FLUSH_THRESHOLD,
        }
    }
}

pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

/// Keys that take no value on the command line.
fn is_switch(key: &str) -> bool {
    matches!(key, "check-scripts" | "log-timestamps" | "help" | "version")
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut cli: Vec<(String, String)> = Vec::new();
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            return Err(format!("unexpected argument '{arg}'\n\n{}", usage()));
        };
        let (key, value) = match flag.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None if is_switch(flag) => (flag.to_string(), "1".to_string()),
            None => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --{flag}"))?;
                (flag.to_string(), value)
            }
        };
        match key.as_str() {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => cli.push((key, value)),
        }
    }

    let data_dir = cli
        .iter()
        .rev()
        .find(|(key, _)| key == "data-dir")
        .map(|(_, value)| PathBuf::from(value))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = cli
        .iter()
        .rev()
        .find(|(key, _)| key == "conf")
        .map(|(_, value)| PathBuf::from(value))
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));

    let mut config = Config::defaults(data_dir, conf_path.clone());
    if let Some(conf) = load_conf(&conf_path)? {
        let origin = conf_path.display().to_string();
        for (key, values) in &conf {
            if matches!(key.as_str(), "data-dir" | "conf") {
                continue;
            }
            for value in values {
                apply(&mut config, key, value)
                    .map_err(|err| format!("{err} in {origin}"))?;
            }
        }
    }
    for (key, value) in &cli {
        if matches!(key.as_str(), "data-dir" | "conf") {
            continue;
        }
        apply(&mut config, key, value)?;
    }
    Ok(CliAction::Run(config))
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<(), String> {
    let invalid = || format!("invalid value '{value}' for {key}");
    match key {
        "network" => {
            config.network = match value {
                "mainnet" | "main" => Network::Mainnet,
                "testnet" | "test" => Network::Testnet,
                "regtest" => Network::Regtest,
                _ => return Err(invalid()),
            }
        }
        "backend" => config.backend = Backend::parse(value).ok_or_else(invalid)?,
        "db-cache-mb" => {
            config.db_cache_mb = Some(value.parse().map_err(|_| invalid())?)
        }
        "log-level" => config.log_level = logging::Level::parse(value).ok_or_else(invalid)?,
        "log-format" => config.log_format = logging::Format::parse(value).ok_or_else(invalid)?,
        "log-timestamps" => config.log_timestamps = parse_bool(value).ok_or_else(invalid)?,
        "debug" => config.debug_targets.push(value.to_string()),
        "import" => config.imports.push(PathBuf::from(value)),
        "check-scripts" => config.check_scripts = parse_bool(value).ok_or_else(invalid)?,
        "assume-valid" => {
            config.assume_valid = if value == "0" {
                AssumeValid::Disabled
            } else {
                AssumeValid::Block(hash256_from_hex(value).map_err(|_| invalid())?)
            }
        }
        "max-block-file-mb" => {
            config.max_block_file_mb = value.parse().ok().filter(|mb| *mb > 0).ok_or_else(invalid)?
        }
        "utxo-cache-entries" => config.utxo_cache_entries = value.parse().map_err(|_| invalid())?,
        "flush-interval-secs" => {
            config.flush_interval_secs = value.parse().map_err(|_| invalid())?
        }
        "verify-blocks" => config.verify_blocks = value.parse().map_err(|_| invalid())?,
        "mempool-max-mb" => config.mempool_max_mb = value.parse().map_err(|_| invalid())?,
        _ => return Err(format!("unknown option '{key}'")),
    }
    Ok(())
}

/// Reads `key=value` lines. Missing files are not an error.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage: cashd [options]",
        "",
        "Options:",
        "  --data-dir <path>           data directory (default: ./data)",
        "  --conf <path>               config file (default: <data-dir>/cashd.conf)",
        "  --network <name>            mainnet | testnet | regtest",
        "  --backend <name>            fjall | memory",
        "  --db-cache-mb <n>           fjall block cache size",
        "  --log-level <level>         error | warn | info | debug | trace",
        "  --log-format <format>       text | json",
        "  --log-timestamps[=0|1]      prefix log lines with a timestamp",
        "  --debug <target>            debug logging for a module (repeatable)",
        "  --import <file>             import blocks from a bootstrap file (repeatable)",
        "  --check-scripts[=0|1]       verify input scripts while connecting",
        "  --assume-valid <hash|0>     skip scripts at or below this block; 0 disables",
        "  --max-block-file-mb <n>     size limit of one block file",
        "  --utxo-cache-entries <n>    coins kept in memory",
        "  --flush-interval-secs <n>   seconds between periodic index flushes",
        "  --verify-blocks <n>         blocks checked by the startup chain verification",
        "  --mempool-max-mb <n>        mempool size limit",
        "  --help                      print this message",
        "  --version                   print the version",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    fn run_config(list: &[&str]) -> Config {
        match parse_args_from(args(list)).expect("parse") {
            CliAction::Run(config) => config,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_overrides_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# comment\nnetwork=testnet\nverify-blocks=50 ; trailing\ndebug=index\ncheck-scripts=0\nlog-timestamps\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = run_config(&[
            "--data-dir",
            &data_dir,
            "--network",
            "regtest",
            "--debug=reorg",
            "--import",
            "a.dat",
        ]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.verify_blocks, 50);
        assert!(!config.check_scripts);
        assert!(config.log_timestamps);
        assert_eq!(config.debug_targets, vec!["index".to_string(), "reorg".to_string()]);
        assert_eq!(config.imports, vec![PathBuf::from("a.dat")]);
        assert_eq!(config.blocks_dir(), dir.path().join("blocks"));
    }

    #[test]
    fn assume_valid_forms() {
        let params = cashd_consensus::consensus_params(Network::Mainnet);
        let config = run_config(&["--data-dir", "/nonexistent-cashd", "--assume-valid", "0"]);
        assert_eq!(config.chainstate_settings(&params).assume_valid, None);

        let hex = "00000000000000000019f112ec0a9982926f1258cdcc558dd7c3b7e5dc7fa148";
        let config = run_config(&["--data-dir", "/nonexistent-cashd", "--assume-valid", hex]);
        assert_eq!(
            config.assume_valid,
            AssumeValid::Block(hash256_from_hex(hex).expect("hex"))
        );

        let config = run_config(&["--data-dir", "/nonexistent-cashd"]);
        assert_eq!(
            config.chainstate_settings(&params).assume_valid,
            params.default_assume_valid
        );
    }

    #[test]
    fn rejects_unknown_and_malformed_options() {
        assert!(parse_args_from(args(&["--bogus", "1"])).is_err());
        assert!(parse_args_from(args(&["--network", "moon"])).is_err());
        assert!(parse_args_from(args(&["--verify-blocks"])).is_err());
        assert!(parse_args_from(args(&["stray"])).is_err());
        assert!(matches!(
            parse_args_from(args(&["--help"])),
            Ok(CliAction::PrintHelp)
        ));
    }
}
