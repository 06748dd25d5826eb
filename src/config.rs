use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub node: Node,
    pub sync: BlockSync,
    pub storage: Storage,
    pub explorer: Explorer,
    pub mappings: Mappings,
    pub metrics: Metrics,
    pub log: Log,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Node {
    /// Remote peer to mirror, `host:port`.
    pub peer: String,
    pub listener_port: u16,
    /// Hex address announced in the challenge request.
    pub address: String,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub ping_interval_secs: u64,
    pub dev_mode: bool,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            peer: "127.0.0.1:4133".into(),
            listener_port: 14133,
            address: hex::encode([0u8; 32]),
            connect_timeout_secs: 5,
            reconnect_delay_secs: 5,
            ping_interval_secs: 3,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlockSync {
    pub batch_size: u32,
    /// Heights re-requested at once while a batch is outstanding.
    pub retry_batch_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for BlockSync {
    fn default() -> Self {
        Self { batch_size: 1, retry_batch_size: 1, request_timeout_secs: 30 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Storage {
    pub path: String,
}

impl Default for Storage {
    fn default() -> Self {
        Self { path: "data".into() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Explorer {
    /// Blocks between two cache backups.
    pub backup_interval: u32,
    /// Blocks a cache backup is kept for.
    pub backup_retention: u32,
    pub rollback_backups: bool,
    /// Directory checked for `revert_flag` and `clear_flag` at start-up.
    pub flag_dir: String,
    pub mailbox_size: usize,
}

impl Default for Explorer {
    fn default() -> Self {
        Self {
            backup_interval: 100,
            backup_retention: 1000,
            rollback_backups: false,
            flag_dir: ".".into(),
            mailbox_size: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Mappings {
    /// `program/mapping` entries whose history is only kept through cache snapshots.
    pub reduced_tracking: Vec<String>,
}

impl Default for Mappings {
    fn default() -> Self {
        Self {
            reduced_tracking: vec![
                "credits.aleo/committee".into(),
                "credits.aleo/bonded".into(),
                "credits.aleo/delegated".into(),
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Metrics {
    pub enabled: bool,
    pub bind: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0:9100".into() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Log {
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text).with_context(|| "invalid TOML in config file".to_string())
}
