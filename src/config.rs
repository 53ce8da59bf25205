//! Server configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is
//! a valid configuration. The CLI overrides individual fields after loading.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, Result};

pub const DEFAULT_BIND: &str = "0.0.0.0:5566";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP address the QUIC endpoint binds.
    pub bind: SocketAddr,
    /// Policy file; watched for changes while serving.
    pub policy_path: PathBuf,
    pub db_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub decoded_snapshot_path: PathBuf,
    /// Period of the background snapshot merge. Zero disables it.
    pub dump_interval_minutes: u64,
    /// Hex-encoded Ed25519 secret; created on first start.
    pub key_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5566)),
            policy_path: PathBuf::from("config.json"),
            db_path: PathBuf::from("fleetdir.db"),
            snapshot_path: PathBuf::from("cluster_dump.json"),
            decoded_snapshot_path: PathBuf::from("decode_cluster_dump.json"),
            dump_interval_minutes: 60,
            key_path: PathBuf::from("server.key"),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<ServerConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            DirectoryError::NotFound(format!("server config {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Config rooted in `dir`: every file path is placed inside it.
    pub fn in_dir(dir: impl AsRef<Path>) -> ServerConfig {
        let dir = dir.as_ref();
        let defaults = ServerConfig::default();
        ServerConfig {
            policy_path: dir.join(defaults.policy_path),
            db_path: dir.join(defaults.db_path),
            snapshot_path: dir.join(defaults.snapshot_path),
            decoded_snapshot_path: dir.join(defaults.decoded_snapshot_path),
            key_path: dir.join(defaults.key_path),
            ..ServerConfig::default()
        }
    }

    pub fn dump_interval(&self) -> Option<Duration> {
        (self.dump_interval_minutes > 0).then(|| Duration::from_secs(self.dump_interval_minutes * 60))
    }
}
