//! # Snapshot Engine
//!
//! Keeps a sealed flat-file copy of the directory for recovery and offline
//! inspection. The snapshot is append-only relative to the live directory:
//! addresses that disappear from the directory stay in the snapshot.
//!
//! ## Dump state machine
//!
//! | State | Action |
//! |-------|--------|
//! | no snapshot file | create it empty, then treat as initial |
//! | initial (empty file) | write the full live directory |
//! | existing snapshot | add live addresses missing from it |
//!
//! A write only happens when at least one node was added; the merged node
//! list is sorted by address, written to `<snapshot>.temp`, synced and then
//! renamed over the snapshot. A no-op merge performs no file I/O.
//!
//! Dump and decode are serialized by the engine's own lock, independent of
//! the directory mutex. File I/O runs on the blocking pool.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info};

use crate::cluster::ClusterFile;
use crate::codec;
use crate::entity::Node;
use crate::error::{DirectoryError, Result};

/// Write `bytes` to `<path>.temp`, sync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut tmp: OsString = path.as_os_str().to_os_string();
    tmp.push(".temp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub struct SnapshotEngine {
    snapshot_path: PathBuf,
    decoded_path: PathBuf,
    lock: Mutex<()>,
}

impl SnapshotEngine {
    pub fn new(snapshot_path: impl Into<PathBuf>, decoded_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            decoded_path: decoded_path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Merge `live` into the snapshot. Returns the number of nodes added.
    pub async fn dump(&self, live: Vec<Node>) -> Result<usize> {
        if live.is_empty() {
            debug!("directory is empty, nothing to dump");
            return Ok(0);
        }
        let _guard = self.lock.lock().await;
        let path = self.snapshot_path.clone();
        task::spawn_blocking(move || merge_into(&path, live))
            .await
            .map_err(map_join_error)?
    }

    /// Open the snapshot into a plaintext file for inspection.
    pub async fn decode(&self) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        let snapshot = self.snapshot_path.clone();
        let decoded = self.decoded_path.clone();
        task::spawn_blocking(move || decode_into(&snapshot, decoded))
            .await
            .map_err(map_join_error)?
    }
}

fn map_join_error(err: task::JoinError) -> DirectoryError {
    DirectoryError::Io(io::Error::other(format!("snapshot task cancelled: {err}")))
}

fn merge_into(path: &Path, live: Vec<Node>) -> Result<usize> {
    let (mut cluster, added) = match read_existing(path)? {
        None => {
            let added = live.len();
            (ClusterFile::from_nodes(live), added)
        }
        Some(mut cluster) => {
            let known: HashSet<String> = cluster.nodes.iter().map(|n| n.ip.clone()).collect();
            let mut added = 0;
            for node in live {
                if !known.contains(&node.ip) {
                    cluster.nodes.push(node);
                    added += 1;
                }
            }
            (cluster, added)
        }
    };

    if added == 0 {
        debug!(path = %path.display(), "snapshot already up to date");
        return Ok(0);
    }

    cluster.nodes.sort_by(|a, b| a.ip.cmp(&b.ip));
    let plain = serde_json::to_vec_pretty(&cluster)?;
    let sealed = codec::seal(&plain)?;
    write_atomic(path, &sealed)?;

    info!(
        path = %path.display(),
        added,
        total = cluster.nodes.len(),
        "snapshot updated"
    );
    Ok(added)
}

/// `None` for the initial state (file missing or empty). A missing file
/// is created empty so a crash before the first write leaves the initial
/// state behind.
fn read_existing(path: &Path) -> Result<Option<ClusterFile>> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => Ok(Some(codec::open_json(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "creating snapshot file");
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            File::create(path)?;
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn decode_into(snapshot: &Path, decoded: PathBuf) -> Result<PathBuf> {
    let sealed = match fs::read(snapshot) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DirectoryError::NotFound(format!("snapshot {}", snapshot.display())));
        }
        Err(e) => return Err(e.into()),
    };
    let plain = codec::open(&sealed)?;
    fs::write(&decoded, plain)?;
    info!(path = %decoded.display(), "snapshot decoded");
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ip: &str) -> Node {
        Node {
            ip: ip.to_string(),
            port: 22,
            user: "root".to_string(),
            password: "pw".to_string(),
            tag: String::new(),
            group: "web".to_string(),
        }
    }

    fn engine(dir: &Path) -> SnapshotEngine {
        SnapshotEngine::new(dir.join("cluster_dump.json"), dir.join("decode_cluster_dump.json"))
    }

    fn read_snapshot(engine: &SnapshotEngine) -> ClusterFile {
        let sealed = fs::read(engine.snapshot_path()).unwrap();
        codec::open_json(&sealed).unwrap()
    }

    #[tokio::test]
    async fn first_dump_writes_sorted_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let added = engine.dump(vec![node("10.0.0.2"), node("10.0.0.1")]).await.unwrap();
        assert_eq!(added, 2);

        let ips: Vec<String> = read_snapshot(&engine).nodes.into_iter().map(|n| n.ip).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(!dir.path().join("cluster_dump.json.temp").exists());
    }

    #[tokio::test]
    async fn empty_directory_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert_eq!(engine.dump(Vec::new()).await.unwrap(), 0);
        assert!(!engine.snapshot_path().exists());
    }

    #[tokio::test]
    async fn repeated_dump_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let live = vec![node("10.0.0.1"), node("10.0.0.2")];

        engine.dump(live.clone()).await.unwrap();
        let first = fs::read(engine.snapshot_path()).unwrap();
        assert_eq!(engine.dump(live).await.unwrap(), 0);
        let second = fs::read(engine.snapshot_path()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn merge_appends_and_never_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        engine.dump(vec![node("10.0.0.5"), node("10.0.0.1")]).await.unwrap();
        let added = engine.dump(vec![node("10.0.0.3")]).await.unwrap();
        assert_eq!(added, 1);

        let ips: Vec<String> = read_snapshot(&engine).nodes.into_iter().map(|n| n.ip).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3", "10.0.0.5"]);
    }

    #[tokio::test]
    async fn merge_keeps_snapshot_copy_of_known_address() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        engine.dump(vec![node("10.0.0.1")]).await.unwrap();
        let mut changed = node("10.0.0.1");
        changed.password = "rotated".to_string();
        assert_eq!(engine.dump(vec![changed]).await.unwrap(), 0);
        assert_eq!(read_snapshot(&engine).nodes[0].password, "pw");
    }

    #[tokio::test]
    async fn zero_length_snapshot_is_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        File::create(engine.snapshot_path()).unwrap();

        assert_eq!(engine.dump(vec![node("10.0.0.1")]).await.unwrap(), 1);
        assert_eq!(read_snapshot(&engine).nodes.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        fs::write(engine.snapshot_path(), b"plaintext is not a sealed snapshot").unwrap();

        let err = engine.dump(vec![node("10.0.0.1")]).await.unwrap_err();
        assert!(err.is_systemic());
    }

    #[tokio::test]
    async fn first_dump_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state").join("snapshots");
        let engine = SnapshotEngine::new(nested.join("cluster_dump.json"), nested.join("decoded.json"));

        assert_eq!(engine.dump(vec![node("10.0.0.1")]).await.unwrap(), 1);
        assert_eq!(read_snapshot(&engine).nodes.len(), 1);
    }

    #[tokio::test]
    async fn decode_writes_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        assert!(matches!(engine.decode().await, Err(DirectoryError::NotFound(_))));

        engine.dump(vec![node("10.0.0.1")]).await.unwrap();
        let path = engine.decode().await.unwrap();
        let plain: ClusterFile = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(plain.nodes[0].ip, "10.0.0.1");
    }
}
