//! # Client Cache
//!
//! The client keeps the result of its last full Query in a sealed file so
//! most invocations avoid fetching the whole directory. A refresh polls the
//! server's Cache RPC and re-queries only when the view is stale:
//!
//! | Condition | Action |
//! |-----------|--------|
//! | `force` | Query, rewrite file |
//! | file missing or unreadable | Query, rewrite file |
//! | `Cache(user)` reports dirty | Query, rewrite file |
//! | otherwise | return the file contents |
//!
//! The Query clears the caller's dirty flag server-side, so the next refresh
//! is served from the file again.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec;
use crate::entity::Node;
use crate::error::{DirectoryError, Result};
use crate::messages::QueryResponse;
use crate::protocols::DirectoryRpc;
use crate::snapshot::write_atomic;

pub const DEFAULT_CACHE_FILE: &str = ".fleetdir_cache.json";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCache {
    /// Visible node count per group.
    pub groups: BTreeMap<String, i32>,
    /// Node records keyed by address.
    pub nodes: BTreeMap<String, Node>,
    /// Member addresses per group, in address order.
    #[serde(rename = "ref")]
    pub group_ref: BTreeMap<String, Vec<String>>,
}

impl LocalCache {
    /// `~/.fleetdir_cache.json`, or the working directory when no home is set.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(DEFAULT_CACHE_FILE)
    }

    pub fn from_query(response: &QueryResponse) -> Result<LocalCache> {
        if response.nodes.is_empty() {
            return Err(DirectoryError::EmptyNodes);
        }
        let mut cache = LocalCache {
            groups: response.group_counts.clone(),
            ..LocalCache::default()
        };
        for meta in &response.nodes {
            let node = Node::from(meta.clone());
            cache.nodes.insert(node.ip.clone(), node);
        }
        for node in cache.nodes.values() {
            cache
                .group_ref
                .entry(node.group.to_lowercase())
                .or_default()
                .push(node.ip.clone());
        }
        Ok(cache)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<LocalCache> {
        let sealed = fs::read(path.as_ref())?;
        codec::open_json(&sealed)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let sealed = codec::seal_json(self)?;
        write_atomic(path.as_ref(), &sealed)?;
        Ok(())
    }

    /// Current view for `user`, querying the server only when needed.
    pub async fn refresh<R: DirectoryRpc + ?Sized>(
        rpc: &R,
        user: &str,
        path: impl AsRef<Path>,
        force: bool,
    ) -> Result<LocalCache> {
        let path = path.as_ref();
        if !force {
            match LocalCache::load(path) {
                Ok(cached) => {
                    if !rpc.cache(user).await? {
                        debug!(path = %path.display(), "cache is current");
                        return Ok(cached);
                    }
                    debug!(user = %user, "server reports stale cache");
                }
                Err(e) => debug!(path = %path.display(), error = %e, "no usable cache file"),
            }
        }

        let response = rpc.query(user, &[]).await?;
        let cache = LocalCache::from_query(&response)?;
        cache.save(path)?;
        info!(path = %path.display(), nodes = cache.nodes.len(), "cache refreshed");
        Ok(cache)
    }

    /// Nodes sorted by group, then address.
    pub fn ordered_nodes(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.group.cmp(&b.group).then_with(|| a.ip.cmp(&b.ip)));
        nodes
    }

    pub fn ordered_groups(&self) -> Vec<&str> {
        self.group_ref.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::messages::{LoadRequest, NodeMeta, NodeResponse};

    fn meta(ip: &str, group: &str) -> NodeMeta {
        NodeMeta {
            host: ip.into(),
            port: 22,
            username: "root".into(),
            group: group.into(),
            ..NodeMeta::default()
        }
    }

    fn response() -> QueryResponse {
        QueryResponse {
            group_counts: BTreeMap::from([("a".to_string(), 2), ("b".to_string(), 1)]),
            nodes: vec![meta("10.0.0.3", "a"), meta("10.0.0.1", "b"), meta("10.0.0.2", "a")],
        }
    }

    /// Serves a fixed view and a settable dirty flag cleared by Query.
    #[derive(Default)]
    struct FakeServer {
        dirty: AtomicBool,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryRpc for FakeServer {
        async fn access(&self, _username: &str) -> Result<()> {
            Ok(())
        }
        async fn users(&self, _username: &str) -> Result<BTreeMap<String, bool>> {
            Err(DirectoryError::EmptyUsers)
        }
        async fn query(&self, _username: &str, groups: &[String]) -> Result<QueryResponse> {
            assert!(groups.is_empty());
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.dirty.store(false, Ordering::SeqCst);
            Ok(response())
        }
        async fn load(&self, _request: LoadRequest) -> Result<Vec<NodeResponse>> {
            Err(DirectoryError::EmptyNodes)
        }
        async fn delete(&self, _username: &str, _groups: &[String]) -> Result<Vec<NodeResponse>> {
            Err(DirectoryError::PermissionDenied)
        }
        async fn dump(&self, _username: &str) -> Result<String> {
            Err(DirectoryError::PermissionDenied)
        }
        async fn decode(&self, _username: &str) -> Result<String> {
            Err(DirectoryError::PermissionDenied)
        }
        async fn cache(&self, _username: &str) -> Result<bool> {
            Ok(self.dirty.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn from_query_indexes_nodes() {
        let cache = LocalCache::from_query(&response()).unwrap();
        assert_eq!(cache.nodes.len(), 3);
        assert_eq!(cache.group_ref["a"], vec!["10.0.0.2", "10.0.0.3"]);
        assert_eq!(cache.groups["b"], 1);

        assert!(matches!(
            LocalCache::from_query(&QueryResponse::default()),
            Err(DirectoryError::EmptyNodes)
        ));
    }

    #[test]
    fn ordering_helpers() {
        let cache = LocalCache::from_query(&response()).unwrap();
        let ips: Vec<&str> = cache.ordered_nodes().iter().map(|n| n.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.3", "10.0.0.1"]);
        assert_eq!(cache.ordered_groups(), vec!["a", "b"]);
    }

    #[test]
    fn file_is_sealed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = LocalCache::from_query(&response()).unwrap();
        cache.save(&path).unwrap();

        let raw = fs::read(&path).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());
        assert_eq!(LocalCache::load(&path).unwrap(), cache);
    }

    #[tokio::test]
    async fn refresh_queries_only_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let server = FakeServer::default();

        // missing file
        LocalCache::refresh(&server, "alice", &path, false).await.unwrap();
        assert_eq!(server.queries.load(Ordering::SeqCst), 1);

        // clean flag, file present
        LocalCache::refresh(&server, "alice", &path, false).await.unwrap();
        assert_eq!(server.queries.load(Ordering::SeqCst), 1);

        server.dirty.store(true, Ordering::SeqCst);
        LocalCache::refresh(&server, "alice", &path, false).await.unwrap();
        assert_eq!(server.queries.load(Ordering::SeqCst), 2);
        assert!(!server.dirty.load(Ordering::SeqCst));

        LocalCache::refresh(&server, "alice", &path, true).await.unwrap();
        assert_eq!(server.queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreadable_cache_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"garbage").unwrap();

        let server = FakeServer::default();
        let cache = LocalCache::refresh(&server, "alice", &path, false).await.unwrap();
        assert_eq!(cache.nodes.len(), 3);
        assert_eq!(LocalCache::load(&path).unwrap(), cache);
    }
}
