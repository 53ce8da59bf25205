//! # Directory Service
//!
//! [`Directory`] is the server context: it owns the authority maps and the
//! store behind one shared mutex, the snapshot engine with its own lock, and
//! the reachability probe used by Load. It is built once at startup and
//! shared (`Arc`) by every connection handler and background task.
//!
//! ## Locking
//!
//! - Every handler holds the shared mutex for its whole body, so Load,
//!   Delete, Query and policy reload are totally ordered. A Query therefore
//!   never clears a dirty flag that a concurrent Load is about to set.
//! - Dump reads the live node list under the shared mutex, releases it, and
//!   then merges into the snapshot under the snapshot lock only.
//!
//! ## Cache coherence
//!
//! Any Load or Delete that changes at least one node marks every user dirty.
//! Only a successful Query clears the caller's own flag; Cache just reads it.
//! Load saves the group index and raises the flags after every stored node,
//! so an interrupted batch never leaves stored nodes outside the index.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::authority::AuthorityMaps;
use crate::cluster::is_valid_ipv4;
use crate::config::ServerConfig;
use crate::entity::{GroupIndex, Node};
use crate::error::{DirectoryError, Result};
use crate::messages::{LoadRequest, NodeMeta, NodeResponse, QueryResponse};
use crate::protocols::DirectoryRpc;
use crate::reachability::ReachabilityProbe;
use crate::snapshot::SnapshotEngine;
use crate::store::Store;

/// Per-node messages reported by Load and Delete.
pub const MSG_SUCCESS: &str = "success";
pub const MSG_FAILED: &str = "failed";
pub const MSG_INVALID_ADDRESS: &str = "invalid address";

struct DirectoryState {
    authority: AuthorityMaps,
    store: Store,
}

impl DirectoryState {
    fn require_access(&self, username: &str) -> Result<()> {
        if self.authority.has_access(username) {
            Ok(())
        } else {
            warn!(user = %username, "permission denied");
            Err(DirectoryError::PermissionDenied)
        }
    }

    fn require_super(&self, username: &str) -> Result<()> {
        if self.authority.has_super_access(username) {
            Ok(())
        } else {
            warn!(user = %username, "superuser permission denied");
            Err(DirectoryError::PermissionDenied)
        }
    }

    /// Every node referenced by the group index, in address order.
    fn live_nodes(&self) -> Result<Vec<Node>> {
        let Some(index) = GroupIndex::fetch(&self.store)? else {
            return Ok(Vec::new());
        };
        let mut nodes = Vec::with_capacity(index.addrs.len());
        for address in &index.addrs {
            match Node::fetch(&self.store, address)? {
                Some(node) => nodes.push(node),
                None => debug!(addr = %address, "indexed address has no node record"),
            }
        }
        Ok(nodes)
    }
}

pub struct Directory {
    state: Mutex<DirectoryState>,
    snapshots: SnapshotEngine,
    probe: Arc<dyn ReachabilityProbe>,
    policy_path: PathBuf,
}

impl Directory {
    pub fn new(
        store: Store,
        authority: AuthorityMaps,
        snapshots: SnapshotEngine,
        probe: Arc<dyn ReachabilityProbe>,
        policy_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state: Mutex::new(DirectoryState { authority, store }),
            snapshots,
            probe,
            policy_path: policy_path.into(),
        }
    }

    /// Open the store and load the policy named by `config`. An invalid
    /// policy fails startup.
    pub fn open(config: &ServerConfig, probe: Arc<dyn ReachabilityProbe>) -> Result<Self> {
        let authority = AuthorityMaps::load(&config.policy_path, false)?;
        let store = Store::open(&config.db_path)?;
        let snapshots = SnapshotEngine::new(&config.snapshot_path, &config.decoded_snapshot_path);
        info!(
            policy = %config.policy_path.display(),
            db = %config.db_path.display(),
            users = authority.user_count(),
            "directory opened"
        );
        Ok(Self::new(store, authority, snapshots, probe, &config.policy_path))
    }

    pub fn policy_path(&self) -> &Path {
        &self.policy_path
    }

    /// Rebuild the authority maps from the policy file and mark every user
    /// dirty. On failure the current maps stay authoritative.
    pub async fn reload_policy(&self) -> Result<usize> {
        let fresh = AuthorityMaps::load(&self.policy_path, true)?;
        let mut state = self.state.lock().await;
        state.authority = fresh;
        state.authority.mark_all_dirty();
        let users = state.authority.user_count();
        info!(path = %self.policy_path.display(), users, "policy reloaded");
        Ok(users)
    }

    /// Merge the live directory into the snapshot. Used by the periodic
    /// ticker and by the Dump RPC once permission is checked.
    pub async fn dump_snapshot(&self) -> Result<usize> {
        let live = {
            let state = self.state.lock().await;
            state.live_nodes()?
        };
        self.snapshots.dump(live).await
    }
}

#[async_trait]
impl DirectoryRpc for Directory {
    async fn access(&self, username: &str) -> Result<()> {
        let state = self.state.lock().await;
        state.require_access(username)?;
        debug!(user = %username, "access granted");
        Ok(())
    }

    async fn users(&self, username: &str) -> Result<BTreeMap<String, bool>> {
        let state = self.state.lock().await;
        state.require_access(username)?;
        let users = state.authority.users();
        if users.is_empty() {
            return Err(DirectoryError::EmptyUsers);
        }
        Ok(users)
    }

    async fn query(&self, username: &str, groups: &[String]) -> Result<QueryResponse> {
        let mut state = self.state.lock().await;
        state.require_access(username)?;

        let index = GroupIndex::fetch(&state.store)?.ok_or(DirectoryError::EmptyGroup)?;
        let requested: Vec<String> = if groups.is_empty() {
            index.groups.iter().cloned().collect()
        } else {
            groups.iter().map(|g| g.to_lowercase()).collect()
        };

        let mut current: BTreeSet<&str> = BTreeSet::new();
        for group in &requested {
            let members = index.members(group);
            if members.is_empty() {
                debug!(user = %username, group = %group, "queried group has no members");
                return Err(DirectoryError::EmptyGroup);
            }
            current.extend(members.iter().map(String::as_str));
        }

        let visible: Vec<String> = if state.authority.has_super_access(username) {
            current.iter().map(|a| a.to_string()).collect()
        } else {
            let mut granted: Vec<String> = state
                .authority
                .grants(username)
                .iter()
                .filter(|a| current.contains(a.as_str()))
                .cloned()
                .collect();
            granted.sort();
            granted
        };
        if visible.is_empty() {
            return Err(DirectoryError::EmptyNodes);
        }

        let mut response = QueryResponse::default();
        for address in &visible {
            match Node::fetch(&state.store, address)? {
                Some(node) => {
                    *response.group_counts.entry(node.group.to_lowercase()).or_insert(0) += 1;
                    response.nodes.push(NodeMeta::from(&node));
                }
                None => warn!(addr = %address, "visible address has no node record"),
            }
        }
        if response.nodes.is_empty() {
            return Err(DirectoryError::EmptyNodes);
        }

        state.authority.clear_dirty(username);
        info!(
            user = %username,
            groups = requested.len(),
            nodes = response.nodes.len(),
            "query served"
        );
        Ok(response)
    }

    async fn load(&self, request: LoadRequest) -> Result<Vec<NodeResponse>> {
        let mut state = self.state.lock().await;
        state.require_access(&request.username)?;
        if request.nodes.is_empty() {
            return Err(DirectoryError::EmptyNodes);
        }

        let mut index = GroupIndex::fetch(&state.store)?.unwrap_or_default();
        let mut responses = Vec::with_capacity(request.nodes.len());
        let mut changed = 0usize;

        for meta in request.nodes {
            let mut node = Node::from(meta);
            request.defaults.fill(&mut node);
            let mut response = NodeResponse {
                addr: node.ip.clone(),
                group: node.group.clone(),
                message: String::new(),
            };

            if !is_valid_ipv4(&node.ip) {
                response.message = MSG_INVALID_ADDRESS.to_string();
                responses.push(response);
                continue;
            }
            if let Err(e) = self.probe.check(&node).await {
                warn!(addr = %node.ip, error = %e, "node failed reachability check");
                response.message = MSG_FAILED.to_string();
                responses.push(response);
                continue;
            }

            let current = Node::fetch(&state.store, &node.ip)?;
            let indexed = index.members(&node.group).iter().any(|a| a == &node.ip);
            if indexed && current.as_ref() == Some(&node) {
                response.message = format!("node {} exists", node.ip);
                responses.push(response);
                continue;
            }

            match node.save(&state.store) {
                Ok(()) => {
                    if let Some(previous) = &current
                        && previous.group != node.group
                    {
                        index.remove_member(&previous.group, &node.ip);
                    }
                    index.add_member(&node.group, &node.ip);
                    // committed per node so a batch cut short leaves the index
                    // and the dirty flags matching the store
                    index.save(&state.store)?;
                    state.authority.mark_all_dirty();
                    changed += 1;
                    debug!(addr = %node.ip, group = %node.group, "node stored");
                    response.message = MSG_SUCCESS.to_string();
                }
                Err(e) => {
                    warn!(addr = %node.ip, error = %e, "failed to store node");
                    response.message = e.to_string();
                }
            }
            responses.push(response);
        }

        info!(
            user = %request.username,
            submitted = responses.len(),
            changed,
            "load processed"
        );
        Ok(responses)
    }

    async fn delete(&self, username: &str, groups: &[String]) -> Result<Vec<NodeResponse>> {
        let mut state = self.state.lock().await;
        state.require_super(username)?;

        let mut index = GroupIndex::fetch(&state.store)?.ok_or(DirectoryError::EmptyGroup)?;
        let targets: Vec<String> = if groups.is_empty() {
            index.groups.iter().cloned().collect()
        } else {
            groups.iter().map(|g| g.to_lowercase()).collect()
        };

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut responses = Vec::new();
        for group in &targets {
            for address in index.remove_group(group) {
                if !seen.insert(address.clone()) {
                    continue;
                }
                let message = match Node::delete(&state.store, &address) {
                    Ok(()) => MSG_SUCCESS,
                    Err(e) => {
                        warn!(addr = %address, error = %e, "failed to delete node");
                        MSG_FAILED
                    }
                };
                index.forget_address(&address);
                responses.push(NodeResponse {
                    addr: address,
                    group: group.clone(),
                    message: message.to_string(),
                });
            }
        }

        index.save(&state.store)?;
        if !seen.is_empty() {
            state.authority.mark_all_dirty();
        }
        info!(user = %username, groups = targets.len(), deleted = seen.len(), "delete processed");
        Ok(responses)
    }

    async fn dump(&self, username: &str) -> Result<String> {
        let live = {
            let state = self.state.lock().await;
            state.require_super(username)?;
            state.live_nodes()?
        };
        let added = self.snapshots.dump(live).await?;
        info!(user = %username, added, "dump requested");
        Ok(format!("dump {} success on server", self.snapshots.snapshot_path().display()))
    }

    async fn decode(&self, username: &str) -> Result<String> {
        {
            let state = self.state.lock().await;
            state.require_super(username)?;
        }
        let path = self.snapshots.decode().await?;
        info!(user = %username, path = %path.display(), "decode requested");
        Ok("decode success".to_string())
    }

    async fn cache(&self, username: &str) -> Result<bool> {
        let state = self.state.lock().await;
        state.require_access(username)?;
        Ok(state.authority.is_dirty(username))
    }
}
