//! Protocol trait for the directory RPC surface.
//!
//! [`DirectoryRpc`] has one method per operation. It is implemented twice:
//!
//! | Implementor | Where | Purpose |
//! |-------------|-------|---------|
//! | [`crate::Directory`] | server | runs the handler in-process |
//! | [`crate::RpcClient`] | client | forwards the call over QUIC |
//!
//! Code written against the trait (the client cache refresh, tests) works the
//! same against either side.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::{LoadRequest, NodeResponse, QueryResponse};

#[async_trait]
pub trait DirectoryRpc: Send + Sync {
    /// Liveness/login check.
    async fn access(&self, username: &str) -> Result<()>;

    /// All known users, with whether each is a superuser.
    async fn users(&self, username: &str) -> Result<BTreeMap<String, bool>>;

    /// Nodes visible to `username` in `groups` (all groups when empty).
    /// Clears the caller's cache-dirty flag on success.
    async fn query(&self, username: &str, groups: &[String]) -> Result<QueryResponse>;

    /// Register or update nodes; per-node outcomes are in the result list.
    async fn load(&self, request: LoadRequest) -> Result<Vec<NodeResponse>>;

    /// Superuser only: remove `groups` (all groups when empty) and their nodes.
    async fn delete(&self, username: &str, groups: &[String]) -> Result<Vec<NodeResponse>>;

    /// Superuser only: merge the directory into the snapshot file.
    async fn dump(&self, username: &str) -> Result<String>;

    /// Superuser only: write the snapshot out as plaintext.
    async fn decode(&self, username: &str) -> Result<String>;

    /// Whether the caller's cached view is stale. Does not clear the flag.
    async fn cache(&self, username: &str) -> Result<bool>;
}
