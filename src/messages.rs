//! # Wire Protocol Messages
//!
//! Serializable request/response types for the directory RPC surface.
//! Messages are serialized using bincode with size limits to prevent memory
//! exhaustion.
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | Access | `RpcRequest::Access` | `RpcResponse::Access` |
//! | User | `RpcRequest::User` | `RpcResponse::Users` |
//! | Query | `RpcRequest::Query` | `RpcResponse::Query` |
//! | Load | `RpcRequest::Load` | `RpcResponse::Load` |
//! | Delete | `RpcRequest::Delete` | `RpcResponse::Delete` |
//! | Dump | `RpcRequest::Dump` | `RpcResponse::Dump` |
//! | Decode | `RpcRequest::Decode` | `RpcResponse::Decode` |
//! | Cache | `RpcRequest::Cache` | `RpcResponse::Cache` |
//!
//! Any operation may instead answer `RpcResponse::Error { kind, message }`.
//!
//! The `username` carried by every request is the caller identity string
//! (`login@address`); it is the only authorization input.

use std::collections::BTreeMap;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::cluster::NodeDefaults;
use crate::entity::Node;
use crate::error::ErrorKind;

/// Maximum buffer size for deserialization. A full Query answer for a large
/// fleet is the biggest message.
pub const MAX_DESERIALIZE_SIZE: u64 = 8 * 1024 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_request(request: &RpcRequest) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(request)
}

pub fn deserialize_request(data: &[u8]) -> Result<RpcRequest, bincode::Error> {
    bincode_options().deserialize(data)
}

pub fn serialize_response(response: &RpcResponse) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(response)
}

/// A node as exchanged over the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tag: String,
    pub group: String,
}

impl From<&Node> for NodeMeta {
    fn from(node: &Node) -> Self {
        NodeMeta {
            host: node.ip.clone(),
            port: node.port,
            username: node.user.clone(),
            password: node.password.clone(),
            tag: node.tag.clone(),
            group: node.group.clone(),
        }
    }
}

impl From<NodeMeta> for Node {
    fn from(meta: NodeMeta) -> Self {
        Node {
            ip: meta.host,
            port: meta.port,
            user: meta.username,
            password: meta.password,
            tag: meta.tag,
            group: meta.group,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub username: String,
    /// Cluster-level values for node fields left empty.
    pub defaults: NodeDefaults,
    pub nodes: Vec<NodeMeta>,
}

/// Per-node outcome of Load and Delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResponse {
    pub addr: String,
    pub group: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Visible node count per lowercased group.
    pub group_counts: BTreeMap<String, i32>,
    pub nodes: Vec<NodeMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    Access { username: String },
    User { username: String },
    Query { username: String, groups: Vec<String> },
    Load(LoadRequest),
    Delete { username: String, groups: Vec<String> },
    Dump { username: String },
    Decode { username: String },
    Cache { username: String },
}

impl RpcRequest {
    /// The caller identity the request claims.
    pub fn username(&self) -> &str {
        match self {
            RpcRequest::Access { username }
            | RpcRequest::User { username }
            | RpcRequest::Query { username, .. }
            | RpcRequest::Delete { username, .. }
            | RpcRequest::Dump { username }
            | RpcRequest::Decode { username }
            | RpcRequest::Cache { username } => username,
            RpcRequest::Load(load) => &load.username,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            RpcRequest::Access { .. } => "access",
            RpcRequest::User { .. } => "user",
            RpcRequest::Query { .. } => "query",
            RpcRequest::Load(_) => "load",
            RpcRequest::Delete { .. } => "delete",
            RpcRequest::Dump { .. } => "dump",
            RpcRequest::Decode { .. } => "decode",
            RpcRequest::Cache { .. } => "cache",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Access,

    Users(BTreeMap<String, bool>),

    Query(QueryResponse),

    Load(Vec<NodeResponse>),

    Delete(Vec<NodeResponse>),

    Dump { message: String },

    Decode { message: String },

    /// 1 when the caller's cached view is stale.
    Cache { dirty: u8 },

    Error { kind: ErrorKind, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_request(nodes: usize) -> RpcRequest {
        RpcRequest::Load(LoadRequest {
            username: "alice@10.1.1.1".to_string(),
            defaults: NodeDefaults {
                user: "root".into(),
                port: 22,
                ..NodeDefaults::default()
            },
            nodes: (0..nodes)
                .map(|i| NodeMeta {
                    host: format!("10.0.{}.{}", i / 256, i % 256),
                    ..NodeMeta::default()
                })
                .collect(),
        })
    }

    #[test]
    fn bounded_deserialization_normal_payloads() {
        let bytes = serialize_request(&load_request(100)).unwrap();
        assert_eq!(deserialize_request(&bytes).unwrap(), load_request(100));
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_request(&garbage).is_err());

        let bytes = serialize_request(&RpcRequest::Access {
            username: "alice@10.1.1.1".into(),
        })
        .unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_request(truncated).is_err());
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        // A string claiming more bytes than the limit must not be allocated.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_le_bytes()); // Access variant
        bytes.extend_from_slice(&(MAX_DESERIALIZE_SIZE * 4).to_le_bytes());
        assert!(deserialize_request(&bytes).is_err());
    }

    #[test]
    fn username_extraction() {
        let requests = vec![
            RpcRequest::Access { username: "u@h".into() },
            RpcRequest::Query { username: "u@h".into(), groups: vec!["web".into()] },
            RpcRequest::Delete { username: "u@h".into(), groups: vec![] },
            RpcRequest::Cache { username: "u@h".into() },
        ];
        for request in requests {
            assert_eq!(request.username(), "u@h");
        }
        assert_eq!(load_request(1).username(), "alice@10.1.1.1");
        assert_eq!(load_request(1).operation(), "load");
    }

    #[test]
    fn error_response_round_trip() {
        let response = RpcResponse::Error {
            kind: ErrorKind::PermissionDenied,
            message: "permission denied".into(),
        };
        let bytes = serialize_response(&response).unwrap();
        let decoded: RpcResponse = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn node_meta_mirrors_node() {
        let node = Node {
            ip: "10.0.0.1".into(),
            port: 22,
            user: "root".into(),
            password: "pw".into(),
            tag: "d1".into(),
            group: "web".into(),
        };
        let meta = NodeMeta::from(&node);
        assert_eq!(meta.host, "10.0.0.1");
        assert_eq!(Node::from(meta), node);
    }
}
