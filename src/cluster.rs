//! # Cluster Files
//!
//! A cluster file describes a batch of nodes to register with Load. Fields set
//! at the cluster level are defaults for every node that leaves them empty:
//!
//! ```json
//! {
//!   "user": "root", "password": "test", "port": 22, "group": "image", "tag": "d1",
//!   "nodes": [{ "ip": "10.0.0.1" }, { "ip": "10.0.0.2", "port": 2222, "group": "db" }]
//! }
//! ```
//!
//! The same shape (with empty cluster-level fields) is the plaintext format of
//! the server snapshot.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::Node;
use crate::error::Result;
use crate::messages::{LoadRequest, NodeMeta};

/// Nodes in a generated template.
pub const TEMPLATE_NODE_COUNT: usize = 5;

/// True for a dotted-quad IPv4 literal (surrounding spaces ignored).
pub fn is_valid_ipv4(address: &str) -> bool {
    address.trim().parse::<Ipv4Addr>().is_ok()
}

/// Cluster-level values inherited by nodes that leave a field empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefaults {
    pub user: String,
    pub password: String,
    pub port: u16,
    pub group: String,
    pub tag: String,
}

impl NodeDefaults {
    /// Fill empty fields of `node`, then lowercase its group and tag.
    pub fn fill(&self, node: &mut Node) {
        node.ip = node.ip.trim().to_string();
        if node.port == 0 {
            node.port = self.port;
        }
        if node.user.is_empty() {
            node.user = self.user.clone();
        }
        if node.password.is_empty() {
            node.password = self.password.clone();
        }
        if node.group.is_empty() {
            node.group = self.group.clone();
        }
        if node.tag.is_empty() {
            node.tag = self.tag.clone();
        }
        node.group = node.group.to_lowercase();
        node.tag = node.tag.to_lowercase();
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFile {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
}

impl ClusterFile {
    /// A snapshot-style file: no cluster-level defaults, just nodes.
    pub fn from_nodes(nodes: Vec<Node>) -> ClusterFile {
        ClusterFile {
            nodes,
            ..ClusterFile::default()
        }
    }

    /// Read a cluster file, drop nodes without a valid IPv4 address and
    /// apply the cluster-level defaults to the rest.
    pub fn load(path: impl AsRef<Path>) -> Result<ClusterFile> {
        let bytes = std::fs::read(path.as_ref())?;
        let mut cluster: ClusterFile = serde_json::from_slice(&bytes)?;
        cluster.normalize();
        Ok(cluster)
    }

    pub fn defaults(&self) -> NodeDefaults {
        NodeDefaults {
            user: self.user.clone(),
            password: self.password.clone(),
            port: self.port,
            group: self.group.clone(),
            tag: self.tag.clone(),
        }
    }

    pub fn normalize(&mut self) {
        let defaults = self.defaults();
        self.nodes.retain(|node| {
            let keep = is_valid_ipv4(&node.ip);
            if !keep {
                warn!(ip = %node.ip, "skipping node with invalid address");
            }
            keep
        });
        for node in &mut self.nodes {
            defaults.fill(node);
        }
    }

    pub fn to_load_request(&self, username: &str) -> LoadRequest {
        LoadRequest {
            username: username.to_string(),
            defaults: NodeDefaults {
                group: self.group.to_lowercase(),
                tag: self.tag.to_lowercase(),
                ..self.defaults()
            },
            nodes: self.nodes.iter().map(NodeMeta::from).collect(),
        }
    }

    pub fn template() -> ClusterFile {
        let mut cluster = ClusterFile {
            user: "root".to_string(),
            password: "test".to_string(),
            port: 22,
            group: "image".to_string(),
            tag: "d1".to_string(),
            nodes: Vec::with_capacity(TEMPLATE_NODE_COUNT),
        };
        for i in 0..TEMPLATE_NODE_COUNT {
            cluster.nodes.push(Node {
                ip: format!("127.0.0.{}", i),
                port: cluster.port,
                user: cluster.user.clone(),
                password: cluster.password.clone(),
                tag: cluster.tag.clone(),
                group: String::new(),
            });
        }
        cluster
    }

    pub fn write_template(path: impl AsRef<Path>) -> Result<()> {
        let body = serde_json::to_vec_pretty(&Self::template())?;
        std::fs::write(path, body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_validation() {
        assert!(is_valid_ipv4("10.0.0.1"));
        assert!(is_valid_ipv4(" 192.168.1.255 "));
        assert!(!is_valid_ipv4(""));
        assert!(!is_valid_ipv4("256.0.0.1"));
        assert!(!is_valid_ipv4("10.0.0"));
        assert!(!is_valid_ipv4("host.example"));
    }

    #[test]
    fn node_fields_default_to_cluster_values() {
        let mut cluster: ClusterFile = serde_json::from_str(
            r#"{
                "user": "root", "password": "pw", "port": 22, "group": "Web", "tag": "Prod",
                "nodes": [
                    { "ip": "10.0.0.1" },
                    { "ip": "10.0.0.2", "port": 2222, "user": "ops", "group": "DB" },
                    { "ip": "not-an-ip" },
                    { "ip": "" }
                ]
            }"#,
        )
        .unwrap();
        cluster.normalize();

        assert_eq!(cluster.nodes.len(), 2);
        let first = &cluster.nodes[0];
        assert_eq!((first.port, first.user.as_str(), first.password.as_str()), (22, "root", "pw"));
        assert_eq!((first.group.as_str(), first.tag.as_str()), ("web", "prod"));

        let second = &cluster.nodes[1];
        assert_eq!((second.port, second.user.as_str(), second.group.as_str()), (2222, "ops", "db"));
        assert_eq!(second.password, "pw");
    }

    #[test]
    fn template_has_five_loopback_nodes() {
        let template = ClusterFile::template();
        assert_eq!(template.nodes.len(), TEMPLATE_NODE_COUNT);
        assert_eq!(template.nodes[0].ip, "127.0.0.0");
        assert_eq!(template.nodes[4].ip, "127.0.0.4");
        assert!(template.nodes.iter().all(|n| n.port == 22 && n.user == "root"));
    }

    #[test]
    fn template_loads_back_with_group_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        ClusterFile::write_template(&path).unwrap();

        let cluster = ClusterFile::load(&path).unwrap();
        assert!(cluster.nodes.iter().all(|n| n.group == "image" && n.tag == "d1"));

        let request = cluster.to_load_request("alice@10.1.1.1");
        assert_eq!(request.username, "alice@10.1.1.1");
        assert_eq!(request.nodes.len(), TEMPLATE_NODE_COUNT);
        assert_eq!(request.defaults.group, "image");
    }
}
