//! # Entity Layer
//!
//! Typed views over the [`Store`]: every record is JSON, sealed with
//! [`crate::codec`] before it touches disk.
//!
//! - [`Node`]: one machine, keyed by its address (the sole identity)
//! - [`GroupIndex`]: the single aggregate record mapping group names to member
//!   addresses; every mutation rewrites the whole record
//!
//! Equality is field-wise over all attributes (derived `PartialEq`); Load uses
//! it to skip no-op writes so unchanged submissions do not invalidate caches.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{DirectoryError, Result};
use crate::store::{Bucket, GROUP_INDEX_KEY, Store};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub ip: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
}

impl Node {
    /// Absent is `Ok(None)`; a record that cannot be opened is an error.
    pub fn fetch(store: &Store, address: &str) -> Result<Option<Node>> {
        match store.get(Bucket::Node, address)? {
            Some(sealed) => Ok(Some(codec::open_json(&sealed)?)),
            None => Ok(None),
        }
    }

    /// Idempotent upsert keyed by address.
    pub fn save(&self, store: &Store) -> Result<()> {
        let sealed = codec::seal_json(self)?;
        store.put(Bucket::Node, &self.ip, &sealed)
    }

    pub fn delete(store: &Store, address: &str) -> Result<()> {
        if store.delete(Bucket::Node, address)? {
            Ok(())
        } else {
            Err(DirectoryError::NotFound(format!("node {}", address)))
        }
    }
}

/// Group membership for the whole directory.
///
/// Invariants maintained by the mutators:
/// - `refs[g]` holds no duplicate address
/// - `addrs` is the union of all `refs` values
/// - `groups` holds exactly the groups with at least one member
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupIndex {
    pub groups: BTreeSet<String>,
    #[serde(rename = "ref")]
    pub refs: BTreeMap<String, Vec<String>>,
    #[serde(rename = "hosts")]
    pub addrs: BTreeSet<String>,
}

impl GroupIndex {
    pub fn fetch(store: &Store) -> Result<Option<GroupIndex>> {
        match store.get(Bucket::Group, GROUP_INDEX_KEY)? {
            Some(sealed) => Ok(Some(codec::open_json(&sealed)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, store: &Store) -> Result<()> {
        let sealed = codec::seal_json(self)?;
        store.put(Bucket::Group, GROUP_INDEX_KEY, &sealed)
    }

    pub fn delete(store: &Store) -> Result<()> {
        if store.delete(Bucket::Group, GROUP_INDEX_KEY)? {
            Ok(())
        } else {
            Err(DirectoryError::NotFound("group index".to_string()))
        }
    }

    pub fn members(&self, group: &str) -> &[String] {
        self.refs.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns false when the address was already a member.
    pub fn add_member(&mut self, group: &str, address: &str) -> bool {
        self.groups.insert(group.to_string());
        self.addrs.insert(address.to_string());
        let members = self.refs.entry(group.to_string()).or_default();
        if members.iter().any(|a| a == address) {
            return false;
        }
        members.push(address.to_string());
        true
    }

    /// Drop `address` from `group`; an emptied group leaves the index.
    pub fn remove_member(&mut self, group: &str, address: &str) {
        if let Some(members) = self.refs.get_mut(group) {
            members.retain(|a| a != address);
            if members.is_empty() {
                self.refs.remove(group);
                self.groups.remove(group);
            }
        }
        if !self.refs.values().any(|m| m.iter().any(|a| a == address)) {
            self.addrs.remove(address);
        }
    }

    /// Drop `address` from every group and from the address set.
    pub fn forget_address(&mut self, address: &str) {
        let holding: Vec<String> = self
            .refs
            .iter()
            .filter(|(_, members)| members.iter().any(|a| a == address))
            .map(|(group, _)| group.clone())
            .collect();
        for group in holding {
            self.remove_member(&group, address);
        }
        self.addrs.remove(address);
    }

    /// Remove a group and return its former members.
    pub fn remove_group(&mut self, group: &str) -> Vec<String> {
        self.groups.remove(group);
        let members = self.refs.remove(group).unwrap_or_default();
        for address in &members {
            if !self.refs.values().any(|m| m.contains(address)) {
                self.addrs.remove(address);
            }
        }
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ip: &str, group: &str) -> Node {
        Node {
            ip: ip.to_string(),
            port: 22,
            user: "root".to_string(),
            password: "secret".to_string(),
            tag: "d1".to_string(),
            group: group.to_string(),
        }
    }

    #[test]
    fn node_fetch_absent_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(Node::fetch(&store, "10.0.0.1").unwrap(), None);
    }

    #[test]
    fn node_save_then_fetch() {
        let store = Store::open_in_memory().unwrap();
        let n = node("10.0.0.1", "web");
        n.save(&store).unwrap();
        assert_eq!(Node::fetch(&store, "10.0.0.1").unwrap(), Some(n));
    }

    #[test]
    fn node_records_are_sealed_at_rest() {
        let store = Store::open_in_memory().unwrap();
        node("10.0.0.1", "web").save(&store).unwrap();
        let raw = store.get(Bucket::Node, "10.0.0.1").unwrap().unwrap();
        assert!(serde_json::from_slice::<Node>(&raw).is_err());
        assert!(!String::from_utf8_lossy(&raw).contains("secret"));
    }

    #[test]
    fn node_delete_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = Node::delete(&store, "10.0.0.9").unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[test]
    fn node_equality_covers_every_field() {
        let base = node("10.0.0.1", "web");
        assert_eq!(base, base.clone());

        let mut other = base.clone();
        other.password = "changed".to_string();
        assert_ne!(base, other);

        let mut other = base.clone();
        other.tag = String::new();
        assert_ne!(base, other);

        let mut other = base.clone();
        other.port = 2222;
        assert_ne!(base, other);
    }

    #[test]
    fn node_json_omits_empty_tag_and_group() {
        let mut n = node("10.0.0.1", "");
        n.tag.clear();
        let json = serde_json::to_string(&n).unwrap();
        assert!(!json.contains("tag"));
        assert!(!json.contains("group"));
    }

    #[test]
    fn group_membership_stays_duplicate_free() {
        let mut index = GroupIndex::default();
        assert!(index.add_member("web", "10.0.0.1"));
        assert!(!index.add_member("web", "10.0.0.1"));
        assert!(index.add_member("web", "10.0.0.2"));
        assert_eq!(index.members("web"), ["10.0.0.1", "10.0.0.2"]);
        assert_eq!(index.addrs.len(), 2);
    }

    #[test]
    fn emptied_group_leaves_the_index() {
        let mut index = GroupIndex::default();
        index.add_member("web", "10.0.0.1");
        index.add_member("db", "10.0.0.2");
        index.remove_member("web", "10.0.0.1");

        assert!(!index.groups.contains("web"));
        assert!(!index.refs.contains_key("web"));
        assert!(!index.addrs.contains("10.0.0.1"));
        assert!(index.addrs.contains("10.0.0.2"));
    }

    #[test]
    fn remove_group_returns_members() {
        let mut index = GroupIndex::default();
        index.add_member("web", "10.0.0.1");
        index.add_member("web", "10.0.0.2");
        index.add_member("db", "10.0.0.3");

        let removed = index.remove_group("web");
        assert_eq!(removed, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        assert_eq!(index.addrs.iter().collect::<Vec<_>>(), vec!["10.0.0.3"]);
        assert_eq!(index.groups.iter().collect::<Vec<_>>(), vec!["db"]);
    }

    #[test]
    fn group_index_persists() {
        let store = Store::open_in_memory().unwrap();
        assert!(GroupIndex::fetch(&store).unwrap().is_none());

        let mut index = GroupIndex::default();
        index.add_member("web", "10.0.0.1");
        index.save(&store).unwrap();
        assert_eq!(GroupIndex::fetch(&store).unwrap(), Some(index));

        GroupIndex::delete(&store).unwrap();
        assert!(GroupIndex::fetch(&store).unwrap().is_none());
        assert!(matches!(GroupIndex::delete(&store), Err(DirectoryError::NotFound(_))));
    }
}
