//! # Authority Manager
//!
//! Turns the declarative policy file into the two in-memory maps every RPC
//! consults:
//!
//! | Map | Key | Value |
//! |-----|-----|-------|
//! | access index | user name | deduplicated visible addresses |
//! | user authority | user name | privilege + cache-dirty flag |
//!
//! Both maps live in one [`AuthorityMaps`] value that is always rebuilt
//! wholesale and swapped in as a unit; they are never patched per user.
//!
//! ## Grant rules
//!
//! For each policy entry, in file order: the public address list is granted
//! unconditionally, and a normal user (privilege 0) is additionally granted
//! the entry's explicit addresses. A superuser's explicit list is ignored; its
//! unrestricted view is computed on demand by the directory. Repeated entries
//! for one user merge their grants and the first entry fixes the privilege.
//!
//! ## Policy file
//!
//! ```json
//! {
//!   "pubAddresses": ["10.0.0.1"],
//!   "userRefNodes": [{ "name": "alice", "type": 0, "addresses": ["10.0.0.2"] }]
//! }
//! ```
//!
//! The older spellings `pub_nodes`, `user_ref_nodes` and `uname` are accepted.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DirectoryError, Result};

/// Pending change notifications beyond this are coalesced.
const WATCH_CHANNEL_SIZE: usize = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityConfig {
    #[serde(rename = "pubAddresses", alias = "pub_nodes", default)]
    pub public_addresses: Vec<String>,
    #[serde(rename = "userRefNodes", alias = "user_ref_nodes", default)]
    pub user_ref_nodes: Vec<UserRefNode>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRefNode {
    #[serde(alias = "uname")]
    pub name: String,
    /// 0 = normal, 1 = super; anything else is read as normal.
    #[serde(rename = "type", default)]
    pub privilege: i64,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    Normal,
    Super,
}

impl From<i64> for Privilege {
    fn from(level: i64) -> Self {
        if level == 1 { Privilege::Super } else { Privilege::Normal }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserAuthority {
    pub privilege: Privilege,
    pub dirty: bool,
}

impl AuthorityConfig {
    /// Read and parse a policy file. Missing, unparseable and empty-user
    /// policies are all rejected.
    pub fn load(path: impl AsRef<Path>) -> Result<AuthorityConfig> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| DirectoryError::Policy(format!("{}: {}", path.display(), e)))?;
        let config: AuthorityConfig = serde_json::from_slice(&bytes)
            .map_err(|e| DirectoryError::Policy(format!("{}: {}", path.display(), e)))?;
        if config.user_ref_nodes.is_empty() {
            return Err(DirectoryError::Policy(format!(
                "{}: userRefNodes is empty",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Starter policy: two public loopback addresses granted to `user`.
    pub fn template(user: &str) -> AuthorityConfig {
        let addresses: Vec<String> = (1..=2).map(|i| format!("127.0.0.{}", i)).collect();
        AuthorityConfig {
            public_addresses: addresses.clone(),
            user_ref_nodes: vec![UserRefNode {
                name: user.to_string(),
                privilege: 0,
                addresses,
            }],
        }
    }

    pub fn write_template(path: impl AsRef<Path>, user: &str) -> Result<()> {
        let body = serde_json::to_vec_pretty(&Self::template(user))?;
        std::fs::write(path, body)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct AuthorityMaps {
    access: BTreeMap<String, Vec<String>>,
    users: BTreeMap<String, UserAuthority>,
}

impl AuthorityMaps {
    /// Build fresh maps. Every user starts with `dirty = is_reload`, so a
    /// successful reload invalidates every client cache.
    pub fn build(config: &AuthorityConfig, is_reload: bool) -> Result<AuthorityMaps> {
        if config.user_ref_nodes.is_empty() {
            return Err(DirectoryError::Policy("userRefNodes is empty".to_string()));
        }

        let mut maps = AuthorityMaps::default();
        let mut seen: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for entry in &config.user_ref_nodes {
            let privilege = Privilege::from(entry.privilege);
            let granted = maps.access.entry(entry.name.clone()).or_default();
            let granted_set = seen.entry(entry.name.clone()).or_default();

            for address in &config.public_addresses {
                if granted_set.insert(address.clone()) {
                    granted.push(address.clone());
                }
            }
            if privilege == Privilege::Normal {
                for address in &entry.addresses {
                    if granted_set.insert(address.clone()) {
                        granted.push(address.clone());
                    }
                }
            }

            maps.users.entry(entry.name.clone()).or_insert(UserAuthority {
                privilege,
                dirty: is_reload,
            });
            debug!(user = %entry.name, access = ?granted, "registered user");
        }

        Ok(maps)
    }

    pub fn load(path: impl AsRef<Path>, is_reload: bool) -> Result<AuthorityMaps> {
        let config = AuthorityConfig::load(path)?;
        Self::build(&config, is_reload)
    }

    pub fn has_access(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }

    pub fn has_super_access(&self, user: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|u| u.privilege == Privilege::Super)
    }

    /// Addresses granted to `user` through the access index.
    pub fn grants(&self, user: &str) -> &[String] {
        self.access.get(user).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_dirty(&self, user: &str) -> bool {
        self.users.get(user).is_some_and(|u| u.dirty)
    }

    pub fn clear_dirty(&mut self, user: &str) {
        if let Some(u) = self.users.get_mut(user) {
            u.dirty = false;
        }
    }

    pub fn mark_all_dirty(&mut self) {
        for u in self.users.values_mut() {
            u.dirty = true;
        }
    }

    /// Every known user with whether it is a superuser.
    pub fn users(&self) -> BTreeMap<String, bool> {
        self.users
            .iter()
            .map(|(name, u)| (name.clone(), u.privilege == Privilege::Super))
            .collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

/// Filesystem watch on the policy file.
///
/// The parent directory is watched rather than the file itself, so editors
/// that replace the file via rename keep being observed. Each relevant event
/// becomes one `()` on the receiver returned by [`PolicyWatcher::start`];
/// bursts are coalesced by the bounded channel.
pub struct PolicyWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl PolicyWatcher {
    pub fn start(path: impl AsRef<Path>) -> Result<(PolicyWatcher, mpsc::Receiver<()>)> {
        let path = path.as_ref().to_path_buf();
        let file_name: OsString = path
            .file_name()
            .ok_or_else(|| DirectoryError::Policy(format!("{}: not a file path", path.display())))?
            .to_os_string();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let touches_policy = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if touches_policy {
                    // full channel means a reload is already pending
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "policy watch error"),
        };

        let mut watcher = RecommendedWatcher::new(handler, notify::Config::default())
            .map_err(|e| DirectoryError::Policy(format!("watch {}: {}", dir.display(), e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| DirectoryError::Policy(format!("watch {}: {}", dir.display(), e)))?;

        info!(path = %path.display(), "watching policy file");
        Ok((PolicyWatcher { _watcher: watcher, path }, rx))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice_policy() -> AuthorityConfig {
        AuthorityConfig {
            public_addresses: vec!["10.0.0.1".into()],
            user_ref_nodes: vec![
                UserRefNode {
                    name: "alice".into(),
                    privilege: 0,
                    addresses: vec!["10.0.0.2".into(), "10.0.0.1".into()],
                },
                UserRefNode {
                    name: "root".into(),
                    privilege: 1,
                    addresses: vec!["10.0.0.9".into()],
                },
            ],
        }
    }

    #[test]
    fn normal_user_gets_public_and_explicit_grants() {
        let maps = AuthorityMaps::build(&alice_policy(), false).unwrap();
        assert_eq!(maps.grants("alice"), ["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn superuser_gets_only_public_grants() {
        let maps = AuthorityMaps::build(&alice_policy(), false).unwrap();
        assert_eq!(maps.grants("root"), ["10.0.0.1"]);
        assert!(maps.has_super_access("root"));
        assert!(!maps.has_super_access("alice"));
    }

    #[test]
    fn unknown_user_has_no_access() {
        let maps = AuthorityMaps::build(&alice_policy(), false).unwrap();
        assert!(maps.has_access("alice"));
        assert!(!maps.has_access("mallory"));
        assert!(!maps.has_super_access("mallory"));
        assert!(maps.grants("mallory").is_empty());
    }

    #[test]
    fn out_of_range_privilege_is_normal() {
        let mut policy = alice_policy();
        policy.user_ref_nodes[0].privilege = 7;
        let maps = AuthorityMaps::build(&policy, false).unwrap();
        assert!(!maps.has_super_access("alice"));
        assert_eq!(maps.grants("alice").len(), 2);
    }

    #[test]
    fn dirty_flag_starts_at_reload_state() {
        let fresh = AuthorityMaps::build(&alice_policy(), false).unwrap();
        assert!(!fresh.is_dirty("alice"));
        let reloaded = AuthorityMaps::build(&alice_policy(), true).unwrap();
        assert!(reloaded.is_dirty("alice"));
        assert!(reloaded.is_dirty("root"));
    }

    #[test]
    fn repeated_user_merges_grants_first_privilege_wins() {
        let mut policy = alice_policy();
        policy.user_ref_nodes.push(UserRefNode {
            name: "alice".into(),
            privilege: 1,
            addresses: vec!["10.0.0.3".into()],
        });
        let maps = AuthorityMaps::build(&policy, false).unwrap();
        assert!(!maps.has_super_access("alice"));
        assert_eq!(maps.grants("alice"), ["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn empty_user_list_is_rejected() {
        let policy = AuthorityConfig {
            public_addresses: vec!["10.0.0.1".into()],
            user_ref_nodes: vec![],
        };
        assert!(matches!(
            AuthorityMaps::build(&policy, false),
            Err(DirectoryError::Policy(_))
        ));
    }

    #[test]
    fn load_accepts_legacy_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"pub_nodes":["10.0.0.1"],"user_ref_nodes":[{"uname":"bob","type":0,"addresses":["10.0.0.5"]}]}"#,
        )
        .unwrap();
        let maps = AuthorityMaps::load(&path, false).unwrap();
        assert_eq!(maps.grants("bob"), ["10.0.0.1", "10.0.0.5"]);
    }

    #[test]
    fn load_rejects_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(AuthorityMaps::load(&missing, false), Err(DirectoryError::Policy(_))));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(AuthorityMaps::load(&broken, false), Err(DirectoryError::Policy(_))));
    }

    #[test]
    fn template_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        AuthorityConfig::write_template(&path, "carol").unwrap();
        let maps = AuthorityMaps::load(&path, false).unwrap();
        assert_eq!(maps.grants("carol"), ["127.0.0.1", "127.0.0.2"]);
        assert_eq!(maps.users(), BTreeMap::from([("carol".to_string(), false)]));
    }

    #[test]
    fn clear_dirty_is_per_user() {
        let mut maps = AuthorityMaps::build(&alice_policy(), true).unwrap();
        maps.clear_dirty("alice");
        assert!(!maps.is_dirty("alice"));
        assert!(maps.is_dirty("root"));
        maps.mark_all_dirty();
        assert!(maps.is_dirty("alice"));
    }

    #[tokio::test]
    async fn watcher_reports_policy_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        AuthorityConfig::write_template(&path, "dave").unwrap();

        let (_watcher, mut rx) = PolicyWatcher::start(&path).unwrap();
        std::fs::write(&path, serde_json::to_vec(&alice_policy()).unwrap()).unwrap();

        let notified = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(notified, Ok(Some(()))));
    }
}
