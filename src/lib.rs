//! # Fleetdir - Fleet Node Directory
//!
//! Fleetdir is a small directory server for a fleet of remotely managed hosts.
//! It keeps a persistent registry of nodes grouped by name, decides which
//! nodes each user may see from a declarative policy file, and tells clients
//! when their locally cached view has gone stale.
//!
//! - **Registry**: node records and a group index in an embedded SQLite store,
//!   every value sealed with a fixed-key AES-256-CFB codec
//! - **Authority**: per-user grants and privilege, rebuilt from the policy file
//!   at startup and on every change to it
//! - **Cache coherence**: any change marks all users dirty; a user's Query
//!   clears only that user's flag
//! - **Snapshots**: append-only sealed JSON copy of the registry, merged
//!   periodically and on demand
//!
//! ## Architecture
//!
//! One [`Directory`] owns the authority maps and the store behind a single
//! mutex, so every handler sees and leaves a consistent state. [`Server`]
//! exposes it over QUIC; [`RpcClient`] is the matching client. Both implement
//! [`DirectoryRpc`], as does [`Directory`] itself.
//!
//! ## Security Model
//!
//! - Clients pin the server's Ed25519 identity; the server certificate must match
//! - The caller identity (`login@address`) is self-declared and is the only
//!   input to authorization; it has no cryptographic integrity
//! - Sealed files and store values use a key compiled into the binary and
//!   protect against casual inspection only
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `error` | `DirectoryError` taxonomy and its wire classification |
//! | `codec` | Seal/open for stored and exported bytes |
//! | `store` | Two-bucket SQLite byte store |
//! | `entity` | `Node` and `GroupIndex` records |
//! | `authority` | Policy file, access maps, file watcher |
//! | `cluster` | Cluster-load files, node defaults, templates |
//! | `reachability` | Remote shell probe run before a node is stored |
//! | `snapshot` | Snapshot merge, dump and decode |
//! | `directory` | Server context and all RPC handlers |
//! | `cache` | Client-side cache file and refresh protocol |
//! | `identity` | Endpoint keypairs, caller identity |
//! | `crypto` | TLS certificate generation and verification |
//! | `protocols` | `DirectoryRpc` trait |
//! | `messages` | Wire types and bounded bincode codec |
//! | `rpc` | QUIC framing, server dispatch, `RpcClient` |
//! | `config` | `ServerConfig` |
//! | `server` | Endpoint, listener and background tasks |

mod authority;
mod cache;
mod cluster;
pub mod codec;
mod config;
mod crypto;
mod directory;
mod entity;
mod error;
mod identity;
mod messages;
mod protocols;
mod reachability;
mod rpc;
mod server;
mod snapshot;
mod store;

pub use authority::{AuthorityConfig, AuthorityMaps, PolicyWatcher, Privilege, UserAuthority, UserRefNode};
pub use cache::LocalCache;
pub use cluster::{ClusterFile, NodeDefaults, is_valid_ipv4};
pub use config::ServerConfig;
pub use directory::{Directory, MSG_FAILED, MSG_INVALID_ADDRESS, MSG_SUCCESS};
pub use entity::{GroupIndex, Node};
pub use error::{DirectoryError, ErrorKind, Result};
pub use identity::{Identity, Keypair, caller_identity};
pub use messages::{LoadRequest, NodeMeta, NodeResponse, QueryResponse, RpcRequest, RpcResponse};
pub use protocols::DirectoryRpc;
pub use reachability::{AlwaysReachable, ReachabilityProbe, SshBannerProbe};
pub use rpc::{RpcClient, dispatch, parse_server_address};
pub use server::Server;
pub use snapshot::SnapshotEngine;
pub use store::{Bucket, Store};
