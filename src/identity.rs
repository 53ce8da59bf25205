//! # Identities
//!
//! Two unrelated notions of "who" live here:
//!
//! | Type | Used for | Trust |
//! |------|----------|-------|
//! | [`Keypair`] / [`Identity`] | QUIC endpoint certificates | cryptographic |
//! | [`caller_identity`] string | authorization on every RPC | none |
//!
//! The server's [`Identity`] is its Ed25519 public key. Clients pin it so
//! they only talk to the directory they were pointed at.
//!
//! The caller identity is `<login>@<outbound IPv4>`. It is a label, not a
//! credential: anyone can claim any string. Policy files name users by it.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    /// Read a hex-encoded secret key from `path`, or generate one and write it
    /// there. The server identity must survive restarts for pinned clients.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => {
                let bytes = hex::decode(text.trim())
                    .with_context(|| format!("key file {} is not hex", path.display()))?;
                let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    anyhow::anyhow!("key file {} must hold 32 bytes, found {}", path.display(), bytes.len())
                })?;
                Ok(Self::from_secret_key_bytes(&secret))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, hex::encode(keypair.secret_key_bytes()))
                    .with_context(|| format!("failed to write key file {}", path.display()))?;
                info!(path = %path.display(), identity = %keypair.identity(), "generated server key");
                Ok(keypair)
            }
            Err(e) => Err(e).with_context(|| format!("failed to read key file {}", path.display())),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// True when the bytes decode to an Ed25519 point and are not one of the
    /// trivial all-zero/all-one patterns.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Caller identity
// ============================================================================

const FALLBACK_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Local IPv4 address of the interface that routes to the public internet.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn outbound_ipv4() -> Option<Ipv4Addr> {
    let probe_targets = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];
    for target in probe_targets {
        if let Ok(socket) = UdpSocket::bind("0.0.0.0:0")
            && socket.connect(target).is_ok()
            && let Ok(local) = socket.local_addr()
            && let IpAddr::V4(ip) = local.ip()
            && !ip.is_loopback()
            && !ip.is_unspecified()
        {
            return Some(ip);
        }
    }
    None
}

/// OS login name from the environment.
pub fn login_name() -> String {
    ["USER", "USERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn format_caller_identity(login: &str, address: Ipv4Addr) -> String {
    format!("{}@{}", login, address)
}

/// `<login>@<outbound IPv4>`, falling back to `127.0.0.1` when no route
/// exists.
pub fn caller_identity() -> String {
    format_caller_identity(&login_name(), outbound_ipv4().unwrap_or(FALLBACK_ADDRESS))
}
