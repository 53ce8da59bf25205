//! # At-Rest Codec
//!
//! Every persisted or cached blob (node records, the group index, snapshots,
//! the client cache file) passes through [`seal`] before it is written and
//! [`open`] after it is read.
//!
//! The transform is AES-256 in full-block CFB mode with a key and IV that are
//! compiled into every binary. It is **obfuscation, not confidentiality**:
//! anyone holding a copy of this crate can open any blob. It exists so that
//! files are not readable at a glance and so that blobs stay byte-compatible
//! across client and server builds.
//!
//! ## Properties
//!
//! - Stateless: each call builds a fresh cipher from the fixed key/IV
//! - Length-preserving: `seal(b).len() == b.len()` for every input length
//! - Never panics on input length; a cipher construction failure surfaces as
//!   [`DirectoryError::Codec`]

use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};

use crate::error::{DirectoryError, Result};

type SealCipher = cfb_mode::Encryptor<Aes256>;
type OpenCipher = cfb_mode::Decryptor<Aes256>;

/// Fixed 32-byte key shared by every client and server build.
const FIXED_KEY: &[u8; 32] = b"abcdefg@2019$0123456789!@#$%^*&(";

/// Fixed initialization vector.
const FIXED_IV: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
    0x0f,
];

pub fn seal(plain: &[u8]) -> Result<Vec<u8>> {
    let cipher = SealCipher::new_from_slices(FIXED_KEY, &FIXED_IV)
        .map_err(|e| DirectoryError::Codec(format!("cipher init: {}", e)))?;
    let mut buf = plain.to_vec();
    cipher.encrypt(&mut buf);
    Ok(buf)
}

pub fn open(sealed: &[u8]) -> Result<Vec<u8>> {
    let cipher = OpenCipher::new_from_slices(FIXED_KEY, &FIXED_IV)
        .map_err(|e| DirectoryError::Codec(format!("cipher init: {}", e)))?;
    let mut buf = sealed.to_vec();
    cipher.decrypt(&mut buf);
    Ok(buf)
}

/// Serialize `value` as JSON and seal it.
pub fn seal_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let plain = serde_json::to_vec(value)?;
    seal(&plain)
}

/// Open `sealed` and decode it as JSON. A decode failure after opening means
/// the blob is corrupt (or was never sealed) and is reported as a codec error.
pub fn open_json<T: serde::de::DeserializeOwned>(sealed: &[u8]) -> Result<T> {
    let plain = open(sealed)?;
    serde_json::from_slice(&plain).map_err(|e| DirectoryError::Codec(format!("corrupt blob: {}", e)))
}
