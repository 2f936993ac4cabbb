//! Credential digests and constant-time verification
//!
//! All comparisons go through `subtle` so the time taken does not depend on
//! where the first mismatching byte sits.

use sha2::{Digest, Sha224, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Length of the Trojan credential field
pub const TROJAN_HASH_LEN: usize = 56;

/// Equal length and equal content, in constant time for equal lengths
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Raw SHA-256 of a Trojan password
pub fn trojan_sha256(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

/// hex(SHA-224(password)), the 56-byte form sent by standard Trojan clients
pub fn trojan_sha224_hex(password: &str) -> [u8; TROJAN_HASH_LEN] {
    let hex = hex::encode(Sha224::digest(password.as_bytes()));
    let mut out = [0u8; TROJAN_HASH_LEN];
    out.copy_from_slice(hex.as_bytes());
    out
}

/// Pre-computed Trojan credential for one configured password
#[derive(Clone)]
pub struct TrojanCredential {
    sha256: [u8; 32],
    sha256_hex: [u8; TROJAN_HASH_LEN],
    sha224_hex: [u8; TROJAN_HASH_LEN],
}

impl TrojanCredential {
    pub fn new(password: &str) -> Self {
        let sha256 = trojan_sha256(password);
        let mut sha256_hex = [0u8; TROJAN_HASH_LEN];
        sha256_hex.copy_from_slice(&hex::encode(sha256).as_bytes()[..TROJAN_HASH_LEN]);
        Self {
            sha256,
            sha256_hex,
            sha224_hex: trojan_sha224_hex(password),
        }
    }

    /// Check a received 56-byte field.
    ///
    /// Accepted forms: raw SHA-256 in the first 32 bytes, the first 56 hex
    /// digits of SHA-256, or the full hex SHA-224.
    pub fn verify(&self, field: &[u8; TROJAN_HASH_LEN]) -> bool {
        let raw = field[..32].ct_eq(&self.sha256[..]);
        let hex256 = field[..].ct_eq(&self.sha256_hex[..]);
        let hex224 = field[..].ct_eq(&self.sha224_hex[..]);
        bool::from(raw | hex256 | hex224)
    }
}

impl std::fmt::Debug for TrojanCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrojanCredential(..)")
    }
}

/// Compare a received VMess/VLESS user ID with the configured one
pub fn verify_uuid(received: &[u8; 16], expected: &Uuid) -> bool {
    bool::from(received[..].ct_eq(&expected.as_bytes()[..]))
}

/// Username/password pair checked by SOCKS5 and HTTP Basic auth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl UserPass {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Both parts are always compared so a wrong username costs the same
    pub fn verify(&self, username: &[u8], password: &[u8]) -> bool {
        let user_ok = constant_time_eq(username, self.username.as_bytes());
        let pass_ok = constant_time_eq(password, self.password.as_bytes());
        user_ok & pass_ok
    }
}
