//! Salted one-way password digests. Stored form is `salt$digest`, both lowercase
//! hex; verification recomputes the digest from the stored salt.

use rand::RngCore;
use sha2::{Digest, Sha256};

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn digest_with_salt(salt_hex: &str, password: &str) -> String {
    let mut material = Vec::with_capacity(salt_hex.len() + 1 + password.len());
    material.extend_from_slice(salt_hex.as_bytes());
    material.push(b'$');
    material.extend_from_slice(password.as_bytes());
    sha256_hex(&material)
}

/// Hash a password with a fresh random 16-byte salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_hex = hex_encode(&salt);
    let digest = digest_with_salt(&salt_hex, password);
    format!("{salt_hex}${digest}")
}

/// Check a password against a stored `salt$digest` string. Anything malformed
/// fails closed.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest)) = stored.split_once('$') else {
        return false;
    };
    digest_with_salt(salt_hex, password) == digest
}
