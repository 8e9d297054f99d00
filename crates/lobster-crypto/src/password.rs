//! Password hashing and verification using PBKDF2-HMAC-SHA512.

use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::compare::constant_time_eq;
use crate::error::CryptoError;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 64;
const ROUNDS: u32 = 8192;

fn derive(password: &str, salt: &[u8]) -> Zeroizing<[u8; HASH_LEN]> {
    let mut out = Zeroizing::new([0u8; HASH_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, ROUNDS, out.as_mut());
    out
}

/// Hash a password with a fresh random salt.
///
/// The result has the form `hex(salt):hex(hash)`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let hash = derive(password, &salt);
    format!("{}:{}", hex::encode(salt), hex::encode(hash.as_ref()))
}

/// Verify a password against a stored `hex(salt):hex(hash)` string.
///
/// The comparison does not depend on where the hashes first differ.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, CryptoError> {
    let (salt_hex, hash_hex) = stored.split_once(':').ok_or(CryptoError::MalformedHash)?;
    let salt = hex::decode(salt_hex)?;
    let expected = hex::decode(hash_hex)?;
    if expected.len() != HASH_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: HASH_LEN,
            actual: expected.len(),
        });
    }
    let actual = derive(password, &salt);
    Ok(constant_time_eq(actual.as_ref(), &expected))
}
