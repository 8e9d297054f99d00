//! Lobster Crypto Library
//!
//! Primitives shared by the panel and the API client:
//!
//! - **Passwords**: PBKDF2-HMAC-SHA512, 8192 rounds, 16-byte salt, stored as `hex(salt):hex(hash)`
//! - **Request signatures**: HMAC-SHA512 over `path|nonce|body`, hex encoded
//! - **Tokens**: random alphanumeric and hex identifiers from the OS RNG
//! - **Comparison**: constant-time equality for secrets

pub mod compare;
pub mod error;
pub mod password;
pub mod random;
pub mod signature;

pub use compare::{constant_time_eq, constant_time_str_eq};
pub use error::CryptoError;
pub use password::{hash_password, verify_password};
pub use random::{random_alphanumeric, random_hex};
pub use signature::{SIGNATURE_LEN, sign_request, verify_request};
