//! HMAC-SHA512 request signatures.
//!
//! A request to path `p` with nonce `n` and body `b` is signed as
//! `HMAC-SHA512(api_key, "p|n|b")` and transmitted hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Length of a raw signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

fn mac_for(key: &str, path: &str, nonce: i64, body: &[u8]) -> HmacSha512 {
    let mut mac = match HmacSha512::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(path.as_bytes());
    mac.update(b"|");
    mac.update(nonce.to_string().as_bytes());
    mac.update(b"|");
    mac.update(body);
    mac
}

/// Sign a request, returning the hex-encoded signature.
pub fn sign_request(key: &str, path: &str, nonce: i64, body: &[u8]) -> String {
    hex::encode(mac_for(key, path, nonce, body).finalize().into_bytes())
}

/// Verify a raw (already hex-decoded) signature in constant time.
pub fn verify_request(key: &str, path: &str, nonce: i64, body: &[u8], signature: &[u8]) -> bool {
    mac_for(key, path, nonce, body)
        .verify_slice(signature)
        .is_ok()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY: &str = "k3yk3yk3y";

    #[test]
    fn signature_is_128_hex_chars() {
        let sig = sign_request(KEY, "vms", 1, b"");
        assert_eq!(sig.len(), SIGNATURE_LEN * 2);
    }

    #[test]
    fn verifies_with_same_inputs() {
        let sig = hex::decode(sign_request(KEY, "vms/4", 42, b"{\"a\":1}")).unwrap();
        assert!(verify_request(KEY, "vms/4", 42, b"{\"a\":1}", &sig));
    }

    #[test]
    fn any_changed_input_fails() {
        let sig = hex::decode(sign_request(KEY, "vms", 42, b"body")).unwrap();
        assert!(!verify_request("other", "vms", 42, b"body", &sig));
        assert!(!verify_request(KEY, "images", 42, b"body", &sig));
        assert!(!verify_request(KEY, "vms", 43, b"body", &sig));
        assert!(!verify_request(KEY, "vms", 42, b"bodY", &sig));
        assert!(!verify_request(KEY, "vms", 42, b"body", &sig[..32]));
    }

    #[test]
    fn message_layout_matches_manual_hmac() {
        let mut mac = HmacSha512::new_from_slice(KEY.as_bytes()).unwrap();
        mac.update(b"plans|7|");
        let manual = hex::encode(mac.finalize().into_bytes());
        assert_eq!(sign_request(KEY, "plans", 7, b""), manual);
    }
}
