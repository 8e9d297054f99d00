//! API keys and the `lobster` request signature scheme.
//!
//! A request carries `Authorization: lobster <api_id>:<partial>:<nonce>:<sig>`
//! where `partial` is the first 64 characters of the key and `sig` is the
//! hex HMAC-SHA512 of `"<path>|<nonce>|<body>"`. Nonces must increase per
//! key, so a captured request cannot be replayed.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lobster_client::PARTIAL_KEY_LEN;
use lobster_core::text::is_printable;
use lobster_core::wildcard_match;
use lobster_crypto::{SIGNATURE_LEN, constant_time_str_eq, random_alphanumeric, verify_request};

use crate::error::{PanelError, PanelResult};
use crate::storage::{ApiKey, ApiKeyParams, PanelDatabase};

pub const API_ID_LENGTH: usize = 16;
pub const API_KEY_LENGTH: usize = 128;
pub const MAX_LABEL_LENGTH: usize = 64;
pub const MAX_RESTRICTION_LENGTH: usize = 512;
/// Largest request body accepted on the API.
pub const MAX_API_BODY: usize = 32 * 1024;

/// One allowed `(method, path)` pair. The method must match exactly unless
/// it is `*`; a trailing `*` in `path` matches by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRestriction {
    pub method: String,
    pub path: String,
}

impl ActionRestriction {
    fn allows(&self, method: &str, path: &str) -> bool {
        (self.method == "*" || self.method == method)
            && wildcard_match(&self.path, path)
    }
}

/// An authenticated API caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCaller {
    pub user_id: i64,
    /// `None` for session-token callers.
    pub key_id: Option<i64>,
}

pub struct ApiKeyRequest<'a> {
    pub label: &'a str,
    /// JSON list of [`ActionRestriction`]; empty allows everything.
    pub restrict_action: &'a str,
    /// Comma separated IPs and CIDR ranges; empty allows any address.
    pub restrict_ip: &'a str,
}

fn parse_actions(json: &str) -> Result<Vec<ActionRestriction>, serde_json::Error> {
    serde_json::from_str(json)
}

fn parse_networks(list: &str) -> Option<Vec<IpNet>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .ok()
                .or_else(|| s.parse::<IpAddr>().ok().map(IpNet::from))
        })
        .collect()
}

fn ip_allowed(networks: &[IpNet], ip: &str) -> bool {
    ip.parse::<IpAddr>()
        .is_ok_and(|addr| networks.iter().any(|net| net.contains(&addr)))
}

/// Create a key for `user_id`. The returned row carries the full secret,
/// which is not shown again.
pub async fn create_api_key(
    db: &PanelDatabase,
    user_id: i64,
    request: &ApiKeyRequest<'_>,
) -> PanelResult<ApiKey> {
    if request.label.is_empty() || request.label.len() > MAX_LABEL_LENGTH {
        return Err(PanelError::validation(format!(
            "label must be between 1 and {MAX_LABEL_LENGTH} characters"
        )));
    }
    if !is_printable(request.label) {
        return Err(PanelError::validation("label contains invalid characters"));
    }
    if request.restrict_action.len() > MAX_RESTRICTION_LENGTH
        || request.restrict_ip.len() > MAX_RESTRICTION_LENGTH
    {
        return Err(PanelError::validation(format!(
            "restrictions cannot exceed {MAX_RESTRICTION_LENGTH} characters"
        )));
    }
    if !request.restrict_action.is_empty() {
        parse_actions(request.restrict_action)
            .map_err(|e| PanelError::validation(format!("invalid action restriction: {e}")))?;
    }
    if !request.restrict_ip.is_empty() && parse_networks(request.restrict_ip).is_none() {
        return Err(PanelError::validation("invalid IP restriction"));
    }

    let api_id = random_alphanumeric(API_ID_LENGTH);
    let api_key = random_alphanumeric(API_KEY_LENGTH);
    let key = db
        .create_api_key(&ApiKeyParams {
            user_id,
            label: request.label,
            api_id: &api_id,
            api_key: &api_key,
            restrict_action: request.restrict_action,
            restrict_ip: request.restrict_ip,
        })
        .await?;
    info!(user_id, key_id = key.id, "API key created");
    Ok(key)
}

/// Check `lobster` authorization data for a request from `ip`.
///
/// `path` is the request path after `/api/`. On success the key's stored
/// nonce is raised to the request nonce.
pub async fn authenticate_signature(
    db: &PanelDatabase,
    authdata: &str,
    method: &str,
    path: &str,
    body: &[u8],
    ip: &str,
) -> PanelResult<ApiCaller> {
    let parts: Vec<&str> = authdata.split(':').collect();
    let [api_id, partial, nonce, signature] = parts[..] else {
        debug!(parts = parts.len(), "Malformed API authorization");
        return Err(PanelError::AuthFailure);
    };
    let nonce: i64 = nonce.parse().map_err(|_| PanelError::AuthFailure)?;
    let signature = hex::decode(signature).map_err(|_| PanelError::AuthFailure)?;
    if api_id.len() != API_ID_LENGTH
        || partial.len() != PARTIAL_KEY_LEN
        || signature.len() != SIGNATURE_LEN
    {
        debug!("API authorization field has bad length");
        return Err(PanelError::AuthFailure);
    }

    let Some(key) = db.find_api_key_for_nonce(api_id, nonce).await? else {
        warn!(api_id, ip, "API authentication failure: unknown key or stale nonce");
        return Err(PanelError::AuthFailure);
    };

    let expected_partial = key.api_key.get(..PARTIAL_KEY_LEN).unwrap_or_default();
    let partial_ok = constant_time_str_eq(expected_partial, partial);
    let signature_ok = verify_request(&key.api_key, path, nonce, body, &signature);
    if !(partial_ok && signature_ok) {
        warn!(api_id, ip, "API authentication failure: bad signature");
        return Err(PanelError::AuthFailure);
    }

    if !key.restrict_action.is_empty() {
        let restrictions = parse_actions(&key.restrict_action)
            .map_err(|e| PanelError::Internal(format!("stored action restriction: {e}")))?;
        if !restrictions.iter().any(|r| r.allows(method, path)) {
            warn!(api_id, method, path, "API request failed action restriction");
            return Err(PanelError::Forbidden);
        }
    }
    if !key.restrict_ip.is_empty() {
        let networks = parse_networks(&key.restrict_ip)
            .ok_or_else(|| PanelError::Internal("stored IP restriction".to_string()))?;
        if !ip_allowed(&networks, ip) {
            warn!(api_id, ip, "API request failed IP restriction");
            return Err(PanelError::Forbidden);
        }
    }

    db.bump_api_nonce(key.id, nonce).await?;
    Ok(ApiCaller {
        user_id: key.user_id,
        key_id: Some(key.id),
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use lobster_client::{ApiCredentials, authorization_header};

    use crate::test_support::harness;

    const IP: &str = "203.0.113.9";

    fn authdata(key: &ApiKey, path: &str, nonce: i64, body: &[u8]) -> String {
        let header = authorization_header(
            &ApiCredentials {
                api_id: key.api_id.clone(),
                api_key: key.api_key.clone(),
            },
            path,
            nonce,
            body,
        );
        header.strip_prefix("lobster ").unwrap().to_string()
    }

    async fn key_with(
        db: &PanelDatabase,
        user_id: i64,
        restrict_action: &str,
        restrict_ip: &str,
    ) -> ApiKey {
        create_api_key(
            db,
            user_id,
            &ApiKeyRequest {
                label: "ci",
                restrict_action,
                restrict_ip,
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn restrictions_match_method_and_path() {
        let r = ActionRestriction {
            method: "GET".into(),
            path: "vms*".into(),
        };
        assert!(r.allows("GET", "vms"));
        assert!(r.allows("GET", "vms/3/ips"));
        assert!(!r.allows("POST", "vms"));
        assert!(!r.allows("get", "vms"));
        assert!(!r.allows("GET", "images"));

        let any = ActionRestriction {
            method: "*".into(),
            path: "plans".into(),
        };
        assert!(any.allows("DELETE", "plans"));
        assert!(!any.allows("GET", "plans/1"));
    }

    #[test]
    fn networks_accept_addresses_and_ranges() {
        let nets = parse_networks("10.0.0.0/8, 192.0.2.7,2001:db8::/32").unwrap();
        assert!(ip_allowed(&nets, "10.1.2.3"));
        assert!(ip_allowed(&nets, "192.0.2.7"));
        assert!(!ip_allowed(&nets, "192.0.2.8"));
        assert!(ip_allowed(&nets, "2001:db8::1"));
        assert!(!ip_allowed(&nets, "not-an-ip"));
        assert!(parse_networks("10.0.0.0/8,bogus").is_none());
    }

    #[tokio::test]
    async fn create_validates_request() {
        let h = harness().await;
        let user = h.user("alice", 0).await;

        let key = key_with(&h.db, user.id, "", "").await;
        assert_eq!(key.api_id.len(), API_ID_LENGTH);
        assert_eq!(key.api_key.len(), API_KEY_LENGTH);

        let long_label = "x".repeat(MAX_LABEL_LENGTH + 1);
        let bad = [
            ApiKeyRequest { label: "", restrict_action: "", restrict_ip: "" },
            ApiKeyRequest { label: &long_label, restrict_action: "", restrict_ip: "" },
            ApiKeyRequest { label: "ci", restrict_action: "{not json", restrict_ip: "" },
            ApiKeyRequest { label: "ci", restrict_action: "", restrict_ip: "300.1.1.1" },
        ];
        for request in &bad {
            assert!(matches!(
                create_api_key(&h.db, user.id, request).await,
                Err(PanelError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn signed_request_passes_once() {
        let h = harness().await;
        let user = h.user("alice", 0).await;
        let key = key_with(&h.db, user.id, "", "").await;

        let data = authdata(&key, "vms", 5, b"");
        let caller = authenticate_signature(&h.db, &data, "GET", "vms", b"", IP)
            .await
            .unwrap();
        assert_eq!(caller.user_id, user.id);
        assert_eq!(caller.key_id, Some(key.id));

        // Replay and lower nonces are rejected; a higher one passes.
        for nonce in [5, 4] {
            let data = authdata(&key, "vms", nonce, b"");
            assert!(matches!(
                authenticate_signature(&h.db, &data, "GET", "vms", b"", IP).await,
                Err(PanelError::AuthFailure)
            ));
        }
        let data = authdata(&key, "vms", 6, b"");
        authenticate_signature(&h.db, &data, "GET", "vms", b"", IP)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tampered_requests_fail() {
        let h = harness().await;
        let user = h.user("alice", 0).await;
        let key = key_with(&h.db, user.id, "", "").await;

        let data = authdata(&key, "vms", 1, b"{}");
        assert!(authenticate_signature(&h.db, &data, "POST", "vms", b"{ }", IP).await.is_err());
        assert!(authenticate_signature(&h.db, &data, "POST", "images", b"{}", IP).await.is_err());

        let mut other = key.clone();
        other.api_key = random_alphanumeric(API_KEY_LENGTH);
        let forged = authdata(&other, "vms", 1, b"{}");
        assert!(authenticate_signature(&h.db, &forged, "POST", "vms", b"{}", IP).await.is_err());

        for malformed in ["", "a:b:c", "a:b:c:d:e", data.replacen(':', "x", 1).as_str()] {
            assert!(
                authenticate_signature(&h.db, malformed, "POST", "vms", b"{}", IP)
                    .await
                    .is_err()
            );
        }
    }

    #[tokio::test]
    async fn disabled_owner_cannot_authenticate() {
        let h = harness().await;
        let user = h.user("alice", 0).await;
        let key = key_with(&h.db, user.id, "", "").await;
        h.db.set_user_status(user.id, crate::storage::UserStatus::Disabled)
            .await
            .unwrap();

        let data = authdata(&key, "vms", 1, b"");
        assert!(matches!(
            authenticate_signature(&h.db, &data, "GET", "vms", b"", IP).await,
            Err(PanelError::AuthFailure)
        ));
    }

    #[tokio::test]
    async fn action_and_ip_restrictions_apply() {
        let h = harness().await;
        let user = h.user("alice", 0).await;
        let key = key_with(
            &h.db,
            user.id,
            r#"[{"method": "GET", "path": "vms*"}]"#,
            "203.0.113.0/24",
        )
        .await;

        let data = authdata(&key, "vms/7", 1, b"");
        authenticate_signature(&h.db, &data, "GET", "vms/7", b"", IP)
            .await
            .unwrap();

        let data = authdata(&key, "vms", 2, b"");
        assert!(matches!(
            authenticate_signature(&h.db, &data, "POST", "vms", b"", IP).await,
            Err(PanelError::Forbidden)
        ));

        let data = authdata(&key, "vms", 3, b"");
        assert!(matches!(
            authenticate_signature(&h.db, &data, "GET", "vms", b"", "198.51.100.1").await,
            Err(PanelError::Forbidden)
        ));

        // Rejected requests do not consume their nonce.
        let data = authdata(&key, "vms", 2, b"");
        authenticate_signature(&h.db, &data, "GET", "vms", b"", IP)
            .await
            .unwrap();
    }
}
