//! Signing client for the lobster API.
//!
//! Every request carries
//! `Authorization: lobster <api_id>:<partial_key>:<nonce>:<signature>` where
//! the signature covers the path relative to the API root, the nonce and the
//! raw request body.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use lobster_crypto::sign_request;

use crate::types::{
    Image, ImageFetchRequest, ImageFetchResponse, ImageInfoResponse, ImageListResponse, IpAddress,
    Plan, PlanListResponse, VirtualMachine, VmActionRequest, VmAddressRdnsRequest,
    VmAddressRemoveRequest, VmAddressesResponse, VmCreateRequest, VmCreateResponse,
    VmInfoResponse, VmListResponse, VmReimageRequest, VmResizeRequest, VmSnapshotResponse,
    VmVncResponse,
};

/// Length of the key prefix sent in clear to identify the key.
pub const PARTIAL_KEY_LEN: usize = 64;

/// API client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Lobster API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Credentials of an API key.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_id: String,
    pub api_key: String,
}

/// Build the `Authorization` header value for a request.
///
/// `path` is relative to the API root (`vms/12/action`, not `/api/vms/12/action`).
pub fn authorization_header(
    credentials: &ApiCredentials,
    path: &str,
    nonce: i64,
    body: &[u8],
) -> String {
    let partial = credentials
        .api_key
        .get(..PARTIAL_KEY_LEN)
        .unwrap_or(&credentials.api_key);
    let signature = sign_request(&credentials.api_key, path, nonce, body);
    format!(
        "lobster {}:{}:{}:{}",
        credentials.api_id, partial, nonce, signature
    )
}

/// Lobster API client.
#[derive(Debug)]
pub struct LobsterClient {
    http: reqwest::Client,
    base_url: String,
    credentials: ApiCredentials,
    last_nonce: AtomicI64,
}

impl LobsterClient {
    /// Create a client for the API rooted at `base_url` (e.g. `https://panel.example.com/api/`).
    pub fn new(base_url: &str, credentials: ApiCredentials) -> Result<Self, ClientError> {
        if base_url.is_empty() {
            return Err(ClientError::Config("base_url is empty".into()));
        }
        if credentials.api_id.is_empty() {
            return Err(ClientError::Config("api_id is empty".into()));
        }
        if credentials.api_key.len() < PARTIAL_KEY_LEN {
            return Err(ClientError::Config(format!(
                "api_key must be at least {PARTIAL_KEY_LEN} characters"
            )));
        }

        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let base_url = format!("{}/", base_url.trim_end_matches('/'));
        Ok(Self {
            http,
            base_url,
            credentials,
            last_nonce: AtomicI64::new(0),
        })
    }

    /// Nanosecond clock, bumped so two requests never share a nonce.
    fn next_nonce(&self) -> i64 {
        #[allow(clippy::cast_possible_truncation)]
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        let mut prev = self.last_nonce.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_nonce.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<Option<T>, ClientError> {
        let body = match body {
            Some(b) => serde_json::to_vec(b)?,
            None => Vec::new(),
        };
        let nonce = self.next_nonce();
        let auth = authorization_header(&self.credentials, path, nonce, &body);
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "Lobster API request");

        let mut builder = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, auth);
        if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<crate::types::ErrorResponse>(&bytes)
                .map_or_else(|_| String::from_utf8_lossy(&bytes).into_owned(), |e| e.error);
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T, ClientError> {
        self.request(method, path, body)
            .await?
            .ok_or_else(|| ClientError::Api {
                status: 200,
                message: "empty response body".into(),
            })
    }

    async fn call_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<(), ClientError> {
        self.request::<serde_json::Value>(method, path, body)
            .await
            .map(|_| ())
    }

    // =========================================================================
    // Virtual machines
    // =========================================================================

    pub async fn vm_list(&self) -> Result<Vec<VirtualMachine>, ClientError> {
        let resp: VmListResponse = self.call(Method::GET, "vms", None::<&()>).await?;
        Ok(resp.vms)
    }

    pub async fn vm_create(
        &self,
        name: &str,
        plan_id: i64,
        image_id: i64,
    ) -> Result<i64, ClientError> {
        let req = VmCreateRequest {
            name: name.to_string(),
            plan_id,
            image_id,
        };
        let resp: VmCreateResponse = self.call(Method::POST, "vms", Some(&req)).await?;
        Ok(resp.id)
    }

    pub async fn vm_info(&self, vm_id: i64) -> Result<VmInfoResponse, ClientError> {
        self.call(Method::GET, &format!("vms/{vm_id}"), None::<&()>)
            .await
    }

    pub async fn vm_delete(&self, vm_id: i64) -> Result<(), ClientError> {
        self.call_empty(Method::DELETE, &format!("vms/{vm_id}"), None::<&()>)
            .await
    }

    pub async fn vm_action(&self, vm_id: i64, action: &str, value: &str) -> Result<(), ClientError> {
        let req = VmActionRequest {
            action: action.to_string(),
            value: value.to_string(),
        };
        self.call_empty(Method::POST, &format!("vms/{vm_id}/action"), Some(&req))
            .await
    }

    pub async fn vm_vnc(&self, vm_id: i64) -> Result<String, ClientError> {
        let req = VmActionRequest {
            action: "vnc".to_string(),
            value: String::new(),
        };
        let resp: VmVncResponse = self
            .call(Method::POST, &format!("vms/{vm_id}/action"), Some(&req))
            .await?;
        Ok(resp.url)
    }

    pub async fn vm_snapshot(&self, vm_id: i64, name: &str) -> Result<i64, ClientError> {
        let req = VmActionRequest {
            action: "snapshot".to_string(),
            value: name.to_string(),
        };
        let resp: VmSnapshotResponse = self
            .call(Method::POST, &format!("vms/{vm_id}/action"), Some(&req))
            .await?;
        Ok(resp.id)
    }

    pub async fn vm_reimage(&self, vm_id: i64, image_id: i64) -> Result<(), ClientError> {
        let req = VmReimageRequest { image_id };
        self.call_empty(Method::POST, &format!("vms/{vm_id}/reimage"), Some(&req))
            .await
    }

    pub async fn vm_resize(&self, vm_id: i64, plan_id: i64) -> Result<(), ClientError> {
        let req = VmResizeRequest { plan_id };
        self.call_empty(Method::POST, &format!("vms/{vm_id}/resize"), Some(&req))
            .await
    }

    pub async fn vm_addresses(&self, vm_id: i64) -> Result<Vec<IpAddress>, ClientError> {
        let resp: VmAddressesResponse = self
            .call(Method::GET, &format!("vms/{vm_id}/ips"), None::<&()>)
            .await?;
        Ok(resp.addresses)
    }

    pub async fn vm_address_add(&self, vm_id: i64) -> Result<(), ClientError> {
        self.call_empty(Method::POST, &format!("vms/{vm_id}/ips/add"), None::<&()>)
            .await
    }

    pub async fn vm_address_remove(
        &self,
        vm_id: i64,
        ip: &str,
        private_ip: &str,
    ) -> Result<(), ClientError> {
        let req = VmAddressRemoveRequest {
            ip: ip.to_string(),
            private_ip: private_ip.to_string(),
        };
        self.call_empty(Method::POST, &format!("vms/{vm_id}/ips/remove"), Some(&req))
            .await
    }

    pub async fn vm_address_rdns(
        &self,
        vm_id: i64,
        ip: &str,
        hostname: &str,
    ) -> Result<(), ClientError> {
        let req = VmAddressRdnsRequest {
            hostname: hostname.to_string(),
        };
        self.call_empty(Method::POST, &format!("vms/{vm_id}/ips/{ip}/rdns"), Some(&req))
            .await
    }

    // =========================================================================
    // Images and plans
    // =========================================================================

    pub async fn image_list(&self) -> Result<Vec<Image>, ClientError> {
        let resp: ImageListResponse = self.call(Method::GET, "images", None::<&()>).await?;
        Ok(resp.images)
    }

    pub async fn image_fetch(
        &self,
        region: &str,
        name: &str,
        url: &str,
        format: &str,
    ) -> Result<i64, ClientError> {
        let req = ImageFetchRequest {
            region: region.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            format: format.to_string(),
        };
        let resp: ImageFetchResponse = self.call(Method::POST, "images", Some(&req)).await?;
        Ok(resp.id)
    }

    pub async fn image_info(&self, image_id: i64) -> Result<ImageInfoResponse, ClientError> {
        self.call(Method::GET, &format!("images/{image_id}"), None::<&()>)
            .await
    }

    pub async fn image_delete(&self, image_id: i64) -> Result<(), ClientError> {
        self.call_empty(Method::DELETE, &format!("images/{image_id}"), None::<&()>)
            .await
    }

    pub async fn plan_list(&self) -> Result<Vec<Plan>, ClientError> {
        let resp: PlanListResponse = self.call(Method::GET, "plans", None::<&()>).await?;
        Ok(resp.plans)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn creds() -> ApiCredentials {
        ApiCredentials {
            api_id: "abcdefghijklmnop".to_string(),
            api_key: "k".repeat(128),
        }
    }

    #[test]
    fn header_has_four_fields() {
        let header = authorization_header(&creds(), "vms", 99, b"");
        let rest = header.strip_prefix("lobster ").unwrap();
        let parts: Vec<&str> = rest.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "abcdefghijklmnop");
        assert_eq!(parts[1].len(), PARTIAL_KEY_LEN);
        assert_eq!(parts[2], "99");
        assert_eq!(parts[3].len(), 128);
    }

    #[test]
    fn rejects_short_keys() {
        let result = LobsterClient::new(
            "http://localhost/api/",
            ApiCredentials {
                api_id: "abcdefghijklmnop".into(),
                api_key: "short".into(),
            },
        );
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn nonces_strictly_increase() {
        let client = LobsterClient::new("http://localhost/api", creds()).unwrap();
        let a = client.next_nonce();
        let b = client.next_nonce();
        let c = client.next_nonce();
        assert!(a < b && b < c);
        assert_eq!(client.base_url, "http://localhost/api/");
    }
}
