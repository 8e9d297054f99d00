//! HTTP surfaces of the panel.
//!
//! - [`auth`]: login, registration, logout and password reset
//! - [`panel`]: the logged-in user's pages and form actions
//! - [`admin`]: operator pages and form actions
//! - [`api`]: the signed JSON API under `/api/`
//!
//! Browser-facing routes share the cookie session and CSRF middleware from
//! [`crate::session`]. Pages answer with JSON views; form actions answer
//! with `303` redirects that carry a `message` and `type` query for the
//! page to display.

pub mod admin;
pub mod api;
pub mod auth;
pub mod panel;

#[cfg(test)]
mod auth_tests;
#[cfg(test)]
mod test_helpers;

use std::any::Any;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{Next, from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Extension;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::error;

use lobster_core::config::Config;

use crate::auth::AuthService;
use crate::billing::AccountService;
use crate::catalog::CatalogService;
use crate::driver::DriverRegistry;
use crate::error::{PanelError, PanelResult};
use crate::mail::MailService;
use crate::payment::PaymentRegistry;
use crate::session::{CurrentSession, session_layer};
use crate::storage::{DatabaseError, PanelDatabase};
use crate::vm::VmService;

pub const LOGIN_PAGE: &str = "/login";
pub const DASHBOARD_PAGE: &str = "/panel/dashboard";

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: PanelDatabase,
    pub config: Arc<Config>,
    pub registry: Arc<DriverRegistry>,
    pub auth: AuthService,
    pub vms: VmService,
    pub accounts: AccountService,
    pub catalog: CatalogService,
    pub payments: Arc<PaymentRegistry>,
    pub mail: MailService,
}

/// Build the complete HTTP router.
pub fn router(state: AppState) -> Router {
    let panel = panel::routes().route_layer(from_fn(require_login));
    let admin = admin::routes().route_layer(from_fn_with_state(state.clone(), require_admin));
    let browser = Router::new()
        .route("/panel", get(|| async { Redirect::to(DASHBOARD_PAGE) }))
        .merge(auth::routes())
        .merge(panel)
        .merge(admin)
        .layer(from_fn_with_state(state.clone(), session_layer));

    let mail = state.mail.clone();
    Router::new()
        .merge(browser)
        .merge(api::routes(state.clone()))
        .layer(CatchPanicLayer::custom(move |panic: Box<dyn Any + Send>| {
            panic_response(&mail, panic.as_ref())
        }))
        .with_state(state)
}

fn panic_response(mail: &MailService, panic: &(dyn Any + Send)) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    mail.report_error(&detail, "handler panicked", "");
    PanelError::Internal("handler panicked".to_string()).into_response()
}

async fn require_login(
    Extension(session): Extension<CurrentSession>,
    request: Request,
    next: Next,
) -> Response {
    if !session.is_logged_in() {
        return Redirect::to(LOGIN_PAGE).into_response();
    }
    next.run(request).await
}

/// Admin pages always act as the admin's own account: impersonation is
/// dropped first, then both the session and the stored user must still
/// carry the admin flag.
async fn require_admin(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    request: Request,
    next: Next,
) -> Response {
    if !session.is_logged_in() {
        return Redirect::to(LOGIN_PAGE).into_response();
    }
    session.revert();

    let admin = match state.db.get_user(session.user_id()).await {
        Ok(user) => user.admin,
        Err(DatabaseError::NotFound(_)) => false,
        Err(e) => return PanelError::from(e).into_response(),
    };
    if !admin || !session.is_admin() {
        return Redirect::to(DASHBOARD_PAGE).into_response();
    }
    next.run(request).await
}

// =========================================================================
// Client address
// =========================================================================

/// Address of the client that sent the request.
///
/// Taken from the configured proxy header when one is set, else from the
/// socket peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(client_ip(
            &parts.headers,
            parts.extensions.get::<ConnectInfo<SocketAddr>>(),
            &state.config.default.proxy_header,
        )))
    }
}

pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<&ConnectInfo<SocketAddr>>,
    proxy_header: &str,
) -> String {
    if !proxy_header.is_empty() {
        let forwarded = headers
            .get(proxy_header)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}

// =========================================================================
// Form responses
// =========================================================================

/// `303` to `path` with a message for the page to show. `kind` is one of
/// `success`, `info` or `danger`.
pub fn redirect_message(path: &str, kind: &str, message: &str) -> Response {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("message", message)
        .append_pair("type", kind)
        .finish();
    Redirect::to(&format!("{path}?{query}")).into_response()
}

/// Answer a form action: `success` builds the response on `Ok`; on `Err`
/// the user is sent back to `failure` with the error message.
pub fn form_outcome<T>(
    result: PanelResult<T>,
    failure: &str,
    success: impl FnOnce(T) -> Response,
) -> Response {
    match result {
        Ok(value) => success(value),
        Err(e) => {
            if e.status() == StatusCode::INTERNAL_SERVER_ERROR {
                error!(error = %e, path = failure, "Form action failed");
            }
            redirect_message(failure, "danger", &e.public_message())
        }
    }
}
