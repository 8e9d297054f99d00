//! Cookie sessions and CSRF form tokens for the panel surfaces.
//!
//! [`session_layer`] resolves the `lobsterSession` cookie to a stored
//! [`Session`], creating an anonymous one when the cookie is missing or
//! stale, and makes it available to handlers as a [`CurrentSession`]
//! request extension. Changes handlers make are written back after the
//! handler returns.
//!
//! A session that logs in on a pre-existing identifier is marked for
//! regeneration; its identifier is replaced on the next request. Every
//! `POST` must carry a single-use form token issued to the same session,
//! either as the `token` form field or the `X-CSRF-Token` header.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::{debug, warn};

use lobster_core::config::Config;
use lobster_crypto::random_hex;

use crate::error::{PanelError, PanelResult};
use crate::server::AppState;
use crate::storage::{DatabaseError, PanelDatabase, Session};

pub const SESSION_COOKIE: &str = "lobsterSession";
pub const CSRF_HEADER: &str = "x-csrf-token";
/// Sessions idle for longer than this are treated as absent.
pub const SESSION_MAX_AGE_SECS: i64 = 60 * 60;
/// Form tokens older than this are rejected and cleaned up.
pub const FORM_TOKEN_MAX_AGE_SECS: i64 = 60 * 60;

/// Random bytes in a session identifier (hex encoded on the wire).
const SESSION_UID_BYTES: usize = 32;
const FORM_TOKEN_BYTES: usize = 32;
const MAX_FORM_BYTES: usize = 64 * 1024;

/// Where a `POST` without a valid form token is sent.
const CSRF_FAILURE_REDIRECT: &str = "/panel/dashboard";

/// Value of the cookie `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn is_session_uid(value: &str) -> bool {
    value.len() == SESSION_UID_BYTES * 2 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn session_cookie(config: &Config, uid: &str) -> String {
    let mut cookie = format!("{SESSION_COOKIE}={uid}; Path=/; HttpOnly; SameSite=Lax");
    if !config.session.domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(&config.session.domain);
    }
    if config.session.secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// The session of the request being handled.
///
/// Cloning yields a handle to the same session; the middleware persists
/// whatever state it holds once the handler finishes.
#[derive(Clone)]
pub struct CurrentSession {
    inner: Arc<Mutex<Session>>,
}

impl CurrentSession {
    fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn uid(&self) -> String {
        self.lock().uid.clone()
    }

    /// Zero when nobody is logged in.
    pub fn user_id(&self) -> i64 {
        self.lock().user_id
    }

    pub fn is_logged_in(&self) -> bool {
        self.user_id() != 0
    }

    pub fn is_admin(&self) -> bool {
        self.lock().admin
    }

    /// The admin's own user while impersonating someone, else zero.
    pub fn original_id(&self) -> i64 {
        self.lock().original_id
    }

    pub fn login(&self, user_id: i64, admin: bool) {
        let mut session = self.lock();
        session.user_id = user_id;
        session.admin = admin;
        session.original_id = 0;
    }

    pub fn logout(&self) {
        let mut session = self.lock();
        session.user_id = 0;
        session.admin = false;
        session.original_id = 0;
    }

    /// Act as `user_id`, remembering the current user for [`Self::revert`].
    pub fn impersonate(&self, user_id: i64) {
        let mut session = self.lock();
        if session.original_id == 0 {
            session.original_id = session.user_id;
        }
        session.user_id = user_id;
    }

    /// Undo [`Self::impersonate`]. Returns `false` if not impersonating.
    pub fn revert(&self) -> bool {
        let mut session = self.lock();
        if session.original_id == 0 {
            return false;
        }
        session.user_id = session.original_id;
        session.original_id = 0;
        true
    }
}

/// Issue a single-use form token bound to `session_uid`.
pub async fn issue_form_token(
    db: &PanelDatabase,
    session_uid: &str,
) -> Result<String, DatabaseError> {
    let token = random_hex(FORM_TOKEN_BYTES);
    db.insert_form_token(session_uid, &token).await?;
    Ok(token)
}

/// Resolve the logged-in session named by the request cookie and consume
/// `token` against it. Used by the `session` API authorization mode.
pub async fn authenticate_token(
    db: &PanelDatabase,
    headers: &HeaderMap,
    token: &str,
) -> PanelResult<Session> {
    let uid = cookie_value(headers, SESSION_COOKIE)
        .filter(|uid| is_session_uid(uid))
        .ok_or(PanelError::AuthFailure)?;
    let session = db
        .get_session(&uid, SESSION_MAX_AGE_SECS)
        .await?
        .filter(|session| session.user_id != 0)
        .ok_or(PanelError::AuthFailure)?;
    if !db
        .consume_form_token(&uid, token, FORM_TOKEN_MAX_AGE_SECS)
        .await?
    {
        return Err(PanelError::AuthFailure);
    }
    Ok(session)
}

/// Middleware attaching a [`CurrentSession`] to every request.
pub async fn session_layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match run_session(&state, request, next).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn load_or_create(db: &PanelDatabase, headers: &HeaderMap) -> PanelResult<(Session, bool)> {
    let cookie = cookie_value(headers, SESSION_COOKIE);
    if let Some(uid) = cookie.as_deref().filter(|uid| is_session_uid(uid)) {
        if let Some(session) = db.get_session(uid, SESSION_MAX_AGE_SECS).await? {
            return Ok((session, false));
        }
    }
    if cookie.is_some() {
        debug!("Invalid or expired session identifier");
    }
    let session = db.create_session(&random_hex(SESSION_UID_BYTES)).await?;
    Ok((session, true))
}

async fn run_session(state: &AppState, request: Request, next: Next) -> PanelResult<Response> {
    let db = &state.db;
    let (mut session, is_new) = load_or_create(db, request.headers()).await?;
    let mut set_cookie = is_new;

    if session.regenerate {
        let uid = random_hex(SESSION_UID_BYTES);
        db.rename_session(&session.uid, &uid).await?;
        session.uid = uid;
        session.regenerate = false;
        set_cookie = true;
    }
    let cookie = set_cookie.then(|| session_cookie(&state.config, &session.uid));

    let mut request = request;
    if request.method() == Method::POST {
        let (buffered, token) = take_form_token(request).await?;
        request = buffered;
        let valid = match token {
            Some(token) => {
                db.consume_form_token(&session.uid, &token, FORM_TOKEN_MAX_AGE_SECS)
                    .await?
            }
            None => false,
        };
        if !valid {
            warn!(path = %request.uri().path(), "Invalid CSRF token");
            return Ok(with_cookie(
                Redirect::to(CSRF_FAILURE_REDIRECT).into_response(),
                cookie.as_deref(),
            ));
        }
    }

    let user_before = session.user_id;
    let current = CurrentSession::new(session);
    request.extensions_mut().insert(current.clone());
    let response = next.run(request).await;

    let mut session = current.snapshot();
    if user_before == 0 && session.user_id != 0 && !is_new {
        session.regenerate = true;
    }
    db.save_session(&session).await?;
    Ok(with_cookie(response, cookie.as_deref()))
}

/// Pull the form token from the header or, failing that, from the
/// urlencoded body. The body is buffered and handed back intact.
async fn take_form_token(request: Request) -> PanelResult<(Request, Option<String>)> {
    if let Some(token) = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        let token = token.to_string();
        return Ok((request, Some(token)));
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_FORM_BYTES)
        .await
        .map_err(|_| PanelError::validation("request body too large"))?;
    let token = form_field(&bytes, "token");
    Ok((Request::from_parts(parts, Body::from(bytes)), token))
}

fn form_field(body: &[u8], name: &str) -> Option<String> {
    form_urlencoded::parse(body)
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn with_cookie(mut response: Response, cookie: Option<&str>) -> Response {
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(c).ok()) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}
