#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

//! A cookie-keeping client for the router tests.

use axum::Router;
use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use axum::http::{Method, Request};
use axum::response::Response;
use serde_json::Value;
use tower::ServiceExt;

use crate::session::SESSION_COOKIE;
use crate::test_support::Harness;

use super::router;

pub const PASSWORD: &str = "password123";

/// Drives the full router one request at a time, carrying the session
/// cookie across requests like a browser would.
pub struct TestClient {
    app: Router,
    session: Option<String>,
}

impl TestClient {
    pub fn new(h: &Harness) -> Self {
        Self {
            app: router(h.state()),
            session: None,
        }
    }

    pub async fn send(&mut self, mut request: Request<Body>) -> Response {
        if let Some(uid) = &self.session {
            request.headers_mut().insert(
                COOKIE,
                format!("{SESSION_COOKIE}={uid}").parse().unwrap(),
            );
        }
        let response = self.app.clone().oneshot(request).await.unwrap();
        if let Some(uid) = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .and_then(|pair| pair.strip_prefix(&format!("{SESSION_COOKIE}=")))
        {
            self.session = Some(uid.to_string());
        }
        response
    }

    pub async fn get(&mut self, path: &str) -> Response {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        self.send(request).await
    }

    /// GET a page that must render, returning its JSON view.
    pub async fn page(&mut self, path: &str) -> Value {
        let response = self.get(path).await;
        assert_eq!(response.status(), 200, "GET {path}");
        body_json(response).await
    }

    pub async fn token(&mut self) -> String {
        let view = self.page("/auth/token").await;
        view["token"].as_str().unwrap().to_string()
    }

    /// POST a form without a CSRF token.
    pub async fn post_raw(&mut self, path: &str, fields: &[(&str, &str)]) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(encode_form(fields)))
            .unwrap();
        self.send(request).await
    }

    /// POST a form with a freshly issued CSRF token.
    pub async fn post_form(&mut self, path: &str, fields: &[(&str, &str)]) -> Response {
        let token = self.token().await;
        let mut fields = fields.to_vec();
        fields.push(("token", &token));
        self.post_raw(path, &fields).await
    }

    pub async fn login(&mut self, username: &str) {
        let response = self
            .post_form(
                "/auth/login",
                &[("username", username), ("password", PASSWORD)],
            )
            .await;
        assert_eq!(location(&response), super::DASHBOARD_PAGE);
    }
}

fn encode_form(fields: &[(&str, &str)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish()
}

pub fn location(response: &Response) -> &str {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// A user with [`PASSWORD`] who can log in through the forms.
pub async fn account(h: &Harness, username: &str, credit: i64, admin: bool) -> i64 {
    let user = h.user(username, credit).await;
    h.auth.set_password(user.id, PASSWORD).await.unwrap();
    if admin {
        h.db.set_user_admin(user.id, true).await.unwrap();
    }
    user.id
}
