#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use axum::http::StatusCode;

use crate::test_support::harness;

use super::test_helpers::{PASSWORD, TestClient, account, location};
use super::{DASHBOARD_PAGE, LOGIN_PAGE};

#[tokio::test]
async fn login_opens_the_dashboard() {
    let h = harness().await;
    let alice = account(&h, "alice", 0, false).await;
    let mut client = TestClient::new(&h);

    client.login("alice").await;

    let view = client.page(DASHBOARD_PAGE).await;
    assert_eq!(view["user"]["id"], alice);
    assert_eq!(view["impersonating"], false);
}

#[tokio::test]
async fn wrong_password_returns_to_login_with_message() {
    let h = harness().await;
    account(&h, "alice", 0, false).await;
    let mut client = TestClient::new(&h);

    let response = client
        .post_form(
            "/auth/login",
            &[("username", "alice"), ("password", "not-the-password")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert!(target.starts_with("/login?message="), "{target}");
    assert!(target.ends_with("&type=danger"));

    let response = client.get(DASHBOARD_PAGE).await;
    assert_eq!(location(&response), LOGIN_PAGE);
}

#[tokio::test]
async fn post_without_form_token_is_ignored() {
    let h = harness().await;
    account(&h, "alice", 0, false).await;
    let mut client = TestClient::new(&h);
    client.get("/auth/token").await;

    let response = client
        .post_raw(
            "/auth/login",
            &[("username", "alice"), ("password", PASSWORD)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    // The handler never ran, so the session is still anonymous.
    let response = client.get(DASHBOARD_PAGE).await;
    assert_eq!(location(&response), LOGIN_PAGE);
}

#[tokio::test]
async fn form_token_is_single_use() {
    let h = harness().await;
    account(&h, "alice", 0, false).await;
    let mut client = TestClient::new(&h);
    let token = client.token().await;
    let fields = [
        ("username", "alice"),
        ("password", "not-the-password"),
        ("token", token.as_str()),
    ];

    let first = client.post_raw("/auth/login", &fields).await;
    assert!(location(&first).starts_with("/login?message="));

    let replay = client.post_raw("/auth/login", &fields).await;
    assert_eq!(location(&replay), DASHBOARD_PAGE);
}

#[tokio::test]
async fn registration_logs_in() {
    let h = harness().await;
    let mut client = TestClient::new(&h);

    let response = client
        .post_form(
            "/auth/create",
            &[("username", "newcomer"), ("password", PASSWORD)],
        )
        .await;
    assert_eq!(location(&response), DASHBOARD_PAGE);

    let view = client.page(DASHBOARD_PAGE).await;
    assert_eq!(view["user"]["username"], "newcomer");
}

#[tokio::test]
async fn registration_errors_return_to_form() {
    let h = harness().await;
    let mut client = TestClient::new(&h);

    let response = client
        .post_form("/auth/create", &[("username", "x"), ("password", PASSWORD)])
        .await;
    assert!(location(&response).starts_with("/create?message=username+must+be+between"));
}

#[tokio::test]
async fn logout_ends_the_session() {
    let h = harness().await;
    account(&h, "alice", 0, false).await;
    let mut client = TestClient::new(&h);
    client.login("alice").await;

    let response = client.get("/auth/logout").await;
    assert_eq!(location(&response), "/");

    let response = client.get(DASHBOARD_PAGE).await;
    assert_eq!(location(&response), LOGIN_PAGE);
}

#[tokio::test]
async fn panel_root_redirects_to_dashboard() {
    let h = harness().await;
    let mut client = TestClient::new(&h);
    let response = client.get("/panel").await;
    assert_eq!(location(&response), DASHBOARD_PAGE);
}
