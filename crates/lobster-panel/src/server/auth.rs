//! `/auth/*`: login, registration, logout and password reset.

use axum::extract::State;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::PanelResult;
use crate::session::{CurrentSession, issue_form_token};

use super::{AppState, ClientIp, DASHBOARD_PAGE, LOGIN_PAGE, form_outcome, redirect_message};

const CREATE_PAGE: &str = "/create";
const PWRESET_PAGE: &str = "/pwreset";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/create", post(create))
        .route("/auth/logout", get(logout))
        .route("/auth/pwreset", post(pwreset_request))
        .route("/auth/pwreset/submit", post(pwreset_submit))
        .route("/auth/token", get(token))
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

async fn login(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    ClientIp(ip): ClientIp,
    Form(form): Form<LoginForm>,
) -> Response {
    let result = state.auth.login(&ip, &form.username, &form.password).await;
    form_outcome(result, LOGIN_PAGE, |user| {
        session.login(user.id, user.admin);
        Redirect::to(DASHBOARD_PAGE).into_response()
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateForm {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
}

/// Register and log straight in.
async fn create(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    ClientIp(ip): ClientIp,
    Form(form): Form<CreateForm>,
) -> Response {
    let result = state
        .auth
        .create(&ip, &form.username, &form.password, &form.email)
        .await;
    form_outcome(result, CREATE_PAGE, |user| {
        session.login(user.id, user.admin);
        Redirect::to(DASHBOARD_PAGE).into_response()
    })
}

async fn logout(Extension(session): Extension<CurrentSession>) -> Redirect {
    session.logout();
    Redirect::to("/")
}

#[derive(Debug, Deserialize)]
pub struct PwresetRequestForm {
    pub username: String,
    pub email: String,
}

async fn pwreset_request(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Form(form): Form<PwresetRequestForm>,
) -> Response {
    let result = state
        .auth
        .pwreset_request(&ip, &form.username, &form.email)
        .await;
    form_outcome(result, PWRESET_PAGE, |()| {
        redirect_message(
            PWRESET_PAGE,
            "success",
            "a password reset link has been sent to your email address",
        )
    })
}

#[derive(Debug, Deserialize)]
pub struct PwresetSubmitForm {
    pub user_id: i64,
    pub pwreset_token: String,
    pub password: String,
}

async fn pwreset_submit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Form(form): Form<PwresetSubmitForm>,
) -> Response {
    let result = state
        .auth
        .pwreset_submit(&ip, form.user_id, &form.pwreset_token, &form.password)
        .await;
    form_outcome(result, PWRESET_PAGE, |()| {
        redirect_message(LOGIN_PAGE, "success", "your password has been reset")
    })
}

/// A fresh form token for the current session.
async fn token(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    let token = issue_form_token(&state.db, &session.uid()).await?;
    Ok(Json(json!({ "token": token })))
}
