//! `/panel/*`: pages and form actions of a logged-in user.
//!
//! Every route here sits behind the login check in [`super::router`].

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use chrono::{Datelike, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::auth::{ApiKeyRequest, create_api_key};
use crate::driver::VirtualMachineDetails;
use crate::error::{PanelError, PanelResult};
use crate::payment::parse_amount;
use crate::session::{CurrentSession, issue_form_token};
use crate::storage::ImageStatus;

use super::{AppState, ClientIp, form_outcome, redirect_message};

const VMS_PAGE: &str = "/panel/vms";
const BILLING_PAGE: &str = "/panel/billing";
const IMAGES_PAGE: &str = "/panel/images";
const ACCOUNT_PAGE: &str = "/panel/account";
/// Recent actions shown on the account page.
const ACTION_HISTORY: u32 = 20;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/panel/dashboard", get(dashboard))
        .route("/panel/vms", get(vms))
        .route("/panel/newvm", get(new_vm))
        .route("/panel/newvm/{region}", get(new_vm_region).post(new_vm_create))
        .route("/panel/vm/{id}", get(vm))
        .route("/panel/vm/{id}/start", post(vm_start))
        .route("/panel/vm/{id}/stop", post(vm_stop))
        .route("/panel/vm/{id}/reboot", post(vm_reboot))
        .route("/panel/vm/{id}/delete", post(vm_delete))
        .route("/panel/vm/{id}/vnc", post(vm_vnc))
        .route("/panel/vm/{id}/reimage", post(vm_reimage))
        .route("/panel/vm/{id}/rename", post(vm_rename))
        .route("/panel/vm/{id}/snapshot", post(vm_snapshot))
        .route("/panel/vm/{id}/resize", post(vm_resize))
        .route("/panel/vm/{id}/action/{name}", post(vm_action))
        .route("/panel/vm/{id}/ips", get(vm_ips))
        .route("/panel/vm/{id}/ips/add", post(vm_ips_add))
        .route("/panel/vm/{id}/ips/remove", post(vm_ips_remove))
        .route("/panel/vm/{id}/ips/rdns", post(vm_ips_rdns))
        .route("/panel/billing", get(billing))
        .route("/panel/pay", post(pay))
        .route("/panel/charges", get(charges_current))
        .route("/panel/charges/{year}/{month}", get(charges))
        .route("/panel/images", get(images))
        .route("/panel/images/add", post(image_add))
        .route("/panel/image/{id}", get(image))
        .route("/panel/image/{id}/remove", post(image_remove))
        .route("/panel/account", get(account))
        .route("/panel/account/passwd", post(account_password))
        .route("/panel/api/add", post(api_add))
        .route("/panel/api/{id}/remove", post(api_remove))
        .route("/panel/revert", post(revert))
}

fn vm_page(vm_id: i64) -> String {
    format!("/panel/vm/{vm_id}")
}

/// Redirect back to the VM page, with `message` on success.
fn vm_outcome<T>(result: PanelResult<T>, vm_id: i64, message: &str) -> Response {
    let page = vm_page(vm_id);
    form_outcome(result, &page, |_| redirect_message(&page, "success", message))
}

async fn form_token(state: &AppState, session: &CurrentSession) -> PanelResult<String> {
    Ok(issue_form_token(&state.db, &session.uid()).await?)
}

// =========================================================================
// Overview
// =========================================================================

async fn dashboard(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    let user_id = session.user_id();
    let user = state.db.get_user(user_id).await?;
    let billing = state.accounts.billing();
    Ok(Json(json!({
        "user": user,
        "vms": state.vms.list(user_id).await?,
        "credit": billing.credit_summary(user_id).await?,
        "bandwidth": billing.bandwidth_summary(user_id).await?,
        "impersonating": session.original_id() != 0,
    })))
}

async fn vms(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    Ok(Json(json!({ "vms": state.vms.list(session.user_id()).await? })))
}

/// Regions a VM can currently be created in.
async fn new_vm(State(state): State<AppState>) -> PanelResult<Json<Value>> {
    let regions: Vec<String> = state
        .catalog
        .regions()
        .await?
        .into_iter()
        .filter(|r| r.enabled && state.registry.contains(&r.region))
        .map(|r| r.region)
        .collect();
    Ok(Json(json!({ "regions": regions })))
}

async fn new_vm_region(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(region): Path<String>,
) -> PanelResult<Json<Value>> {
    let user_id = session.user_id();
    let plans: Vec<_> = state
        .catalog
        .region_plans(&region)
        .await?
        .into_iter()
        .filter(|p| p.plan.enabled)
        .collect();
    let (public_images, user_images): (Vec<_>, Vec<_>) = state
        .catalog
        .images(user_id, Some(&region))
        .await?
        .into_iter()
        .filter(|i| i.status == ImageStatus::Active)
        .partition(|i| i.user_id.is_none());

    Ok(Json(json!({
        "region": region,
        "plans": plans,
        "public_images": public_images,
        "user_images": user_images,
        "token": form_token(&state, &session).await?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct NewVmForm {
    pub name: String,
    pub plan_id: i64,
    pub image_id: i64,
}

async fn new_vm_create(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    ClientIp(ip): ClientIp,
    Path(region): Path<String>,
    Form(form): Form<NewVmForm>,
) -> Response {
    let user_id = session.user_id();
    let result = state
        .vms
        .create(user_id, &form.name, form.plan_id, form.image_id)
        .await;
    if result.is_ok() {
        let details = format!(
            "Name: {}, Plan: {}, Image: {}",
            form.name, form.plan_id, form.image_id
        );
        if let Err(e) = state.db.log_action(user_id, &ip, "Create VM", &details).await {
            warn!(error = %e, user_id, "Failed to log action");
        }
    }
    form_outcome(result, &format!("/panel/newvm/{region}"), |vm_id| {
        Redirect::to(&vm_page(vm_id)).into_response()
    })
}

// =========================================================================
// A single VM
// =========================================================================

async fn vm(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
) -> PanelResult<Json<Value>> {
    let user_id = session.user_id();
    let vm = state.vms.get(user_id, vm_id).await?;
    let details = VirtualMachineDetails::from(state.vms.load_info(&vm).await?);
    let images = state.catalog.images(user_id, Some(&vm.region)).await?;
    let plans: Vec<_> = state
        .catalog
        .region_plans(&vm.region)
        .await?
        .into_iter()
        .filter(|p| p.plan.enabled)
        .collect();

    Ok(Json(json!({
        "vm": vm,
        "details": details,
        "images": images,
        "plans": plans,
        "token": form_token(&state, &session).await?,
    })))
}

async fn vm_start(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
) -> Response {
    let result = state.vms.start(session.user_id(), vm_id).await;
    vm_outcome(result, vm_id, "VM is starting")
}

async fn vm_stop(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
) -> Response {
    let result = state.vms.stop(session.user_id(), vm_id).await;
    vm_outcome(result, vm_id, "VM is stopping")
}

async fn vm_reboot(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
) -> Response {
    let result = state.vms.reboot(session.user_id(), vm_id).await;
    vm_outcome(result, vm_id, "VM is rebooting")
}

async fn vm_delete(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
) -> Response {
    let result = state.vms.delete(session.user_id(), vm_id).await;
    form_outcome(result, &vm_page(vm_id), |()| {
        redirect_message(VMS_PAGE, "success", "VM deleted")
    })
}

/// Send the user to the console.
async fn vm_vnc(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
) -> Response {
    let result = state.vms.vnc(session.user_id(), vm_id).await;
    form_outcome(result, &vm_page(vm_id), |url| {
        Redirect::to(&url).into_response()
    })
}

#[derive(Debug, Deserialize)]
pub struct ReimageForm {
    pub image_id: i64,
}

async fn vm_reimage(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
    Form(form): Form<ReimageForm>,
) -> Response {
    let result = state
        .vms
        .reimage(session.user_id(), vm_id, form.image_id)
        .await;
    vm_outcome(result, vm_id, "VM is being reimaged")
}

#[derive(Debug, Deserialize)]
pub struct NameForm {
    pub name: String,
}

async fn vm_rename(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
    Form(form): Form<NameForm>,
) -> Response {
    let result = state.vms.rename(session.user_id(), vm_id, &form.name).await;
    vm_outcome(result, vm_id, "VM renamed")
}

async fn vm_snapshot(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
    Form(form): Form<NameForm>,
) -> Response {
    let result = state
        .vms
        .snapshot(session.user_id(), vm_id, &form.name)
        .await;
    form_outcome(result, &vm_page(vm_id), |image_id| {
        redirect_message(
            &format!("/panel/image/{image_id}"),
            "success",
            "snapshot started",
        )
    })
}

#[derive(Debug, Deserialize)]
pub struct ResizeForm {
    pub plan_id: i64,
}

async fn vm_resize(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
    Form(form): Form<ResizeForm>,
) -> Response {
    let result = state
        .vms
        .resize(session.user_id(), vm_id, form.plan_id)
        .await;
    vm_outcome(result, vm_id, "VM is being resized")
}

#[derive(Debug, Deserialize)]
pub struct ActionForm {
    #[serde(default)]
    pub value: String,
}

async fn vm_action(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path((vm_id, name)): Path<(i64, String)>,
    Form(form): Form<ActionForm>,
) -> Response {
    let result = state
        .vms
        .action(session.user_id(), vm_id, &name, &form.value)
        .await;
    vm_outcome(result, vm_id, "action completed")
}

// =========================================================================
// Addresses
// =========================================================================

fn ips_page(vm_id: i64) -> String {
    format!("/panel/vm/{vm_id}/ips")
}

fn ips_outcome(result: PanelResult<()>, vm_id: i64, message: &str) -> Response {
    let page = ips_page(vm_id);
    form_outcome(result, &page, |()| redirect_message(&page, "success", message))
}

async fn vm_ips(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
) -> PanelResult<Json<Value>> {
    let addresses = state.vms.addresses(session.user_id(), vm_id).await?;
    Ok(Json(json!({
        "vm_id": vm_id,
        "addresses": addresses,
        "token": form_token(&state, &session).await?,
    })))
}

async fn vm_ips_add(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
) -> Response {
    let result = state.vms.add_address(session.user_id(), vm_id).await;
    ips_outcome(result, vm_id, "IP address added")
}

#[derive(Debug, Deserialize)]
pub struct RemoveAddressForm {
    pub ip: String,
    #[serde(default)]
    pub private_ip: String,
}

async fn vm_ips_remove(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
    Form(form): Form<RemoveAddressForm>,
) -> Response {
    let result = state
        .vms
        .remove_address(session.user_id(), vm_id, &form.ip, &form.private_ip)
        .await;
    ips_outcome(result, vm_id, "IP address removed")
}

#[derive(Debug, Deserialize)]
pub struct RdnsForm {
    pub ip: String,
    pub hostname: String,
}

async fn vm_ips_rdns(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(vm_id): Path<i64>,
    Form(form): Form<RdnsForm>,
) -> Response {
    let result = state
        .vms
        .set_rdns(session.user_id(), vm_id, &form.ip, &form.hostname)
        .await;
    ips_outcome(result, vm_id, "reverse DNS updated")
}

// =========================================================================
// Billing
// =========================================================================

async fn billing(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    let user_id = session.user_id();
    let billing = state.accounts.billing();
    let (deposit_minimum, deposit_maximum) = state.config.billing.deposit_range();
    Ok(Json(json!({
        "credit": billing.credit_summary(user_id).await?,
        "bandwidth": billing.bandwidth_summary(user_id).await?,
        "transactions": state.db.list_transactions(Some(user_id)).await?,
        "payment_methods": state.payments.methods(),
        "currency": state.config.billing.currency,
        "deposit_minimum": deposit_minimum,
        "deposit_maximum": deposit_maximum,
        "token": form_token(&state, &session).await?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PayForm {
    pub gateway: String,
    pub amount: String,
}

/// Start a deposit and follow the payment method's redirect.
async fn pay(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Form(form): Form<PayForm>,
) -> Response {
    let result = start_payment(&state, session.user_id(), &form).await;
    form_outcome(result, BILLING_PAGE, |target| {
        Redirect::to(&target).into_response()
    })
}

async fn start_payment(state: &AppState, user_id: i64, form: &PayForm) -> PanelResult<String> {
    let amount = parse_amount(&form.amount)?;
    let user = state.db.get_user(user_id).await?;
    state
        .payments
        .pay(
            &form.gateway,
            user_id,
            &user.username,
            amount,
            state.config.billing.deposit_range(),
        )
        .await
}

async fn charges_current(
    state: State<AppState>,
    session: Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    let now = Utc::now();
    charges(state, session, Path((now.year(), now.month()))).await
}

async fn charges(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path((year, month)): Path<(i32, u32)>,
) -> PanelResult<Json<Value>> {
    let charges = state
        .accounts
        .billing()
        .charge_list(session.user_id(), year, month)
        .await?;
    let (previous, next) = adjacent_months(year, month);
    Ok(Json(json!({
        "year": year,
        "month": month,
        "charges": charges,
        "previous": previous,
        "next": next,
    })))
}

/// `[year, month]` of the months before and after.
fn adjacent_months(year: i32, month: u32) -> ([i64; 2], [i64; 2]) {
    let index = i64::from(year) * 12 + i64::from(month) - 1;
    let split = |i: i64| [i.div_euclid(12), i.rem_euclid(12) + 1];
    (split(index - 1), split(index + 1))
}

// =========================================================================
// Images
// =========================================================================

async fn images(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    let user_id = session.user_id();
    let images: Vec<_> = state
        .catalog
        .images(user_id, None)
        .await?
        .into_iter()
        .filter(|i| i.user_id == Some(user_id))
        .collect();
    Ok(Json(json!({
        "images": images,
        "regions": state.registry.regions(),
        "token": form_token(&state, &session).await?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ImageAddForm {
    pub region: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub format: String,
}

async fn image_add(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Form(form): Form<ImageAddForm>,
) -> Response {
    let result = state
        .catalog
        .fetch_image(
            session.user_id(),
            &form.region,
            &form.name,
            &form.url,
            &form.format,
        )
        .await;
    form_outcome(result, IMAGES_PAGE, |_| {
        redirect_message(IMAGES_PAGE, "success", "image import started")
    })
}

async fn image(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(image_id): Path<i64>,
) -> PanelResult<Json<Value>> {
    let details = state
        .catalog
        .image_info(session.user_id(), image_id)
        .await?;
    Ok(Json(json!({
        "image": details.image,
        "details": details.info,
        "token": form_token(&state, &session).await?,
    })))
}

async fn image_remove(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(image_id): Path<i64>,
) -> Response {
    let result = state
        .catalog
        .delete_image(session.user_id(), image_id)
        .await;
    form_outcome(result, IMAGES_PAGE, |()| {
        redirect_message(IMAGES_PAGE, "success", "image deleted")
    })
}

// =========================================================================
// Account
// =========================================================================

async fn account(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    let user_id = session.user_id();
    Ok(Json(json!({
        "user": state.db.get_user(user_id).await?,
        "api_keys": state.db.list_api_keys(user_id).await?,
        "actions": state.db.list_actions(user_id, ACTION_HISTORY).await?,
        "token": form_token(&state, &session).await?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    pub old_password: String,
    pub new_password: String,
    pub new_password_confirm: String,
}

async fn account_password(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    ClientIp(ip): ClientIp,
    Form(form): Form<PasswordForm>,
) -> Response {
    let result = if form.new_password == form.new_password_confirm {
        state
            .auth
            .change_password(&ip, session.user_id(), &form.old_password, &form.new_password)
            .await
    } else {
        Err(PanelError::validation("new passwords do not match"))
    };
    form_outcome(result, ACCOUNT_PAGE, |()| {
        redirect_message(ACCOUNT_PAGE, "success", "password changed")
    })
}

#[derive(Debug, Deserialize)]
pub struct ApiAddForm {
    pub label: String,
    #[serde(default)]
    pub restrict_action: String,
    #[serde(default)]
    pub restrict_ip: String,
}

/// Create an API key. The secret is shown once, in the redirect message.
async fn api_add(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Form(form): Form<ApiAddForm>,
) -> Response {
    let request = ApiKeyRequest {
        label: &form.label,
        restrict_action: &form.restrict_action,
        restrict_ip: &form.restrict_ip,
    };
    let result = create_api_key(&state.db, session.user_id(), &request).await;
    form_outcome(result, ACCOUNT_PAGE, |key| {
        redirect_message(
            ACCOUNT_PAGE,
            "success",
            &format!(
                "API key created: ID {} with secret {}",
                key.api_id, key.api_key
            ),
        )
    })
}

async fn api_remove(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(key_id): Path<i64>,
) -> Response {
    let result = state
        .db
        .delete_api_key(key_id, session.user_id())
        .await
        .map_err(PanelError::from);
    form_outcome(result, ACCOUNT_PAGE, |_| {
        redirect_message(ACCOUNT_PAGE, "success", "API key deleted")
    })
}

/// Return from impersonating a user to the admin's own account.
async fn revert(Extension(session): Extension<CurrentSession>) -> Response {
    if session.revert() {
        Redirect::to("/admin/users").into_response()
    } else {
        Redirect::to(super::DASHBOARD_PAGE).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_months_wrap_years() {
        assert_eq!(adjacent_months(2024, 1), ([2023, 12], [2024, 2]));
        assert_eq!(adjacent_months(2024, 12), ([2024, 11], [2025, 1]));
        assert_eq!(adjacent_months(2024, 6), ([2024, 5], [2024, 7]));
    }
}
