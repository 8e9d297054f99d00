//! `/admin/*`: operator pages and form actions.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::error::{PanelError, PanelResult};
use crate::payment::parse_credit;
use crate::session::{CurrentSession, issue_form_token};
use crate::storage::{PlanParams, Suspension, UserStatus};

use super::{AppState, DASHBOARD_PAGE, form_outcome, redirect_message};

const USERS_PAGE: &str = "/admin/users";
const PLANS_PAGE: &str = "/admin/plans";
const IMAGES_PAGE: &str = "/admin/images";
const REGIONS_PAGE: &str = "/admin/regions";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/dashboard", get(dashboard))
        .route("/admin/users", get(users))
        .route("/admin/user/{id}", get(user))
        .route("/admin/user/{id}/login", post(user_login))
        .route("/admin/user/{id}/credit", post(user_credit))
        .route("/admin/user/{id}/password", post(user_password))
        .route("/admin/user/{id}/disable", post(user_disable))
        .route("/admin/user/{id}/enable", post(user_enable))
        .route("/admin/plans", get(plans))
        .route("/admin/plans/add", post(plan_add))
        .route("/admin/plan/{id}", get(plan))
        .route("/admin/plan/{id}/delete", post(plan_delete))
        .route("/admin/plan/{id}/enable", post(plan_enable))
        .route("/admin/plan/{id}/disable", post(plan_disable))
        .route("/admin/plan/{id}/associate", post(plan_associate))
        .route("/admin/plan/{id}/deassociate", post(plan_deassociate))
        .route("/admin/plans/autopopulate/{region}", post(plans_autopopulate))
        .route("/admin/images", get(images))
        .route("/admin/images/add", post(image_add))
        .route("/admin/image/{id}/delete", post(image_delete))
        .route("/admin/images/autopopulate/{region}", post(images_autopopulate))
        .route("/admin/regions", get(regions))
        .route("/admin/region/{region}/enable", post(region_enable))
        .route("/admin/region/{region}/disable", post(region_disable))
        .route("/admin/vms", get(vms))
        .route("/admin/vm/{id}/suspend", post(vm_suspend))
        .route("/admin/vm/{id}/unsuspend", post(vm_unsuspend))
        .route("/admin/transactions/add", post(transaction_add))
}

fn user_page(user_id: i64) -> String {
    format!("/admin/user/{user_id}")
}

fn plan_page(plan_id: i64) -> String {
    format!("/admin/plan/{plan_id}")
}

fn done<T>(result: PanelResult<T>, page: &str, message: &str) -> Response {
    form_outcome(result, page, |_| redirect_message(page, "success", message))
}

async fn form_token(state: &AppState, session: &CurrentSession) -> PanelResult<String> {
    Ok(issue_form_token(&state.db, &session.uid()).await?)
}

// =========================================================================
// Users
// =========================================================================

async fn dashboard(State(state): State<AppState>) -> PanelResult<Json<Value>> {
    let users = state.db.list_users().await?;
    let vms = state.db.list_all_vms().await?;
    Ok(Json(json!({
        "users": users.len(),
        "vms": vms.len(),
        "regions": state.registry.regions(),
    })))
}

async fn users(State(state): State<AppState>) -> PanelResult<Json<Value>> {
    Ok(Json(json!({ "users": state.db.list_users().await? })))
}

async fn user(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(user_id): Path<i64>,
) -> PanelResult<Json<Value>> {
    Ok(Json(json!({
        "user": state.db.get_user(user_id).await?,
        "vms": state.vms.list(user_id).await?,
        "transactions": state.db.list_transactions(Some(user_id)).await?,
        "token": form_token(&state, &session).await?,
    })))
}

/// Act as another user until `/panel/revert` or the next admin page.
async fn user_login(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(user_id): Path<i64>,
) -> Response {
    let result = state.db.get_user(user_id).await.map_err(PanelError::from);
    form_outcome(result, USERS_PAGE, |user| {
        info!(admin_id = session.user_id(), user_id = user.id, "Impersonating user");
        session.impersonate(user.id);
        Redirect::to(DASHBOARD_PAGE).into_response()
    })
}

#[derive(Debug, Deserialize)]
pub struct CreditForm {
    pub credit: String,
    #[serde(default)]
    pub description: String,
}

async fn user_credit(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Form(form): Form<CreditForm>,
) -> Response {
    let result = match parse_credit(&form.credit) {
        Ok(amount) => {
            state
                .accounts
                .apply_credit(user_id, amount, &form.description)
                .await
        }
        Err(e) => Err(e),
    };
    done(result, &user_page(user_id), "credit applied")
}

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    pub password: String,
    pub password_confirm: String,
}

async fn user_password(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Form(form): Form<PasswordForm>,
) -> Response {
    let result = if form.password == form.password_confirm {
        state.auth.set_password(user_id, &form.password).await
    } else {
        Err(PanelError::validation("passwords do not match"))
    };
    done(result, &user_page(user_id), "password reset")
}

async fn set_status(state: &AppState, user_id: i64, status: UserStatus) -> PanelResult<()> {
    if !state.db.set_user_status(user_id, status).await? {
        return Err(PanelError::NotFound(format!("User {user_id}")));
    }
    info!(user_id, ?status, "User status changed");
    Ok(())
}

async fn user_disable(State(state): State<AppState>, Path(user_id): Path<i64>) -> Response {
    let result = set_status(&state, user_id, UserStatus::Disabled).await;
    done(result, &user_page(user_id), "account disabled")
}

async fn user_enable(State(state): State<AppState>, Path(user_id): Path<i64>) -> Response {
    let result = set_status(&state, user_id, UserStatus::Active).await;
    done(result, &user_page(user_id), "account enabled")
}

// =========================================================================
// Plans
// =========================================================================

async fn plans(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    let mut plans = Vec::new();
    for plan in state.catalog.all_plans().await? {
        let bindings = state.db.list_plan_bindings(plan.id).await?;
        plans.push(json!({ "plan": plan, "regions": bindings }));
    }
    Ok(Json(json!({
        "plans": plans,
        "regions": state.registry.regions(),
        "token": form_token(&state, &session).await?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PlanForm {
    pub name: String,
    /// Currency per hour.
    pub price: String,
    pub ram: i64,
    pub cpu: i64,
    pub storage: i64,
    pub bandwidth: i64,
    /// Checkbox: offered in every region unless unset.
    #[serde(default)]
    pub regional: Option<String>,
}

async fn plan_add(State(state): State<AppState>, Form(form): Form<PlanForm>) -> Response {
    let result = match parse_credit(&form.price) {
        Ok(price) => {
            state
                .catalog
                .create_plan(&PlanParams {
                    name: &form.name,
                    price,
                    ram: form.ram,
                    cpu: form.cpu,
                    storage: form.storage,
                    bandwidth: form.bandwidth,
                    global: form.regional.is_none(),
                })
                .await
        }
        Err(e) => Err(e),
    };
    done(result, PLANS_PAGE, "plan created")
}

async fn plan(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
    Path(plan_id): Path<i64>,
) -> PanelResult<Json<Value>> {
    Ok(Json(json!({
        "plan": state.db.get_plan(plan_id).await?,
        "bindings": state.db.list_plan_bindings(plan_id).await?,
        "regions": state.registry.regions(),
        "token": form_token(&state, &session).await?,
    })))
}

async fn plan_enable(State(state): State<AppState>, Path(plan_id): Path<i64>) -> Response {
    let result = state.catalog.set_plan_enabled(plan_id, true).await;
    done(result, &plan_page(plan_id), "plan enabled")
}

async fn plan_disable(State(state): State<AppState>, Path(plan_id): Path<i64>) -> Response {
    let result = state.catalog.set_plan_enabled(plan_id, false).await;
    done(result, &plan_page(plan_id), "plan disabled")
}

async fn plan_delete(State(state): State<AppState>, Path(plan_id): Path<i64>) -> Response {
    let result = state.catalog.delete_plan(plan_id).await;
    done(result, PLANS_PAGE, "plan deleted")
}

#[derive(Debug, Deserialize)]
pub struct AssociateForm {
    pub region: String,
    #[serde(default)]
    pub identification: String,
}

async fn plan_associate(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Form(form): Form<AssociateForm>,
) -> Response {
    let result = state
        .catalog
        .associate_plan(plan_id, &form.region, &form.identification)
        .await;
    done(result, PLANS_PAGE, "plan associated with region")
}

#[derive(Debug, Deserialize)]
pub struct RegionForm {
    pub region: String,
}

async fn plan_deassociate(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Form(form): Form<RegionForm>,
) -> Response {
    let result = state.catalog.deassociate_plan(plan_id, &form.region).await;
    done(result, PLANS_PAGE, "plan removed from region")
}

async fn plans_autopopulate(
    State(state): State<AppState>,
    Path(region): Path<String>,
) -> Response {
    let result = state.catalog.autopopulate_plans(&region).await;
    form_outcome(result, PLANS_PAGE, |added| {
        redirect_message(PLANS_PAGE, "success", &format!("{added} plans added"))
    })
}

// =========================================================================
// Images
// =========================================================================

async fn images(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    Ok(Json(json!({
        "images": state.catalog.all_images().await?,
        "regions": state.registry.regions(),
        "token": form_token(&state, &session).await?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ImageForm {
    pub region: String,
    pub name: String,
    pub identification: String,
}

async fn image_add(State(state): State<AppState>, Form(form): Form<ImageForm>) -> Response {
    let result = state
        .catalog
        .add_public_image(&form.region, &form.name, &form.identification)
        .await;
    done(result, IMAGES_PAGE, "image added")
}

async fn image_delete(State(state): State<AppState>, Path(image_id): Path<i64>) -> Response {
    let result = state.catalog.delete_image_force(image_id).await;
    done(result, IMAGES_PAGE, "image deleted")
}

async fn images_autopopulate(
    State(state): State<AppState>,
    Path(region): Path<String>,
) -> Response {
    let result = state.catalog.autopopulate_images(&region).await;
    form_outcome(result, IMAGES_PAGE, |added| {
        redirect_message(IMAGES_PAGE, "success", &format!("{added} images added"))
    })
}

// =========================================================================
// Regions and VMs
// =========================================================================

async fn regions(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    Ok(Json(json!({
        "regions": state.catalog.regions().await?,
        "token": form_token(&state, &session).await?,
    })))
}

async fn region_enable(State(state): State<AppState>, Path(region): Path<String>) -> Response {
    let result = state.catalog.set_region_enabled(&region, true).await;
    done(result, REGIONS_PAGE, "region enabled")
}

async fn region_disable(State(state): State<AppState>, Path(region): Path<String>) -> Response {
    let result = state.catalog.set_region_enabled(&region, false).await;
    done(result, REGIONS_PAGE, "region disabled")
}

/// Every VM on the panel, newest last.
async fn vms(
    State(state): State<AppState>,
    Extension(session): Extension<CurrentSession>,
) -> PanelResult<Json<Value>> {
    Ok(Json(json!({
        "vms": state.db.list_all_vms().await?,
        "token": form_token(&state, &session).await?,
    })))
}

async fn vm_suspend(State(state): State<AppState>, Path(vm_id): Path<i64>) -> Response {
    let result = match state.db.get_vm(vm_id).await {
        Ok(vm) => state
            .vms
            .suspend(vm_id, Suspension::Manual)
            .await
            .map(|()| vm.user_id),
        Err(e) => Err(e.into()),
    };
    form_outcome(result, USERS_PAGE, |user_id| {
        redirect_message(&user_page(user_id), "success", "VM suspended")
    })
}

async fn vm_unsuspend(State(state): State<AppState>, Path(vm_id): Path<i64>) -> Response {
    let result = match state.db.get_vm(vm_id).await {
        Ok(vm) => state.vms.unsuspend(vm_id).await.map(|()| vm.user_id),
        Err(e) => Err(e.into()),
    };
    form_outcome(result, USERS_PAGE, |user_id| {
        redirect_message(&user_page(user_id), "success", "VM unsuspended")
    })
}

#[derive(Debug, Deserialize)]
pub struct TransactionForm {
    pub user_id: i64,
    pub gateway: String,
    pub gateway_identifier: String,
    #[serde(default)]
    pub notes: String,
    pub amount: String,
    #[serde(default)]
    pub fee: String,
}

/// Record a payment received outside the configured payment methods.
async fn transaction_add(
    State(state): State<AppState>,
    Form(form): Form<TransactionForm>,
) -> Response {
    let page = user_page(form.user_id);
    let result = record_transaction(&state, &form).await;
    form_outcome(result, &page, |recorded| {
        let message = if recorded {
            "transaction added"
        } else {
            "duplicate transaction ignored"
        };
        redirect_message(&page, "success", message)
    })
}

async fn record_transaction(state: &AppState, form: &TransactionForm) -> PanelResult<bool> {
    let amount = parse_credit(&form.amount)?;
    let fee = if form.fee.trim().is_empty() {
        0
    } else {
        parse_credit(&form.fee)?
    };
    let transaction = state
        .accounts
        .add_transaction(
            form.user_id,
            &form.gateway,
            &form.gateway_identifier,
            &form.notes,
            amount,
            fee,
        )
        .await?;
    Ok(transaction.is_some())
}
