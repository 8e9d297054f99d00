//! `/api/*`: the JSON API.
//!
//! Requests authenticate with `Authorization: lobster <authdata>`, signed
//! with an API key, or `Authorization: session <form token>` together with
//! the session cookie. Request and response bodies are the types from
//! [`lobster_client`]; failures answer `{"error": "..."}`.

use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::de::DeserializeOwned;
use tower_http::cors::CorsLayer;
use tracing::debug;

use lobster_client as wire;

use crate::auth::api_key::MAX_API_BODY;
use crate::auth::{ApiCaller, authenticate_signature};
use crate::driver::{ImageInfo, VirtualMachineDetails};
use crate::error::{PanelError, PanelResult};
use crate::session::authenticate_token;
use crate::storage::{Image, Plan, Vm};

use super::{AppState, client_ip};

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/vms", get(vm_list).post(vm_create))
        .route("/api/vms/{id}", get(vm_info).delete(vm_delete))
        .route("/api/vms/{id}/action", post(vm_action))
        .route("/api/vms/{id}/reimage", post(vm_reimage))
        .route("/api/vms/{id}/resize", post(vm_resize))
        .route("/api/vms/{id}/ips", get(vm_addresses))
        .route("/api/vms/{id}/ips/add", post(vm_address_add))
        .route("/api/vms/{id}/ips/remove", post(vm_address_remove))
        .route("/api/vms/{id}/ips/{ip}/rdns", post(vm_address_rdns))
        .route("/api/images", get(image_list).post(image_fetch))
        .route("/api/images/{id}", get(image_info).delete(image_delete))
        .route("/api/plans", get(plan_list))
        .route_layer(from_fn_with_state(state, authenticate))
        .layer(CorsLayer::permissive())
}

async fn authenticate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match authorize(&state, request).await {
        Ok(request) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Check the `Authorization` header against the buffered body and attach
/// the [`ApiCaller`]. The body is handed on intact.
async fn authorize(state: &AppState, request: Request) -> PanelResult<Request> {
    let (mut parts, body) = request.into_parts();
    let authorization = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(PanelError::AuthFailure)?
        .to_string();
    let bytes = axum::body::to_bytes(body, MAX_API_BODY)
        .await
        .map_err(|_| {
            PanelError::validation(format!("request body too long (max is {MAX_API_BODY})"))
        })?;

    let caller = match authorization.split_once(' ') {
        Some(("lobster", authdata)) => {
            let path = parts.uri.path().strip_prefix("/api/").unwrap_or_default();
            let ip = client_ip(
                &parts.headers,
                parts.extensions.get::<ConnectInfo<SocketAddr>>(),
                &state.config.default.proxy_header,
            );
            authenticate_signature(
                &state.db,
                authdata,
                parts.method.as_str(),
                path,
                &bytes,
                &ip,
            )
            .await?
        }
        Some(("session", token)) => {
            let session = authenticate_token(&state.db, &parts.headers, token).await?;
            ApiCaller {
                user_id: session.user_id,
                key_id: None,
            }
        }
        _ => {
            return Err(PanelError::validation(
                "authorization header must take the form 'lobster authdata'",
            ));
        }
    };
    debug!(user_id = caller.user_id, key_id = ?caller.key_id, path = %parts.uri.path(), "API request");

    parts.extensions.insert(caller);
    Ok(Request::from_parts(parts, Body::from(bytes)))
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> PanelResult<T> {
    serde_json::from_slice(body).map_err(|e| PanelError::validation(format!("invalid json: {e}")))
}

fn vm_response(vm: &Vm) -> wire::VirtualMachine {
    wire::VirtualMachine {
        id: vm.id,
        plan_id: vm.plan_id,
        region: vm.region.clone(),
        name: vm.name.clone(),
        status: vm.status.as_str().to_string(),
        task_pending: vm.task_pending,
        external_ip: vm.external_ip.clone(),
        private_ip: vm.private_ip.clone(),
        created_time: vm.time_created,
    }
}

fn image_response(image: &Image) -> wire::Image {
    wire::Image {
        id: image.id,
        region: image.region.clone(),
        name: image.name.clone(),
        status: image.status.as_str().to_string(),
    }
}

fn image_details_response(info: ImageInfo) -> wire::ImageDetails {
    wire::ImageDetails {
        size: info.size,
        status: info
            .status
            .map_or_else(String::new, |s| s.as_str().to_string()),
        details: info.details,
    }
}

fn plan_response(plan: &Plan) -> wire::Plan {
    wire::Plan {
        id: plan.id,
        name: plan.name.clone(),
        price: plan.price,
        ram: plan.ram,
        cpu: plan.cpu,
        storage: plan.storage,
        bandwidth: plan.bandwidth,
    }
}

// =========================================================================
// Virtual machines
// =========================================================================

async fn vm_list(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> PanelResult<Json<wire::VmListResponse>> {
    let vms = state.vms.list(caller.user_id).await?;
    Ok(Json(wire::VmListResponse {
        vms: vms.iter().map(vm_response).collect(),
    }))
}

async fn vm_create(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    body: Bytes,
) -> PanelResult<Response> {
    let request: wire::VmCreateRequest = parse(&body)?;
    let id = state
        .vms
        .create(caller.user_id, &request.name, request.plan_id, request.image_id)
        .await?;
    Ok((StatusCode::CREATED, Json(wire::VmCreateResponse { id })).into_response())
}

async fn vm_info(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(vm_id): Path<i64>,
) -> PanelResult<Json<wire::VmInfoResponse>> {
    let vm = state.vms.get(caller.user_id, vm_id).await?;
    let details = VirtualMachineDetails::from(state.vms.load_info(&vm).await?);
    Ok(Json(wire::VmInfoResponse {
        vm: vm_response(&vm),
        details,
    }))
}

async fn vm_delete(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(vm_id): Path<i64>,
) -> PanelResult<StatusCode> {
    state.vms.delete(caller.user_id, vm_id).await?;
    Ok(StatusCode::OK)
}

/// Power actions, console, rename, snapshot or a driver-specific action.
async fn vm_action(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(vm_id): Path<i64>,
    body: Bytes,
) -> PanelResult<Response> {
    let request: wire::VmActionRequest = parse(&body)?;
    let user_id = caller.user_id;
    let vms = &state.vms;
    match request.action.as_str() {
        "start" => vms.start(user_id, vm_id).await.map(|()| StatusCode::OK.into_response()),
        "stop" => vms.stop(user_id, vm_id).await.map(|()| StatusCode::OK.into_response()),
        "reboot" => vms.reboot(user_id, vm_id).await.map(|()| StatusCode::OK.into_response()),
        "vnc" => vms
            .vnc(user_id, vm_id)
            .await
            .map(|url| Json(wire::VmVncResponse { url }).into_response()),
        "rename" => vms
            .rename(user_id, vm_id, &request.value)
            .await
            .map(|()| StatusCode::OK.into_response()),
        "snapshot" => vms
            .snapshot(user_id, vm_id, &request.value)
            .await
            .map(|id| Json(wire::VmSnapshotResponse { id }).into_response()),
        other => vms
            .action(user_id, vm_id, other, &request.value)
            .await
            .map(|()| StatusCode::OK.into_response()),
    }
}

async fn vm_reimage(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(vm_id): Path<i64>,
    body: Bytes,
) -> PanelResult<StatusCode> {
    let request: wire::VmReimageRequest = parse(&body)?;
    state
        .vms
        .reimage(caller.user_id, vm_id, request.image_id)
        .await?;
    Ok(StatusCode::OK)
}

async fn vm_resize(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(vm_id): Path<i64>,
    body: Bytes,
) -> PanelResult<StatusCode> {
    let request: wire::VmResizeRequest = parse(&body)?;
    state
        .vms
        .resize(caller.user_id, vm_id, request.plan_id)
        .await?;
    Ok(StatusCode::OK)
}

async fn vm_addresses(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(vm_id): Path<i64>,
) -> PanelResult<Json<wire::VmAddressesResponse>> {
    let addresses = state.vms.addresses(caller.user_id, vm_id).await?;
    Ok(Json(wire::VmAddressesResponse { addresses }))
}

async fn vm_address_add(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(vm_id): Path<i64>,
) -> PanelResult<StatusCode> {
    state.vms.add_address(caller.user_id, vm_id).await?;
    Ok(StatusCode::OK)
}

async fn vm_address_remove(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(vm_id): Path<i64>,
    body: Bytes,
) -> PanelResult<StatusCode> {
    let request: wire::VmAddressRemoveRequest = parse(&body)?;
    state
        .vms
        .remove_address(caller.user_id, vm_id, &request.ip, &request.private_ip)
        .await?;
    Ok(StatusCode::OK)
}

async fn vm_address_rdns(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path((vm_id, ip)): Path<(i64, String)>,
    body: Bytes,
) -> PanelResult<StatusCode> {
    let request: wire::VmAddressRdnsRequest = parse(&body)?;
    state
        .vms
        .set_rdns(caller.user_id, vm_id, &ip, &request.hostname)
        .await?;
    Ok(StatusCode::OK)
}

// =========================================================================
// Images and plans
// =========================================================================

async fn image_list(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> PanelResult<Json<wire::ImageListResponse>> {
    let images = state.catalog.images(caller.user_id, None).await?;
    Ok(Json(wire::ImageListResponse {
        images: images.iter().map(image_response).collect(),
    }))
}

async fn image_fetch(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    body: Bytes,
) -> PanelResult<Response> {
    let request: wire::ImageFetchRequest = parse(&body)?;
    let image = state
        .catalog
        .fetch_image(
            caller.user_id,
            &request.region,
            &request.name,
            &request.url,
            &request.format,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(wire::ImageFetchResponse { id: image.id }),
    )
        .into_response())
}

async fn image_info(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(image_id): Path<i64>,
) -> PanelResult<Json<wire::ImageInfoResponse>> {
    let details = state.catalog.image_info(caller.user_id, image_id).await?;
    Ok(Json(wire::ImageInfoResponse {
        image: image_response(&details.image),
        details: image_details_response(details.info),
    }))
}

async fn image_delete(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(image_id): Path<i64>,
) -> PanelResult<StatusCode> {
    state.catalog.delete_image(caller.user_id, image_id).await?;
    Ok(StatusCode::OK)
}

async fn plan_list(State(state): State<AppState>) -> PanelResult<Json<wire::PlanListResponse>> {
    let plans = state.catalog.plans().await?;
    Ok(Json(wire::PlanListResponse {
        plans: plans.iter().map(plan_response).collect(),
    }))
}
