//! The operator HTTP surface: registry mutations and queries, metrics
//! exposition and the status page.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use helmsman_chain_client::ChainClient;
use helmsman_registry::UpgradeRegistry;
use helmsman_types::{ProviderKind, Upgrade, UpgradeStatus, UpgradeType, Version};
use metrics_exporter_prometheus::PrometheusHandle;
use poem::{
    EndpointExt as _, Response, Route, Server, get, handler,
    http::StatusCode,
    listener::TcpListener,
    post,
    web::{Data, Json, Query},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{daemon::LoopStatus, index};

pub struct ApiState {
    pub registry: Arc<UpgradeRegistry>,
    pub client: ChainClient,
    pub network: String,
    pub status: Arc<RwLock<LoopStatus>>,
    pub metrics_handle: PrometheusHandle,
    pub proposals_interval: Duration,
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState").field("network", &self.network).finish_non_exhaustive()
    }
}

/// Serve the API until the token is cancelled.
pub async fn serve_api(
    state: Arc<ApiState>,
    addr: String,
    cancel: CancellationToken,
) -> eyre::Result<()> {
    let app = Route::new()
        .at("/", get(index_page))
        .at("/metrics", get(prometheus_metrics))
        .at("/v1/height", get(latest_height))
        .at("/v1/upgrades/add", post(add_upgrade))
        .at("/v1/upgrades/cancel", post(cancel_upgrade))
        .at("/v1/upgrades/list", get(list_upgrades))
        .at("/v1/upgrades/force_sync", post(force_sync))
        .at("/v1/versions/add", post(add_version))
        .at("/v1/versions/list", get(list_versions))
        .at("/v1/versions/get", get(get_version))
        .data(state);

    info!(%addr, "serving the operator api");
    Server::new(TcpListener::bind(addr))
        .run_with_graceful_shutdown(app, cancel.cancelled_owned(), Some(Duration::from_secs(5)))
        .await?;
    Ok(())
}

fn internal<E: std::fmt::Display>(err: E) -> poem::Error {
    poem::Error::from_string(err.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

/// Fetch the tip and run a committing registry update, so the caller's next
/// read reflects any mutation it just made.
async fn force_update(state: &ApiState) -> poem::Result<i64> {
    let tip = state.client.latest_block_height().await.map_err(internal)?;
    state.registry.update(tip, true).await.map_err(internal)?;
    Ok(tip)
}

#[handler]
async fn prometheus_metrics(handle: Data<&Arc<ApiState>>) -> Response {
    Response::builder()
        .header("content-type", "text/plain")
        .body(handle.metrics_handle.render())
}

#[handler]
async fn index_page(state: Data<&Arc<ApiState>>) -> poem::web::Html<String> {
    poem::web::Html(index::render(state.0))
}

#[derive(Debug, Deserialize)]
struct AddUpgradeRequest {
    upgrade: Upgrade,
    #[serde(default)]
    overwrite: bool,
}

#[handler]
async fn add_upgrade(
    state: Data<&Arc<ApiState>>,
    Json(mut request): Json<AddUpgradeRequest>,
) -> poem::Result<Json<serde_json::Value>> {
    request.upgrade.tag = request.upgrade.tag.trim().to_owned();
    request.upgrade.network = state.network.clone();

    state
        .registry
        .add_upgrade(request.upgrade, request.overwrite)
        .await
        .map_err(internal)?;

    // refresh immediately so the next list reflects the change instead of
    // waiting for the proposals watcher tick
    force_update(&state).await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
struct CancelUpgradeRequest {
    height: i64,
    source: ProviderKind,
    #[serde(default)]
    force: bool,
}

#[handler]
async fn cancel_upgrade(
    state: Data<&Arc<ApiState>>,
    Json(request): Json<CancelUpgradeRequest>,
) -> poem::Result<Json<serde_json::Value>> {
    if request.height == 0 {
        return Err(poem::Error::from_string("height is required", StatusCode::BAD_REQUEST));
    }

    state
        .registry
        .cancel_upgrade(request.height, request.source, &state.network, request.force)
        .await
        .map_err(internal)?;

    force_update(&state).await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Default, Deserialize)]
struct ListUpgradesParams {
    #[serde(default)]
    disable_cache: bool,
    height: Option<i64>,
    #[serde(rename = "type")]
    upgrade_type: Option<UpgradeType>,
    source: Option<ProviderKind>,
    /// Comma-separated list of status names.
    status: Option<String>,
    limit: Option<usize>,
}

#[handler]
async fn list_upgrades(
    state: Data<&Arc<ApiState>>,
    Query(params): Query<ListUpgradesParams>,
) -> poem::Result<Json<serde_json::Value>> {
    let statuses: Vec<UpgradeStatus> = match &params.status {
        None => Vec::new(),
        Some(raw) => raw
            .split(',')
            .filter(|name| !name.is_empty())
            .map(|name| name.parse().map_err(internal))
            .collect::<Result<_, _>>()?,
    };

    let all = state.registry.all_upgrades(!params.disable_cache).await.map_err(internal)?;
    let state_machine = state.registry.state_machine();

    let mut upgrades: Vec<Upgrade> = all
        .into_values()
        .filter(|upgrade| params.height.is_none_or(|height| upgrade.height == height))
        .filter(|upgrade| params.upgrade_type.is_none_or(|t| upgrade.upgrade_type == t))
        .filter(|upgrade| params.source.is_none_or(|source| upgrade.source == source))
        .map(|mut upgrade| {
            // the state machine, not the provider, owns the lifecycle
            upgrade.status = state_machine.status(upgrade.height);
            upgrade.step = state_machine.step(upgrade.height);
            upgrade
        })
        .filter(|upgrade| statuses.is_empty() || statuses.contains(&upgrade.status))
        .collect();

    upgrades.sort_by(|a, b| b.height.cmp(&a.height));
    if let Some(limit) = params.limit {
        upgrades.truncate(limit);
    }

    Ok(Json(serde_json::json!({ "upgrades": upgrades })))
}

#[handler]
async fn force_sync(state: Data<&Arc<ApiState>>) -> poem::Result<Json<serde_json::Value>> {
    let height = force_update(&state).await?;
    Ok(Json(serde_json::json!({ "height": height })))
}

#[derive(Debug, Deserialize)]
struct AddVersionRequest {
    version: Version,
    #[serde(default)]
    overwrite: bool,
}

#[handler]
async fn add_version(
    state: Data<&Arc<ApiState>>,
    Json(mut request): Json<AddVersionRequest>,
) -> poem::Result<Json<serde_json::Value>> {
    request.version.tag = request.version.tag.trim().to_owned();
    request.version.network = state.network.clone();

    state
        .registry
        .register_version(request.version, request.overwrite)
        .await
        .map_err(internal)?;

    force_update(&state).await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Default, Deserialize)]
struct ListVersionsParams {
    #[serde(default)]
    disable_cache: bool,
    height: Option<i64>,
    source: Option<ProviderKind>,
}

#[handler]
async fn list_versions(
    state: Data<&Arc<ApiState>>,
    Query(params): Query<ListVersionsParams>,
) -> poem::Result<Json<serde_json::Value>> {
    let all = state.registry.all_versions(!params.disable_cache).await.map_err(internal)?;

    let mut versions: Vec<Version> = all
        .into_values()
        .filter(|version| params.height.is_none_or(|height| version.height == height))
        .filter(|version| params.source.is_none_or(|source| version.source == source))
        .collect();
    versions.sort_by_key(|version| version.height);

    Ok(Json(serde_json::json!({ "versions": versions })))
}

#[derive(Debug, Deserialize)]
struct GetVersionParams {
    height: i64,
    #[serde(default)]
    disable_cache: bool,
}

#[handler]
async fn get_version(
    state: Data<&Arc<ApiState>>,
    Query(params): Query<GetVersionParams>,
) -> poem::Result<Json<serde_json::Value>> {
    let version = state
        .registry
        .version(!params.disable_cache, params.height)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "version": version })))
}

#[handler]
async fn latest_height(state: Data<&Arc<ApiState>>) -> poem::Result<Json<serde_json::Value>> {
    let height = state.client.latest_block_height().await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "height": height, "network": state.network })))
}
