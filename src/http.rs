//! HTTP introspection endpoints
//!
//! Read-only views over the registry plus a permissive authorization stub
//! for testing. Every handler takes at most one registry critical section;
//! none of them can stall a relay operation.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::config::Config;
use crate::server::client::RelayClient;
use crate::server::registry::{ClientInfos, ClientRegistry, StoreInfo};

/// Static application facts
#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    pub environment: String,
    pub version: &'static str,
}

impl AppInfo {
    /// Environment from `RTC_SERVER_ENVIRONMENT` (default `production`),
    /// version from the crate manifest.
    pub fn current() -> Self {
        Self {
            environment: std::env::var("RTC_SERVER_ENVIRONMENT")
                .unwrap_or_else(|_| "production".to_string()),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Everything at once
#[derive(Debug, Serialize)]
pub struct AllInfo {
    pub app: AppInfo,
    pub config: Config,
    pub store: StoreInfo,
    pub clients: ClientInfos,
}

/// Shared state behind the HTTP handlers
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ClientRegistry<RelayClient>>,
}

/// Build the introspection router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/allow-all", post(allow_all))
        .route("/info/app", get(app_info))
        .route("/info/config", get(config_info))
        .route("/info/store", get(store_info))
        .route("/info/clients", get(client_infos))
        .route("/info", get(all_info))
        .with_state(state)
}

/// Testing stub: accepts every authorization request.
async fn allow_all() -> StatusCode {
    StatusCode::OK
}

async fn app_info() -> Json<AppInfo> {
    Json(AppInfo::current())
}

async fn config_info(State(state): State<Arc<AppState>>) -> Json<Config> {
    Json(state.config.clone())
}

async fn store_info(State(state): State<Arc<AppState>>) -> Json<StoreInfo> {
    Json(state.registry.store_info().await)
}

async fn client_infos(State(state): State<Arc<AppState>>) -> Json<ClientInfos> {
    Json(state.registry.client_infos().await)
}

async fn all_info(State(state): State<Arc<AppState>>) -> Json<AllInfo> {
    Json(AllInfo {
        app: AppInfo::current(),
        config: state.config.clone(),
        store: state.registry.store_info().await,
        clients: state.registry.client_infos().await,
    })
}
