use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::nautica::{
    accounts::{Account, AccountStore},
    links,
    proxylist::{ProxyRecord, SharedProxyList},
    telemetry::SharedPrometheusHandle,
};

const SERVICE_NAME: &str = "Nautica Proxy Server V2";

#[derive(Clone)]
pub struct ApiState {
    pub domain: String,
    pub port: u16,
    pub accounts: Arc<AccountStore>,
    pub proxies: SharedProxyList,
    pub prom: SharedPrometheusHandle,
}

pub fn router(state: ApiState, public_dir: PathBuf) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sub", get(subscription))
        .route("/metrics", get(metrics))
        .route("/api/v1/accounts", get(list_accounts).post(create_account))
        .route("/api/v1/accounts/{id}", delete(delete_account))
        .route("/api/v1/proxies", get(list_proxies))
        .fallback_service(ServeDir::new(public_dir))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
    domain: String,
    port: u16,
    accounts: usize,
    proxies: usize,
}

async fn health(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        service: SERVICE_NAME,
        status: "running",
        domain: st.domain.clone(),
        port: st.port,
        accounts: st.accounts.len().await,
        proxies: st.proxies.len(),
    })
}

async fn subscription(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        st.accounts.subscription().await,
    )
}

async fn metrics(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

#[derive(Debug, Serialize)]
struct AccountStats {
    total: usize,
    vless: usize,
    trojan: usize,
    shadowsocks: usize,
}

#[derive(Debug, Serialize)]
struct AccountsResponse {
    success: bool,
    data: Vec<Account>,
    stats: AccountStats,
}

async fn list_accounts(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    let data = st.accounts.list().await;
    // Every multi account carries all three link kinds.
    let multi = data.iter().filter(|a| a.kind == "multi").count();
    Json(AccountsResponse {
        success: true,
        stats: AccountStats {
            total: data.len(),
            vless: multi,
            trojan: multi,
            shadowsocks: multi,
        },
        data,
    })
}

#[derive(Debug, Serialize)]
struct ProxiesResponse {
    success: bool,
    data: Vec<ProxyRecord>,
    total: usize,
}

async fn list_proxies(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    let data = st.proxies.snapshot().as_ref().clone();
    Json(ProxiesResponse {
        success: true,
        total: data.len(),
        data,
    })
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Account>,
}

fn message(status: StatusCode, success: bool, msg: &str) -> Response {
    (
        status,
        Json(MessageResponse {
            success,
            message: msg.to_string(),
            data: None,
        }),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAccountRequest {
    #[serde(default)]
    name: Option<serde_json::Value>,
    #[serde(default)]
    proxy_id: Option<serde_json::Value>,
}

/// Resolves a proxy id the way the account form compares it: loosely, as a
/// number. `true` is 1, numeric strings may carry whitespace, a fraction of
/// zero, an exponent or a 0x/0o/0b prefix.
fn proxy_id(v: &serde_json::Value) -> Option<u64> {
    let n = match v {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::Bool(b) => u8::from(*b) as f64,
        serde_json::Value::String(s) => loose_number(s)?,
        _ => return None,
    };
    (n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= u64::MAX as f64).then_some(n as u64)
}

fn loose_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Some(0.0);
    }
    let radix = match s.get(..2).map(str::to_ascii_lowercase).as_deref() {
        Some("0x") => 16,
        Some("0o") => 8,
        Some("0b") => 2,
        _ => 10,
    };
    if radix != 10 {
        return u64::from_str_radix(&s[2..], radix).ok().map(|n| n as f64);
    }
    // Rust also accepts "inf" and "nan" spellings, which never name a proxy.
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Falsy in the sense the account form has always used: missing, null, false, 0 or "".
fn is_blank(v: Option<&serde_json::Value>) -> bool {
    match v {
        None | Some(serde_json::Value::Null) | Some(serde_json::Value::Bool(false)) => true,
        Some(serde_json::Value::String(s)) => s.is_empty(),
        Some(serde_json::Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(_) => false,
    }
}

async fn create_account(
    State(st): State<Arc<ApiState>>,
    body: Result<Json<CreateAccountRequest>, JsonRejection>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();

    if is_blank(req.name.as_ref()) || is_blank(req.proxy_id.as_ref()) {
        return message(
            StatusCode::BAD_REQUEST,
            false,
            "Name and proxy selection are required",
        );
    }
    let name = match req.name {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };

    let Some(proxy) = req
        .proxy_id
        .as_ref()
        .and_then(proxy_id)
        .and_then(|id| st.proxies.find(id))
    else {
        return message(StatusCode::BAD_REQUEST, false, "Proxy not found");
    };

    let account = links::generate_account(&proxy, &name, &st.domain);
    if let Err(err) = st.accounts.insert(account.clone()).await {
        tracing::error!(err = %format!("{err:#}"), "api: persist account failed");
        return message(StatusCode::INTERNAL_SERVER_ERROR, false, "Failed to save account");
    }
    tracing::info!(account = %account.id, proxy = %account.proxy_name, "api: account created");

    (
        StatusCode::OK,
        Json(MessageResponse {
            success: true,
            message: "Account created successfully".to_string(),
            data: Some(account),
        }),
    )
        .into_response()
}

async fn delete_account(State(st): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match st.accounts.remove(&id).await {
        Ok(true) => message(StatusCode::OK, true, "Account deleted successfully"),
        Ok(false) => message(StatusCode::NOT_FOUND, false, "Account not found"),
        Err(err) => {
            tracing::error!(err = %format!("{err:#}"), "api: persist account removal failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, false, "Failed to save account")
        }
    }
}
