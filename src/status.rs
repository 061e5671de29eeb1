// Copyright 2026 The Shardgate Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{ErrorKind, Result, ServerError};
use crate::server::ShardServer;
use crate::types::ReqCtx;

/// Debug endpoints are reachable from the local host only; everything else
/// is rejected before any handler state is touched.
fn check_access(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

#[derive(Clone)]
struct StatusState {
    server: ShardServer,
}

pub fn status_router(server: ShardServer) -> Router {
    Router::new()
        .route("/debug/health", get(health))
        .route("/queryz", get(queryz))
        .route("/schemaz", get(schemaz))
        .route("/twopcz", get(twopcz))
        .route("/txlogz", get(txlogz))
        .route("/streamqueryz", get(streamqueryz))
        .route("/streamqueryz/terminate", get(streamqueryz_terminate))
        .with_state(StatusState { server })
}

/// Serves the debug surface until the process exits.
pub async fn serve_status(addr: SocketAddr, server: ShardServer) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::new(ErrorKind::Internal, format!("cannot bind status listener: {e}")))?;
    info!("status page listening on {addr}");
    axum::serve(listener, status_router(server).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ServerError::new(ErrorKind::Internal, format!("status server failed: {e}")))
}

async fn health(
    State(state): State<StatusState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if !check_access(&addr) {
        return (StatusCode::FORBIDDEN, "forbidden".to_string());
    }
    match state.server.is_healthy().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(_) => (StatusCode::OK, "not ok".to_string()),
    }
}

async fn queryz(State(state): State<StatusState>, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> impl IntoResponse {
    if !check_access(&addr) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }
    let cache = state.server.query_engine().cache();
    let plans: Vec<_> = cache
        .entries()
        .into_iter()
        .map(|(sql, plan)| {
            json!({
                "query": sql,
                "plan": plan.kind.as_str(),
                "table": plan.table_name,
                "hits": plan.hits.load(Ordering::Relaxed),
            })
        })
        .collect();
    let body = json!({
        "state": state.server.get_state(),
        "capacity": cache.capacity(),
        "size": cache.len(),
        "hits": cache.hits(),
        "misses": cache.misses(),
        "plans": plans,
    });
    (StatusCode::OK, Json(body))
}

async fn schemaz(State(state): State<StatusState>, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> impl IntoResponse {
    if !check_access(&addr) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }
    let tables = state.server.query_engine().schema().tables();
    let tables: Vec<_> = tables.iter().map(|t| t.as_ref()).collect();
    (StatusCode::OK, Json(json!({
        "version": state.server.query_engine().schema().version(),
        "tables": tables,
    })))
}

async fn twopcz(State(state): State<StatusState>, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> impl IntoResponse {
    if !check_access(&addr) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }
    match state.server.tx_engine().twopc.abandoned(&ReqCtx::local(), Duration::ZERO).await {
        Ok(unresolved) => (StatusCode::OK, Json(json!({"unresolved": unresolved}))),
        Err(err) => (StatusCode::OK, Json(json!({"unresolved": [], "error": err.to_string()}))),
    }
}

async fn txlogz(State(state): State<StatusState>, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> impl IntoResponse {
    if !check_access(&addr) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }
    (StatusCode::OK, Json(json!({"transactions": state.server.tx_engine().txpool.records()})))
}

async fn streamqueryz(
    State(state): State<StatusState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if !check_access(&addr) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }
    (StatusCode::OK, Json(json!({"streams": state.server.query_engine().streams().list()})))
}

#[derive(Deserialize)]
struct TerminateParams {
    id: u64,
}

async fn streamqueryz_terminate(
    State(state): State<StatusState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<TerminateParams>,
) -> impl IntoResponse {
    if !check_access(&addr) {
        return (StatusCode::FORBIDDEN, "forbidden".to_string());
    }
    if state.server.query_engine().streams().terminate(params.id) {
        (StatusCode::OK, "terminated".to_string())
    } else {
        (StatusCode::NOT_FOUND, "unknown stream".to_string())
    }
}
