// 运维接口
//
// 凭据池与会话池的状态查询，以及机器码绑定的增删改查。
// 全部走与业务接口相同的 API key 鉴权。

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::machine_id::normalize_machine_id;
use crate::core::Core;

/// GET /api/tokens — 凭据池快照。
pub async fn token_pool_status(State(core): State<Arc<Core>>) -> Response {
    let tokens = core.token_manager.pool_snapshot().await;
    let active = tokens
        .iter()
        .filter(|t| t["status"] == "active")
        .count();
    (
        StatusCode::OK,
        Json(json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "total_tokens": tokens.len(),
            "active_tokens": active,
            "tokens": tokens,
        })),
    )
        .into_response()
}

/// GET /api/sessions/:session_id/pool — 会话池统计。
pub async fn session_pool_status(
    State(core): State<Arc<Core>>,
    Path(session_id): Path<String>,
) -> Response {
    match core.session_pool.pool_stats(&session_id).await {
        Some(stats) => (StatusCode::OK, Json(stats)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"type": "not_found_error", "message": "会话池不存在"}})),
        )
            .into_response(),
    }
}

/// DELETE /api/sessions/:session_id/pool — 解绑会话池。
pub async fn unbind_session_pool(
    State(core): State<Arc<Core>>,
    Path(session_id): Path<String>,
) -> Response {
    core.session_pool.unbind_session(&session_id);
    core.session_bindings.unbind(&session_id);
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

/// GET /api/machine-ids — 全部机器码绑定。
pub async fn list_machine_ids(State(core): State<Arc<Core>>) -> Response {
    let bindings: Vec<serde_json::Value> = core
        .machine_ids
        .list_bindings()
        .into_iter()
        .map(|(key, binding)| {
            json!({
                "binding_key": key,
                "machine_id": binding.machine_id,
                "created_at": binding.created_at.to_rfc3339(),
                "updated_at": binding.updated_at.to_rfc3339(),
            })
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({"count": bindings.len(), "bindings": bindings})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SetMachineIdRequest {
    pub machine_id: String,
}

/// PUT /api/machine-ids/:binding_key — 设置绑定（UUID 或 64 位 HEX）。
pub async fn set_machine_id(
    State(core): State<Arc<Core>>,
    Path(binding_key): Path<String>,
    Json(body): Json<SetMachineIdRequest>,
) -> Response {
    if normalize_machine_id(&body.machine_id).is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {
                    "type": "invalid_request_error",
                    "message": "机器码必须是 UUID 或 64 位十六进制",
                }
            })),
        )
            .into_response();
    }

    match core.machine_ids.set_binding(&binding_key, &body.machine_id) {
        Ok(()) => {
            info!(binding_key = %binding_key, "机器码绑定已更新");
            (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"type": "api_error", "message": e}})),
        )
            .into_response(),
    }
}

/// DELETE /api/machine-ids/:binding_key — 删除绑定。
pub async fn delete_machine_id(
    State(core): State<Arc<Core>>,
    Path(binding_key): Path<String>,
) -> Response {
    match core.machine_ids.delete_binding(&binding_key) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"type": "api_error", "message": e}})),
        )
            .into_response(),
    }
}

/// POST /api/tokens/reload — 重载凭据表。
pub async fn reload_tokens(State(core): State<Arc<Core>>) -> Response {
    core.reload_tokens().await;
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}
