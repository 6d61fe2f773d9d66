// HTTP 服务
//
// 路由 + 简单 Bearer 鉴权。健康检查不鉴权；其余接口在配置了
// API key 时校验 `x-api-key` 或 `Authorization: Bearer`。

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{info, warn};

use crate::core::Core;
use crate::proxy::handlers;

pub fn build_router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        .route("/v1/models", get(list_models))
        .route("/api/tokens", get(handlers::admin::token_pool_status))
        .route("/api/tokens/reload", post(handlers::admin::reload_tokens))
        .route(
            "/api/sessions/:session_id/pool",
            get(handlers::admin::session_pool_status).delete(handlers::admin::unbind_session_pool),
        )
        .route("/api/machine-ids", get(handlers::admin::list_machine_ids))
        .route(
            "/api/machine-ids/:binding_key",
            axum::routing::put(handlers::admin::set_machine_id)
                .delete(handlers::admin::delete_machine_id),
        )
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(core.clone(), require_api_key))
        .with_state(core)
}

async fn health() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

/// 按池内账号等级聚合的可用模型列表。
async fn list_models(State(core): State<Arc<Core>>) -> Response {
    let models = core.token_manager.list_available_models().await;
    let data: Vec<serde_json::Value> = models
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "anthropic",
            })
        })
        .collect();
    (StatusCode::OK, Json(json!({"object": "list", "data": data}))).into_response()
}

async fn require_api_key(
    State(core): State<Arc<Core>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = core.api_key.as_deref() else {
        return next.run(request).await;
    };

    // 健康检查豁免
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let headers = request.headers();
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    match provided {
        Some(key) if key == expected => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "请求未通过 API key 校验");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": {"type": "authentication_error", "message": "无效的 API key"}
                })),
            )
                .into_response()
        }
    }
}

/// 启动监听直到 ctrl-c。
pub async fn serve(core: Arc<Core>, port: u16) -> std::io::Result<()> {
    let router = build_router(core.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "代理服务已启动");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("收到退出信号，开始优雅关闭");
            core.shutdown();
        })
        .await
}
