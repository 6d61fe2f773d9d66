// 上游请求重试编排
//
// 瞬态失败（429/502/503/504）在这里消化：冷却当前凭据、从会话池
// 换下一个、指数退避后重发。持久失败（403、402 月度配额）标记凭据
// 失败后把映射好的错误交还给边界层。客户端永远只看到一次完整的
// 响应或一个成形的错误。

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::auth::{calculate_cooldown_duration, Fingerprint, TokenInfo};
use crate::core::Core;
use crate::error::ApiError;
use crate::models::claude::AnthropicRequest;
use crate::proxy::error_mapper::{map_upstream_error, MappedError, UpstreamErrorKind};
use crate::proxy::upstream::codewhisperer::build_codewhisperer_request;
use crate::config::endpoints;
use crate::utils::http_client::{RESPONSE_HEADER_TIMEOUT, UPSTREAM_CLIENT};

/// 重试循环的最终产物：成功拿到的上游响应。
pub struct UpstreamAttempt {
    pub response: reqwest::Response,
    pub token_key: String,
}

/// 编排层错误：基础设施错误或已映射的上游错误。
pub enum OrchestratorError {
    Api(ApiError),
    Upstream(MappedError),
}

impl From<ApiError> for OrchestratorError {
    fn from(e: ApiError) -> Self {
        OrchestratorError::Api(e)
    }
}

/// 重试状态码集合。
fn is_transient(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// 指数退避 + 抖动。
fn backoff_duration(core: &Core, retry: u32) -> Duration {
    let tuning = &core.tuning;
    let base = tuning.session_pool_retry_interval.as_millis() as f64
        * tuning.rate_limit_backoff_multiplier.powi(retry as i32);
    let capped = base.min(tuning.rate_limit_backoff_max.as_millis() as f64);
    let jitter = if tuning.rate_limit_jitter_percent > 0 {
        capped * (tuning.rate_limit_jitter_percent as f64 / 100.0) * rand::thread_rng().gen::<f64>()
    } else {
        0.0
    };
    Duration::from_millis((capped + jitter) as u64)
}

async fn send_upstream(
    core: &Core,
    req: &AnthropicRequest,
    session_id: &str,
    token: &TokenInfo,
    fingerprint: &Fingerprint,
    is_stream: bool,
) -> Result<reqwest::Response, OrchestratorError> {
    let region = &core.tuning.region;
    let envelope = build_codewhisperer_request(
        req,
        session_id,
        token.profile_arn.as_deref(),
        core.tuning.max_tool_description_length,
    )?;

    let url = endpoints::get_generate_url(region);
    let accept = if is_stream { "text/event-stream" } else { "*/*" };

    let mut builder = UPSTREAM_CLIENT
        .post(&url)
        .bearer_auth(&token.access_token)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(reqwest::header::ACCEPT, accept)
        .header("x-amzn-kiro-agent-mode", "vibe")
        .header("x-amzn-codewhisperer-optout", "true")
        .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
        .header("amz-sdk-request", "attempt=1; max=3")
        .header(reqwest::header::HOST, endpoints::get_q_host_header(region))
        .json(&envelope);
    builder = fingerprint.apply_to_request(builder);

    debug!(
        url = %url,
        model = %req.model,
        is_stream,
        "发送 CodeWhisperer 请求"
    );

    // send() 在收到响应头时返回；流式响应体不受此超时约束
    match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, builder.send()).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(error = %e, "上游请求传输失败");
            Err(OrchestratorError::Api(ApiError::Api(format!(
                "发送请求失败: {}",
                e
            ))))
        }
        Err(_) => {
            error!("等待上游响应头超时");
            Err(OrchestratorError::Api(ApiError::Api(
                "上游响应头超时".to_string(),
            )))
        }
    }
}

/// 持久失败的凭据处置：标记失败、会话池内置为耗尽；
/// 上游临时封禁（TEMPORARILY_SUSPENDED）额外覆盖为长冷却。
async fn apply_failure_disposition(
    core: &Core,
    session_id: &str,
    token_key: &str,
    mapped: &MappedError,
) {
    if !mapped.mark_token_failed {
        return;
    }
    core.token_manager.mark_token_failed(token_key).await;
    if core.tuning.session_pool_enabled {
        core.session_pool
            .mark_token_exhausted(session_id, token_key)
            .await;
    }
    if mapped.kind == UpstreamErrorKind::Suspended {
        warn!(
            token_key,
            cooldown_secs = core.tuning.suspended_token_cooldown.as_secs(),
            "账号被上游临时封禁，凭据进入长冷却"
        );
        core.token_manager
            .rate_limiter()
            .mark_cooldown_for(token_key, core.tuning.suspended_token_cooldown);
    }
}

/// 直连路径：会话池关闭时的单次请求，错误直接映射，无 failover。
async fn execute_direct(
    core: &Arc<Core>,
    session_id: &str,
    req: &AnthropicRequest,
    is_stream: bool,
) -> Result<UpstreamAttempt, OrchestratorError> {
    let (token, fingerprint, token_key) = core
        .token_manager
        .acquire_for_session_and_model(session_id, &req.model)
        .await?;

    let response = send_upstream(core, req, session_id, &token, &fingerprint, is_stream).await?;
    let status = response.status().as_u16();

    if (200..300).contains(&status) {
        core.token_manager.mark_token_success(&token_key);
        debug!(status, "上游响应成功（直连路径）");
        return Ok(UpstreamAttempt {
            response,
            token_key,
        });
    }

    let body = response.bytes().await.unwrap_or_default();
    error!(
        status,
        body = %String::from_utf8_lossy(&body),
        "上游响应错误（直连路径）"
    );
    let mapped = map_upstream_error(status, &body);
    apply_failure_disposition(core, session_id, &token_key, &mapped).await;
    Err(OrchestratorError::Upstream(mapped))
}

/// 带会话池 failover 的重试执行。
///
/// 会话池关闭时退回直连路径：一次请求、一次映射，429 也不重试。
pub async fn execute_with_retry(
    core: &Arc<Core>,
    session_id: &str,
    req: &AnthropicRequest,
    is_stream: bool,
) -> Result<UpstreamAttempt, OrchestratorError> {
    if !core.tuning.session_pool_enabled {
        return execute_direct(core, session_id, req, is_stream).await;
    }

    let max_retries = core.tuning.session_pool_max_retries;

    // 初始 token 来自会话池（主账号优先）
    let (mut token, mut fingerprint, mut token_key) = core
        .session_pool
        .get_available_token_for_model(session_id, &req.model)
        .await?;

    let mut retry: u32 = 0;
    loop {
        let response = send_upstream(core, req, session_id, &token, &fingerprint, is_stream).await?;
        let status = response.status().as_u16();

        if !is_transient(status) {
            if (200..300).contains(&status) {
                core.session_pool.mark_token_success(session_id, &token_key).await;
                core.token_manager.mark_token_success(&token_key);
                debug!(status, retries = retry, "上游响应成功");
                return Ok(UpstreamAttempt {
                    response,
                    token_key,
                });
            }

            // 持久失败：读响应体做映射
            let body = response.bytes().await.unwrap_or_default();
            error!(
                status,
                body_len = body.len(),
                body = %String::from_utf8_lossy(&body),
                "上游响应错误"
            );
            let mapped = map_upstream_error(status, &body);
            apply_failure_disposition(core, session_id, &token_key, &mapped).await;
            return Err(OrchestratorError::Upstream(mapped));
        }

        // 瞬态失败：解析冷却时间、冷却当前凭据
        warn!(
            session_id,
            token_key = %token_key,
            status,
            retry,
            max_retries,
            "上游瞬态失败，准备切换 token 重试"
        );
        let body = response.bytes().await.unwrap_or_default();
        let cooldown =
            calculate_cooldown_duration(&body, core.tuning.session_pool_cooldown);
        core.session_pool
            .mark_token_cooldown(session_id, &token_key, cooldown)
            .await;

        if retry >= max_retries {
            error!(session_id, retries = retry, "达到最大重试次数");
            return Err(OrchestratorError::Upstream(map_upstream_error(status, &body)));
        }

        // 换下一个可用 token；换不到就继续用当前的扛退避
        match core
            .session_pool
            .get_next_available_token_for_model(session_id, &token_key, &req.model)
            .await
        {
            Ok((next_token, next_fingerprint, next_key)) => {
                info!(session_id, new_token_key = %next_key, retry = retry + 1, "切换到新 token 重试");
                token = next_token;
                fingerprint = next_fingerprint;
                token_key = next_key;
            }
            Err(e) => {
                warn!(session_id, error = %e, "无法获取下一个 token，使用当前 token 重试");
            }
        }

        tokio::time::sleep(backoff_duration(core, retry)).await;
        retry += 1;
    }
}
