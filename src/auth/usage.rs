// 配额探测：getUsageLimits

use tracing::debug;

use super::types::TokenInfo;
use crate::config::endpoints;
use crate::error::ApiError;
use crate::models::usage::UsageLimits;
use crate::utils::http_client::{AUX_REQUEST_TIMEOUT, UPSTREAM_CLIENT};

/// 查询指定凭据的用量限制。
pub async fn check_usage_limits(token: &TokenInfo, region: &str) -> Result<UsageLimits, ApiError> {
    let url = endpoints::get_usage_limits_url(region);

    let mut builder = UPSTREAM_CLIENT
        .post(&url)
        .timeout(AUX_REQUEST_TIMEOUT)
        .bearer_auth(&token.access_token)
        .header(reqwest::header::CONTENT_TYPE, "application/json");

    let mut body = serde_json::json!({});
    if let Some(arn) = &token.profile_arn {
        body["profileArn"] = serde_json::Value::String(arn.clone());
    }
    builder = builder.json(&body);

    let resp = builder
        .send()
        .await
        .map_err(|e| ApiError::Api(format!("usage probe transport error: {}", e)))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(ApiError::Api(format!(
            "usage probe failed with status {}",
            status.as_u16()
        )));
    }

    let usage: UsageLimits = resp
        .json()
        .await
        .map_err(|e| ApiError::Api(format!("usage probe bad body: {}", e)))?;

    debug!(
        available = usage.available_count(),
        email = %usage.user_info.email,
        "usage limits fetched"
    );
    Ok(usage)
}
