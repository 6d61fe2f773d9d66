// Refresh 驱动：refresh token 换 access token
//
// 两条通道：social 走桌面端 refreshToken 接口，enterprise 走区域
// OIDC 的 refresh_token grant。

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::types::{AuthConfig, AuthKind, TokenInfo};
use crate::config::endpoints;
use crate::error::ApiError;
use crate::utils::http_client::{AUX_REQUEST_TIMEOUT, UPSTREAM_CLIENT};
use crate::utils::utf8::truncate_utf8;

const ERROR_BODY_PREVIEW_BYTES: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocialRefreshResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    profile_arn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OidcRefreshResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    access_token: String,
    #[serde(alias = "expiresIn", alias = "expires_in")]
    expires_in: i64,
}

/// 按凭据类型刷新 access token。
pub async fn refresh_token(config: &AuthConfig) -> Result<TokenInfo, ApiError> {
    match config.auth_kind {
        AuthKind::Social => refresh_social(config).await,
        AuthKind::Enterprise => refresh_enterprise(config).await,
    }
}

async fn refresh_social(config: &AuthConfig) -> Result<TokenInfo, ApiError> {
    let url = endpoints::get_refresh_url(&config.region);

    let resp = UPSTREAM_CLIENT
        .post(&url)
        .timeout(AUX_REQUEST_TIMEOUT)
        .json(&serde_json::json!({ "refreshToken": config.refresh_token }))
        .send()
        .await
        .map_err(|e| ApiError::RefreshFailed(format!("social refresh transport error: {}", e)))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "social token refresh 被拒绝");
        return Err(ApiError::RefreshFailed(format!(
            "social refresh {}: {}",
            status.as_u16(),
            truncate_utf8(&body, ERROR_BODY_PREVIEW_BYTES)
        )));
    }

    let parsed: SocialRefreshResponse = resp
        .json()
        .await
        .map_err(|e| ApiError::RefreshFailed(format!("social refresh bad body: {}", e)))?;

    debug!(expires_in = parsed.expires_in, "social token refreshed");
    Ok(TokenInfo {
        access_token: parsed.access_token,
        expires_at: Utc::now() + ChronoDuration::seconds(parsed.expires_in),
        profile_arn: parsed.profile_arn,
    })
}

async fn refresh_enterprise(config: &AuthConfig) -> Result<TokenInfo, ApiError> {
    let url = endpoints::get_oidc_token_url(&config.region);

    let client_id = config
        .client_id
        .as_deref()
        .ok_or_else(|| ApiError::RefreshFailed("enterprise refresh 缺少 client_id".into()))?;
    let client_secret = config
        .client_secret
        .as_deref()
        .ok_or_else(|| ApiError::RefreshFailed("enterprise refresh 缺少 client_secret".into()))?;

    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", config.refresh_token.as_str()),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];

    let resp = UPSTREAM_CLIENT
        .post(&url)
        .timeout(AUX_REQUEST_TIMEOUT)
        .form(&form)
        .send()
        .await
        .map_err(|e| ApiError::RefreshFailed(format!("oidc refresh transport error: {}", e)))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "enterprise token refresh 被拒绝");
        return Err(ApiError::RefreshFailed(format!(
            "oidc refresh {}: {}",
            status.as_u16(),
            truncate_utf8(&body, ERROR_BODY_PREVIEW_BYTES)
        )));
    }

    let parsed: OidcRefreshResponse = resp
        .json()
        .await
        .map_err(|e| ApiError::RefreshFailed(format!("oidc refresh bad body: {}", e)))?;

    debug!(expires_in = parsed.expires_in, "enterprise token refreshed");
    Ok(TokenInfo {
        access_token: parsed.access_token,
        expires_at: Utc::now() + ChronoDuration::seconds(parsed.expires_in),
        profile_arn: None,
    })
}
