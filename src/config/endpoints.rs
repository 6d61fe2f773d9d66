/// Regional upstream endpoint builders.

/// Social-auth token refresh endpoint.
///
/// `get_refresh_url("us-east-1")` →
/// `"https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"`
pub fn get_refresh_url(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", region)
}

/// AWS SSO OIDC token endpoint (enterprise / IdC refresh).
pub fn get_oidc_token_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/token", region)
}

/// Q API host, e.g. `"https://q.us-east-1.amazonaws.com"`.
pub fn get_q_host(region: &str) -> String {
    format!("https://q.{}.amazonaws.com", region)
}

/// Bare host name for the `Host` header.
pub fn get_q_host_header(region: &str) -> String {
    format!("q.{}.amazonaws.com", region)
}

/// Main assistant endpoint.
pub fn get_generate_url(region: &str) -> String {
    format!("{}/generateAssistantResponse", get_q_host(region))
}

/// Usage-limits probe endpoint.
pub fn get_usage_limits_url(region: &str) -> String {
    format!("{}/getUsageLimits", get_q_host(region))
}
