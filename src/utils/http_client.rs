use std::time::Duration;

use once_cell::sync::Lazy;

/// Shared upstream HTTP client.
///
/// One pooled client for the whole process: streaming responses must not be
/// killed by a global request timeout, so only the connect/TLS phase is
/// bounded here. Callers that want a whole-request deadline (refresh, usage
/// probe) set `.timeout()` per request.
pub static UPSTREAM_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(15))
        .tcp_keepalive(Duration::from_secs(30))
        .build()
        .expect("failed to build upstream HTTP client")
});

/// Timeout for auxiliary calls (token refresh, usage limits).
pub const AUX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for upstream response headers on the main call.
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(60);
