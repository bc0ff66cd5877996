//! Shared HTTP client for provider transports.
//!
//! Maintains a single lazily initialised `reqwest::Client` with persistent
//! connection pooling, avoiding DNS/TLS churn when many concurrent skill
//! invocations are issued to upstream providers.

use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm which
    /// significantly reduces latency when a session fans out one offer request
    /// per selected agent.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
///
/// The returned reference can be cloned and reused by individual client wrappers.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_client_is_reused() {
        let a = get_shared_http_client() as *const reqwest::Client;
        let b = get_shared_http_client() as *const reqwest::Client;
        assert_eq!(a, b);
    }
}
