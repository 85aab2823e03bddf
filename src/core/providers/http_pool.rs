//! Shared, pooled `reqwest::Client` used by every HTTP-backed [`Provider`](crate::core::provider::Provider).
//!
//! A single client instance keeps TLS sessions and DNS lookups warm, which matters once
//! many concurrent agent invocations are each issuing provider calls. `reqwest::Client`
//! is internally `Arc`-backed, so cloning it is cheap; backends should call
//! [`get_shared_http_client`] rather than building their own.

use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build shared HTTP client");
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_client_is_reusable() {
        let a = get_shared_http_client();
        let b = get_shared_http_client();
        assert!(std::ptr::eq(a, b));
    }
}
