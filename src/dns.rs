//! Best-effort reverse DNS on accept
//!
//! `spec.md` §4.5: the controller resolves the client's hostname before
//! sending the greeting, but a slow or failing resolver must never hang
//! or fail the connection -- any error (timeout, `NXDOMAIN`, resolver
//! failure) falls back to the bracketed IP literal, mirroring the
//! teacher's own "never let a network collaborator's hiccup become a
//! hard error" posture in `connection.rs::connect`.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;

/// Resolve `addr`'s IP to a hostname within `timeout`, falling back to
/// `[ip]` on any failure.
pub async fn resolve_client_hostname(addr: SocketAddr, timeout: Duration) -> String {
    let fallback = format!("[{}]", addr.ip());

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(err) => {
            tracing::debug!(error = %err, "could not build resolver, using IP literal");
            return fallback;
        }
    };

    match tokio::time::timeout(timeout, resolver.reverse_lookup(addr.ip())).await {
        Ok(Ok(lookup)) => lookup
            .iter()
            .next()
            .map_or(fallback, |name| name.to_string().trim_end_matches('.').to_string()),
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "reverse DNS lookup failed, using IP literal");
            fallback
        }
        Err(_) => {
            tracing::debug!("reverse DNS lookup timed out, using IP literal");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unresolvable_address_falls_back_to_bracketed_literal() {
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let hostname = resolve_client_hostname(addr, Duration::from_millis(50)).await;
        assert!(hostname.starts_with('[') && hostname.ends_with(']'));
    }
}
