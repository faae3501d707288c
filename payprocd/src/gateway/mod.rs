//! Outbound gateway adapters: Stripe and PayPal, sharing
//! one `reqwest::Client` per daemon process.

pub mod paypal;
pub mod stripe;

use std::time::Duration;

use payproc_api_core::error::{ErrorKind, PayprocError};
use tracing::debug;

/// Gateway HTTP calls get their own timeout distinct from the accept loop --
///, "gateway calls rely on the HTTP client's own I/O timeouts"
/// rather than a per-command deadline.
const GATEWAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the one `reqwest::Client` shared by both adapters, grounded on
/// `lexe-api`'s `RestClient::client_builder` (user agent, HTTPS-only,
/// request timeout). TLS setup itself is an out-of-scope external
/// collaborator, so this uses reqwest's own default rustls/
/// webpki-roots backend rather than a hand-rolled `rustls::ClientConfig`.
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("payprocd/", env!("CARGO_PKG_VERSION")))
        .https_only(true)
        .timeout(GATEWAY_REQUEST_TIMEOUT)
        .build()
        .expect("failed to build gateway reqwest client")
}

/// Extracts a `serde_json::Value` from a response, logging the raw status
/// on parse failure. Both adapters parse 2xx and 4xx bodies as JSON and
/// surface anything else as a generic upstream error.
pub(crate) async fn parse_json_body(
    gateway: &'static str,
    response: reqwest::Response,
) -> Result<(u16, serde_json::Value), PayprocError> {
    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| PayprocError::new(ErrorKind::General, format!("reading {gateway} response body: {e}")))?;
    if !(200..300).contains(&status) && !(400..500).contains(&status) {
        return Err(PayprocError::new(
            ErrorKind::Upstream { gateway, status, code: None, r#type: None, message: None },
            format!("{gateway} returned unexpected status {status}"),
        ));
    }
    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
        debug!(gateway, status, "failed to parse gateway response as JSON: {e}");
        PayprocError::new(ErrorKind::InvalidObject, format!("{gateway} response was not valid JSON: {e}"))
    })?;
    Ok((status, value))
}
