//! HTTP client construction shared by provider clients and tools.

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

const DISABLE_SYSTEM_PROXY_ENV: &str = "WEAVE_DISABLE_SYSTEM_PROXY";

/// Default whole-request ceiling; individual tools may set a tighter
/// per-call timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Build the standard outbound HTTP client, respecting proxy settings.
///
/// System proxies are honored unless `WEAVE_DISABLE_SYSTEM_PROXY` is
/// set; tests always bypass them so a developer proxy cannot capture
/// mock traffic.
pub fn build_http_client() -> Client {
    let mut builder = Client::builder().timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    if should_disable_system_proxy() {
        builder = builder.no_proxy();
    }
    builder.build().unwrap_or_else(|error| {
        warn!(error = %error, "falling back to default HTTP client");
        Client::new()
    })
}

fn should_disable_system_proxy() -> bool {
    if std::env::var_os(DISABLE_SYSTEM_PROXY_ENV).is_some() {
        return true;
    }

    cfg!(test)
}
