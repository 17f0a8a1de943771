use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

enum ProxyResolution {
    UseProxy(String),
    /// `proxy = ""` in config: ignore environment proxies too.
    ForceDirectConnect,
    /// Not configured; reqwest reads HTTPS_PROXY/HTTP_PROXY itself.
    None,
}

fn resolve_proxy(configured: Option<&str>) -> ProxyResolution {
    match configured.map(str::trim) {
        Some("") => ProxyResolution::ForceDirectConnect,
        Some(p) => ProxyResolution::UseProxy(p.to_string()),
        None => ProxyResolution::None,
    }
}

/// Build the HTTP client used for chat completions.
pub fn build_http_client(proxy: Option<&str>, api_base: &str, timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match resolve_proxy(proxy) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, api_base = %api_base, "LLM provider using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(api_base = %api_base, "LLM provider forced to direct connect (proxy disabled)");
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_proxy() {
        assert!(matches!(resolve_proxy(None), ProxyResolution::None));
        assert!(matches!(resolve_proxy(Some(" ")), ProxyResolution::ForceDirectConnect));
        assert!(matches!(
            resolve_proxy(Some("http://proxy.local:8080")),
            ProxyResolution::UseProxy(url) if url == "http://proxy.local:8080"
        ));
    }

    #[test]
    fn test_build_http_client_with_bad_proxy_still_builds() {
        let client = build_http_client(Some("::not a proxy::"), "https://api.openai.com/v1", Duration::from_secs(5));
        drop(client);
    }
}
