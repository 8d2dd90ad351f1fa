use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

enum ProxyResolution {
    UseProxy(String),
    /// Provider set `proxy = ""`.
    ForceDirectConnect,
    /// Not configured; reqwest reads HTTPS_PROXY / HTTP_PROXY itself.
    None,
}

fn resolve_proxy(provider_proxy: Option<&str>) -> ProxyResolution {
    match provider_proxy {
        Some("") => ProxyResolution::ForceDirectConnect,
        Some(p) => ProxyResolution::UseProxy(p.trim().to_string()),
        None => ProxyResolution::None,
    }
}

/// Builds the HTTP client shared by one generator instance.
pub fn build_http_client(provider_proxy: Option<&str>, api_base: &str, timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match resolve_proxy(provider_proxy) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, api_base = %api_base, "Generator using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(api_base = %api_base, "Generator forced to direct connect");
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

/// Largest byte index <= `max_bytes` on a char boundary, for log previews.
pub(crate) fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_proxy() {
        assert!(matches!(resolve_proxy(Some("")), ProxyResolution::ForceDirectConnect));
        assert!(matches!(resolve_proxy(None), ProxyResolution::None));
        assert!(matches!(
            resolve_proxy(Some("http://proxy:8080")),
            ProxyResolution::UseProxy(url) if url == "http://proxy:8080"
        ));
    }

    #[test]
    fn test_truncate_at_char_boundary() {
        let s = "héllo";
        assert_eq!(truncate_at_char_boundary(s, 2), 1);
        assert_eq!(truncate_at_char_boundary(s, 100), s.len());
    }
}
