//! Proxy suppliers used to fill and refill the pool.
//!
//! Suppliers are best effort by contract: a source that is down, slow or
//! returns garbage contributes nothing and the others carry on. A supplier
//! never fails, it can only come back empty.

use crate::error::ScanError;
use crate::types::ProxyEndpoint;
use crate::utils::{dedup_endpoints, parse_proxy_list};
use futures::future::BoxFuture;
use std::path::Path;

#[cfg(feature = "scrape")]
use crate::utils::parse_proxy_token;
#[cfg(feature = "scrape")]
use lazy_static::lazy_static;
#[cfg(feature = "scrape")]
use regex::Regex;
#[cfg(feature = "scrape")]
use std::time::Duration;

/// Anything that can produce a fresh batch of proxy endpoints.
pub trait ProxySupplier: Send + Sync {
    /// Produce a de-duplicated list of endpoints, possibly empty.
    fn scrape(&self) -> BoxFuture<'_, Vec<ProxyEndpoint>>;

    /// Short label for logs.
    fn name(&self) -> &str;
}

/// A fixed list of endpoints, typically loaded from a file.
#[derive(Debug, Clone, Default)]
pub struct StaticSupplier {
    endpoints: Vec<ProxyEndpoint>,
}

impl StaticSupplier {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        Self {
            endpoints: dedup_endpoints(endpoints),
        }
    }

    /// Parse newline separated `host:port` text. Bad lines are skipped.
    pub fn from_text(text: &str) -> Self {
        Self {
            endpoints: parse_proxy_list(text),
        }
    }

    /// Load a proxy list file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScanError::file_error(path.to_string_lossy(), e.to_string()))?;
        Ok(Self::from_text(&text))
    }

    pub fn endpoints(&self) -> &[ProxyEndpoint] {
        &self.endpoints
    }
}

impl ProxySupplier for StaticSupplier {
    fn scrape(&self) -> BoxFuture<'_, Vec<ProxyEndpoint>> {
        Box::pin(async move { self.endpoints.clone() })
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Raw `host:port` lists downloaded by default.
#[cfg(feature = "scrape")]
pub const DEFAULT_RAW_LISTS: &[&str] = &[
    "https://raw.githubusercontent.com/ALIILAPRO/Proxy/main/http.txt",
    "https://raw.githubusercontent.com/ShiftyTR/Proxy-List/master/http.txt",
    "https://raw.githubusercontent.com/prxchk/proxy-list/main/http.txt",
    "https://raw.githubusercontent.com/UptimerBot/proxy-list/master/proxies/http.txt",
    "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
];

/// HTML pages whose proxy tokens are extracted by pattern.
#[cfg(feature = "scrape")]
pub const DEFAULT_HTML_PAGES: &[&str] = &["https://free-proxy-list.net/"];

#[cfg(feature = "scrape")]
lazy_static! {
    // Dotted quad with every octet in 0-255, then a port.
    static ref PROXY_TOKEN_RE: Regex = Regex::new(concat!(
        r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}",
        r"(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d):\d{1,5}\b",
    ))
    .expect("proxy token pattern is a valid regex");
}

/// Pull every `a.b.c.d:port` token out of an HTML page.
#[cfg(feature = "scrape")]
pub fn extract_proxy_tokens(html: &str) -> Vec<ProxyEndpoint> {
    dedup_endpoints(
        PROXY_TOKEN_RE
            .find_iter(html)
            .filter_map(|m| parse_proxy_token(m.as_str())),
    )
}

#[cfg(feature = "scrape")]
#[derive(Debug, Clone, Copy)]
enum SourceKind {
    RawList,
    Html,
}

/// Scrapes public proxy lists.
///
/// Every source is fetched concurrently under a shared time budget. Results
/// are flattened in source order and de-duplicated keeping the first
/// occurrence.
#[cfg(feature = "scrape")]
#[derive(Debug, Clone)]
pub struct ScrapeSupplier {
    http: reqwest::Client,
    raw_lists: Vec<String>,
    html_pages: Vec<String>,
    budget: Duration,
}

#[cfg(feature = "scrape")]
impl ScrapeSupplier {
    /// Supplier over the built-in public sources with a 5 second budget.
    pub fn new() -> Result<Self, ScanError> {
        Self::with_sources(
            DEFAULT_RAW_LISTS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_HTML_PAGES.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Supplier over custom sources.
    pub fn with_sources(
        raw_lists: Vec<String>,
        html_pages: Vec<String>,
    ) -> Result<Self, ScanError> {
        let budget = Duration::from_secs(5);
        let http = reqwest::Client::builder()
            .timeout(budget)
            .build()
            .map_err(|e| {
                ScanError::transport_with_source(
                    "Failed to create scraper HTTP client",
                    e.to_string(),
                )
            })?;

        Ok(Self {
            http,
            raw_lists,
            html_pages,
            budget,
        })
    }

    async fn fetch(&self, url: &str, kind: SourceKind) -> Vec<ProxyEndpoint> {
        let attempt = async {
            let response = self.http.get(url).send().await?;
            if !response.status().is_success() {
                return Err(ScanError::upstream(response.status().as_u16(), ""));
            }
            Ok::<_, ScanError>(response.text().await?)
        };

        let text = match tokio::time::timeout(self.budget, attempt).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(source = url, error = %e, "proxy source failed");
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!(source = url, budget = ?self.budget, "proxy source timed out");
                return Vec::new();
            }
        };

        let endpoints = match kind {
            SourceKind::RawList => parse_proxy_list(&text),
            SourceKind::Html => extract_proxy_tokens(&text),
        };
        tracing::debug!(source = url, count = endpoints.len(), "proxy source scraped");
        endpoints
    }
}

#[cfg(feature = "scrape")]
impl ProxySupplier for ScrapeSupplier {
    fn scrape(&self) -> BoxFuture<'_, Vec<ProxyEndpoint>> {
        Box::pin(async move {
            let sources = self
                .html_pages
                .iter()
                .map(|url| (url.as_str(), SourceKind::Html))
                .chain(
                    self.raw_lists
                        .iter()
                        .map(|url| (url.as_str(), SourceKind::RawList)),
                );

            let batches =
                futures::future::join_all(sources.map(|(url, kind)| self.fetch(url, kind))).await;

            let endpoints = dedup_endpoints(batches.into_iter().flatten());
            tracing::info!(count = endpoints.len(), "scraped proxies");
            endpoints
        })
    }

    fn name(&self) -> &str {
        "scrape"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_supplier_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let contents = b"1.1.1.1:80\nbroken\n1.1.1.1:80\n2.2.2.2:3128\n";
        std::io::Write::write_all(&mut file, contents).unwrap();

        let supplier = StaticSupplier::from_file(file.path()).unwrap();
        let endpoints = supplier.scrape().await;
        assert_eq!(
            endpoints,
            vec![
                ProxyEndpoint::new("1.1.1.1", 80),
                ProxyEndpoint::new("2.2.2.2", 3128)
            ]
        );
        // Scraping does not consume the list.
        assert_eq!(supplier.scrape().await.len(), 2);
    }

    #[test]
    fn test_missing_file_is_a_file_error() {
        assert!(matches!(
            StaticSupplier::from_file("/definitely/not/here.txt"),
            Err(ScanError::FileError { .. })
        ));
    }

    #[cfg(feature = "scrape")]
    #[test]
    fn test_extract_tokens_from_html_table() {
        let html = r#"<textarea class="form-control" readonly="readonly" rows="12">
Free proxies from free-proxy-list.net
Updated at 2024-01-01 00:00:00 UTC.

10.1.1.1:8080
10.2.2.2:3128
10.1.1.1:8080
</textarea><td>999.1.1.1:99999</td>"#;
        assert_eq!(
            extract_proxy_tokens(html),
            vec![
                ProxyEndpoint::new("10.1.1.1", 8080),
                ProxyEndpoint::new("10.2.2.2", 3128)
            ]
        );
    }

    #[cfg(feature = "scrape")]
    #[test]
    fn test_extract_rejects_out_of_range_octets() {
        let html = "<td>999.1.1.1:80</td><td>10.256.0.1:8080</td><td>255.0.0.1:3128</td>";
        assert_eq!(
            extract_proxy_tokens(html),
            vec![ProxyEndpoint::new("255.0.0.1", 3128)]
        );
    }

    #[cfg(feature = "scrape")]
    #[tokio::test]
    async fn test_scrape_merges_sources_and_skips_failures() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("1.1.1.1:80\r\n2.2.2.2:8080\r\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<td>2.2.2.2:8080</td><td>3.3.3.3:3128</td>"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let supplier = ScrapeSupplier::with_sources(
            vec![format!("{}/list", server.uri()), format!("{}/broken", server.uri())],
            vec![format!("{}/page", server.uri())],
        )
        .unwrap();

        let endpoints = supplier.scrape().await;
        assert_eq!(endpoints.len(), 3);
        assert!(endpoints.contains(&ProxyEndpoint::new("1.1.1.1", 80)));
        assert!(endpoints.contains(&ProxyEndpoint::new("3.3.3.3", 3128)));
    }
}
