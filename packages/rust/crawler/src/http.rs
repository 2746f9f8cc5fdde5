//! HTTP(S) source connector.
//!
//! Every fetched URL becomes a [`RemoteFile`]. HTML pages also yield their
//! same-host links under the crawl root as children.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, LAST_MODIFIED};
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use librarian_shared::{CrawlerSettings, LibrarianError, Result, UriType};

use crate::source::{CrawlSource, RemoteFile, Visit, compute_hash};

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!("Librarian/", env!("CARGO_PKG_VERSION"));

/// Crawls web sites over HTTP(S).
pub struct HttpSource {
    client: Client,
    /// Allow localhost/private IPs (intranet sources, mock servers in tests).
    allow_private_hosts: bool,
}

impl HttpSource {
    pub fn new(settings: &CrawlerSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| LibrarianError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_private_hosts: settings.allow_private_hosts,
        })
    }

    /// Builder-style override of the private-host guard.
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }
}

#[async_trait]
impl CrawlSource for HttpSource {
    fn uri_type(&self) -> UriType {
        UriType::Http
    }

    async fn visit(&self, root: &str, uri: &str) -> Result<Visit> {
        let root = Url::parse(root)
            .map_err(|e| LibrarianError::validation(format!("invalid crawl root '{root}': {e}")))?;
        let url = Url::parse(uri)
            .map_err(|e| LibrarianError::validation(format!("invalid URL '{uri}': {e}")))?;

        if !self.allow_private_hosts && is_ssrf_target(&url) {
            return Err(LibrarianError::Network(format!(
                "{url}: blocked private or non-HTTP target"
            )));
        }

        debug!(%url, "fetching");
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| LibrarianError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LibrarianError::Network(format!("{url}: HTTP {status}")));
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
            .unwrap_or_else(|| guess_mime_type(url.path()).to_string());

        let modified_at = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let body = response
            .bytes()
            .await
            .map_err(|e| LibrarianError::Network(format!("{url}: body read failed: {e}")))?
            .to_vec();

        let children = if mime_type == "text/html" {
            let html = String::from_utf8_lossy(&body);
            let doc = Html::parse_document(&html);
            extract_links(&doc, &url)
                .into_iter()
                .filter(|link| in_scope(&root, link))
                .map(|link| normalize_url(&link))
                .collect()
        } else {
            Vec::new()
        };

        let file = RemoteFile {
            uri: normalize_url(&url),
            name: file_name(&url),
            path: url.path().to_string(),
            mime_type,
            size: body.len() as i64,
            modified_at,
            content_hash: compute_hash(&body),
            content: body,
        };

        Ok(Visit {
            file: Some(file),
            children,
        })
    }
}

// ---------------------------------------------------------------------------
// Scope checking
// ---------------------------------------------------------------------------

/// Same scheme family and host as the root, and under the root's path.
fn in_scope(root: &Url, url: &Url) -> bool {
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }
    if url.host_str() != root.host_str() || url.port_or_known_default() != root.port_or_known_default() {
        return false;
    }
    let base = root.path().trim_end_matches('/');
    let path = url.path();
    base.is_empty() || path == base || path.starts_with(&format!("{base}/"))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// All links of a document, resolved against the page URL, fragments removed.
fn extract_links(doc: &Html, base_url: &Url) -> Vec<Url> {
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for el in doc.select(&link_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        match base_url.join(href) {
            Ok(mut resolved) => {
                resolved.set_fragment(None);
                links.push(resolved);
            }
            Err(e) => warn!(href, error = %e, "unresolvable link"),
        }
    }
    links
}

/// Normalize a URL for deduplication and diffing (no fragment, no trailing
/// slash except on the root).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    if s.ends_with('/') && normalized.path() != "/" {
        s.pop();
    }
    s
}

/// Last path segment, or `index.html` for directory-like URLs.
fn file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "index.html".to_string())
}

/// Mime type from a path extension, for responses without a Content-Type.
fn guess_mime_type(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "md" | "markdown" => "text/markdown",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source() -> HttpSource {
        HttpSource::new(&CrawlerSettings::default())
            .expect("client")
            .allow_private_hosts(true)
    }

    #[test]
    fn normalize_strips_fragment_and_trailing_slash() {
        let url = Url::parse("https://docs.example.com/guide/intro/#section-1").expect("url");
        assert_eq!(normalize_url(&url), "https://docs.example.com/guide/intro");

        let root = Url::parse("https://docs.example.com/").expect("url");
        assert_eq!(normalize_url(&root), "https://docs.example.com/");
    }

    #[test]
    fn scope_is_host_and_path_prefix() {
        let root = Url::parse("https://docs.example.com/guide/").expect("url");
        let inside = Url::parse("https://docs.example.com/guide/intro").expect("url");
        let sibling = Url::parse("https://docs.example.com/guides-old").expect("url");
        let other_host = Url::parse("https://other.example.com/guide/intro").expect("url");
        assert!(in_scope(&root, &inside));
        assert!(!in_scope(&root, &sibling));
        assert!(!in_scope(&root, &other_host));
    }

    #[test]
    fn ssrf_guard() {
        for blocked in [
            "file:///etc/passwd",
            "http://192.168.1.1/admin",
            "http://127.0.0.1:8080/",
            "http://localhost:3000/api",
            "http://[::1]/",
        ] {
            assert!(is_ssrf_target(&Url::parse(blocked).expect("url")), "{blocked}");
        }
        assert!(!is_ssrf_target(
            &Url::parse("https://docs.example.com/page").expect("url")
        ));
    }

    #[test]
    fn file_names_and_mime_guess() {
        let url = Url::parse("https://x.com/docs/report.pdf").expect("url");
        assert_eq!(file_name(&url), "report.pdf");
        let dir = Url::parse("https://x.com/docs/").expect("url");
        assert_eq!(file_name(&dir), "index.html");
        assert_eq!(guess_mime_type("/a/b.CSV"), "text/csv");
    }

    #[tokio::test]
    async fn visit_html_page_yields_file_and_children() {
        let server = MockServer::start().await;
        let page = r##"<html><body><main>
            <h1>Root</h1>
            <a href="/docs/page2">Page 2</a>
            <a href="/other/outside">Outside</a>
            <a href="#anchor">Anchor</a>
            <a href="https://external.example.com/">External</a>
        </main></body></html>"##;

        Mock::given(method("GET"))
            .and(path("/docs/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string(page),
            )
            .mount(&server)
            .await;

        let root = format!("{}/docs/", server.uri());
        let visit = source().visit(&root, &root).await.expect("visit");

        let file = visit.file.expect("file");
        assert_eq!(file.mime_type, "text/html");
        assert_eq!(file.size, page.len() as i64);
        assert_eq!(file.content_hash, compute_hash(page.as_bytes()));
        assert_eq!(visit.children, vec![format!("{}/docs/page2", server.uri())]);
    }

    #[tokio::test]
    async fn visit_binary_has_no_children() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/data.csv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/csv")
                    .set_body_string("a,b\n1,2\n"),
            )
            .mount(&server)
            .await;

        let root = format!("{}/files/", server.uri());
        let uri = format!("{}/files/data.csv", server.uri());
        let visit = source().visit(&root, &uri).await.expect("visit");
        let file = visit.file.expect("file");
        assert_eq!(file.name, "data.csv");
        assert_eq!(file.path, "/files/data.csv");
        assert!(visit.children.is_empty());
    }

    #[tokio::test]
    async fn http_errors_are_network_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let uri = format!("{}/missing", server.uri());
        let err = source().visit(&server.uri(), &uri).await.err().expect("404");
        assert!(matches!(err, LibrarianError::Network(_)));
    }

    #[tokio::test]
    async fn private_hosts_blocked_by_default() {
        let source = HttpSource::new(&CrawlerSettings::default()).expect("client");
        let err = source
            .visit("http://127.0.0.1:9/", "http://127.0.0.1:9/")
            .await
            .err()
            .expect("blocked");
        assert!(err.to_string().contains("blocked"));
    }
}
