//! reqwest-backed [`Fetcher`] with SSRF protection and robots.txt policy.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};
use url::Url;

use contentpipe_shared::{CanonicalUrl, RetrievalConfig};

use crate::fetcher::{Fetcher, FetcherError, RawResource};
use crate::robots::RobotsRules;

/// User-Agent string for fetch requests.
pub const USER_AGENT: &str = concat!("ContentPipe/", env!("CARGO_PKG_VERSION"));

/// Media types the HTTP fetcher will download.
const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "text/html",
    "application/xhtml+xml",
    "text/plain",
    "text/markdown",
    "text/x-markdown",
    "application/pdf",
];

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

pub struct HttpFetcher {
    client: Client,
    max_bytes: u64,
    respect_robots_txt: bool,
    allow_private_hosts: bool,
    /// robots.txt rules per origin, fetched once.
    robots: DashMap<String, Arc<RobotsRules>>,
}

impl HttpFetcher {
    pub fn new(config: &RetrievalConfig) -> Result<Self, FetcherError> {
        let redirect_limit = config.redirect_limit;
        let allow_private = config.allow_private_hosts;
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= redirect_limit {
                attempt.error("redirect limit exceeded")
            } else if !allow_private && is_ssrf_target(attempt.url()) {
                attempt.error("redirect to a private host")
            } else {
                attempt.follow()
            }
        });

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(policy)
            .timeout(config.fetch_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetcherError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_bytes: config.max_bytes,
            respect_robots_txt: config.respect_robots_txt,
            allow_private_hosts: config.allow_private_hosts,
            robots: DashMap::new(),
        })
    }

    async fn robots_for(&self, url: &Url) -> Arc<RobotsRules> {
        let origin = url.origin().ascii_serialization();
        if let Some(rules) = self.robots.get(&origin) {
            return rules.clone();
        }

        let rules = Arc::new(self.load_robots(&origin).await);
        self.robots.insert(origin, rules.clone());
        rules
    }

    async fn load_robots(&self, origin: &str) -> RobotsRules {
        let robots_url = format!("{origin}/robots.txt");
        let response = match self.client.get(&robots_url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(%robots_url, status = %r.status(), "no robots.txt, allowing all");
                return RobotsRules::allow_all();
            }
            Err(e) => {
                debug!(%robots_url, error = %e, "robots.txt fetch failed, allowing all");
                return RobotsRules::allow_all();
            }
        };
        match response.text().await {
            Ok(body) => RobotsRules::parse(&body, USER_AGENT),
            Err(_) => RobotsRules::allow_all(),
        }
    }

    fn is_content_type_allowed(content_type: &str) -> bool {
        let ct = content_type.split(';').next().unwrap_or(content_type).trim();
        ALLOWED_CONTENT_TYPES
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ct))
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &CanonicalUrl) -> Result<RawResource, FetcherError> {
        let parsed = url.to_url();

        if !self.allow_private_hosts && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return Err(FetcherError::Blocked(format!("{url}: private or local host")));
        }

        if self.respect_robots_txt {
            let rules = self.robots_for(&parsed).await;
            let path = match parsed.query() {
                Some(q) => format!("{}?{q}", parsed.path()),
                None => parsed.path().to_string(),
            };
            if !rules.is_allowed(&path) {
                return Err(FetcherError::Blocked(format!("{url}: disallowed by robots.txt")));
            }
        }

        debug!(%url, "fetching");
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let message = format!("{url}: HTTP {status}");
            return Err(if code == 408 || code == 429 || status.is_server_error() {
                FetcherError::Unreachable(message)
            } else {
                FetcherError::Blocked(message)
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(FetcherError::Unsupported(format!(
                    "{url}: body of {len} bytes exceeds limit of {}",
                    self.max_bytes
                )));
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(ct) = content_type.as_deref() {
            if !Self::is_content_type_allowed(ct) {
                return Err(FetcherError::Unsupported(format!("{url}: content type {ct}")));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_reqwest_error(url, e))?;
            if body.len() as u64 + chunk.len() as u64 > self.max_bytes {
                return Err(FetcherError::Unsupported(format!(
                    "{url}: body exceeds limit of {} bytes",
                    self.max_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(RawResource {
            body,
            content_type,
            final_url: Some(final_url),
            status: Some(status.as_u16()),
            text: None,
        })
    }
}

fn map_reqwest_error(url: &CanonicalUrl, err: reqwest::Error) -> FetcherError {
    if err.is_timeout() {
        return FetcherError::Timeout(format!("{url}: {err}"));
    }
    if err.is_redirect() {
        return FetcherError::Blocked(format!("{url}: {err}"));
    }
    FetcherError::Unreachable(format!("{url}: {err}"))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
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
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
