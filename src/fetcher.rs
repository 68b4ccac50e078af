use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const USER_AGENT: &str = "feedwatch/0.1 (Feed Poller)";
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection, TLS or protocol failure
    #[error("Request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    /// Any non-2xx status other than 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Response too large")]
    ResponseTooLarge,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e)
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// The server answered 304 Not Modified
    Unchanged,
    Fetched {
        body: Vec<u8>,
        last_modified: Option<DateTime<Utc>>,
    },
}

/// Issues one conditional GET per call. Never retries and never touches the cache.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(FetchError::Network)?;

        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        feed_id: &str,
        modified_since: Option<DateTime<Utc>>,
    ) -> Result<FetchOutcome, FetchError> {
        let url = validate_url(feed_id)?;

        let mut request = self.client.get(url);
        if let Some(since) = modified_since {
            request = request.header(IF_MODIFIED_SINCE, format_http_date(since));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(feed = %feed_id, "Feed not modified (HTTP 304)");
            // Dropping the response without reading the body releases the connection
            return Ok(FetchOutcome::Unchanged);
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        if response
            .content_length()
            .is_some_and(|len| len > MAX_FEED_SIZE as u64)
        {
            return Err(FetchError::ResponseTooLarge);
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        let body = response.bytes().await?;
        if body.len() > MAX_FEED_SIZE {
            return Err(FetchError::ResponseTooLarge);
        }

        debug!(feed = %feed_id, bytes = body.len(), "Fetched feed");
        Ok(FetchOutcome::Fetched {
            body: body.to_vec(),
            last_modified,
        })
    }
}

/// Only `http` and `https` feeds can be fetched.
pub fn validate_url(feed_id: &str) -> Result<Url, FetchError> {
    let url = Url::parse(feed_id)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::UnsupportedScheme(other.to_string())),
    }
}

pub fn format_http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an HTTP-date (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn fetcher() -> Fetcher {
        Fetcher::new(Duration::from_secs(5)).unwrap()
    }

    mod http_date_tests {
        use super::*;

        #[test]
        fn test_format_http_date() {
            let time = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
            assert_eq!(format_http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
        }

        #[test]
        fn test_parse_http_date() {
            let parsed = parse_http_date("Mon, 09 Dec 2024 12:00:00 GMT");
            assert_eq!(parsed, Some(Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap()));
        }

        #[test]
        fn test_parse_http_date_invalid() {
            assert_eq!(parse_http_date("yesterday"), None);
            assert_eq!(parse_http_date(""), None);
        }
    }

    mod fetch_tests {
        use super::*;

        #[tokio::test]
        async fn test_fetch_returns_body_and_last_modified() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/rss"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string("<rss/>")
                        .insert_header("Last-Modified", "Mon, 09 Dec 2024 12:00:00 GMT"),
                )
                .expect(1)
                .mount(&server)
                .await;

            let outcome = fetcher()
                .fetch(&format!("{}/rss", server.uri()), None)
                .await
                .unwrap();

            match outcome {
                FetchOutcome::Fetched {
                    body,
                    last_modified,
                } => {
                    assert_eq!(body, b"<rss/>");
                    assert_eq!(
                        last_modified,
                        Some(Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap())
                    );
                }
                FetchOutcome::Unchanged => panic!("expected fetched content"),
            }
        }

        #[tokio::test]
        async fn test_fetch_without_last_modified_header() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<rss/>"))
                .mount(&server)
                .await;

            let outcome = fetcher().fetch(&server.uri(), None).await.unwrap();
            assert!(matches!(
                outcome,
                FetchOutcome::Fetched {
                    last_modified: None,
                    ..
                }
            ));
        }

        #[tokio::test]
        async fn test_conditional_header_sent_and_304_is_unchanged() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(|request: &Request| {
                    request
                        .headers
                        .get("If-Modified-Since")
                        .and_then(|v| v.to_str().ok())
                        == Some("Mon, 09 Dec 2024 12:00:00 GMT")
                })
                .respond_with(ResponseTemplate::new(304))
                .expect(1)
                .mount(&server)
                .await;

            let since = Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap();
            let outcome = fetcher().fetch(&server.uri(), Some(since)).await.unwrap();

            assert!(matches!(outcome, FetchOutcome::Unchanged));
        }

        #[tokio::test]
        async fn test_no_conditional_header_without_prior_fetch() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(header_exists("If-Modified-Since"))
                .respond_with(ResponseTemplate::new(304))
                .expect(0)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<rss/>"))
                .mount(&server)
                .await;

            let outcome = fetcher().fetch(&server.uri(), None).await.unwrap();
            assert!(matches!(outcome, FetchOutcome::Fetched { .. }));
        }

        #[tokio::test]
        async fn test_server_error_is_http_status() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;

            let result = fetcher().fetch(&server.uri(), None).await;
            assert!(matches!(result, Err(FetchError::HttpStatus(503))));
        }

        #[tokio::test]
        async fn test_slow_server_times_out() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string("<rss/>")
                        .set_delay(Duration::from_secs(2)),
                )
                .mount(&server)
                .await;

            let fetcher = Fetcher::new(Duration::from_millis(200)).unwrap();
            let result = fetcher.fetch(&server.uri(), None).await;
            assert!(matches!(result, Err(FetchError::Timeout)));
        }
    }

    mod url_tests {
        use super::*;

        #[tokio::test]
        async fn test_unsupported_scheme() {
            let result = fetcher().fetch("ftp://example.com/feed.xml", None).await;
            assert!(matches!(result, Err(FetchError::UnsupportedScheme(s)) if s == "ftp"));
        }

        #[tokio::test]
        async fn test_invalid_url() {
            let result = fetcher().fetch("not a url", None).await;
            assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
        }
    }
}
