//! Anti-bot solver proxy client.
//!
//! Janitor answers plain HTTP clients with a challenge page. A FlareSolverr
//! instance loads the target in a real browser and returns the rendered HTML;
//! JSON endpoints render as a single `<pre>` element holding the payload.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::ProviderError;
use crate::http::{HttpError, RateLimitedClient};
use crate::model::ProviderKind;

/// How long the solver may spend on one page, in milliseconds.
const SOLVER_MAX_TIMEOUT_MS: u64 = 60_000;

/// What the solver saw at the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolvedPage {
    /// HTTP status the target answered with.
    pub status: u16,
    /// Rendered page HTML.
    pub html: String,
}

/// Renders a protected URL and returns its HTML.
#[async_trait]
pub trait Solver: Send + Sync {
    /// Loads `target_url` through the solver.
    ///
    /// # Errors
    ///
    /// Transport failures surface as [`ProviderError::Http`], as does a
    /// target that keeps answering 429 or 5xx through the solver. A solver
    /// that answers without a solution is [`ProviderError::MalformedUpstream`].
    async fn solve(&self, target_url: &str) -> Result<SolvedPage, ProviderError>;
}

#[derive(Debug, Serialize)]
struct SolverRequest<'a> {
    cmd: &'a str,
    url: &'a str,
    #[serde(rename = "maxTimeout")]
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SolverResponse {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<SolverSolution>,
}

#[derive(Debug, Deserialize)]
struct SolverSolution {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    response: String,
}

/// [`Solver`] backed by a FlareSolverr `/v1` endpoint.
#[derive(Debug, Clone)]
pub struct FlareSolverr {
    client: RateLimitedClient,
    endpoint: String,
}

impl FlareSolverr {
    /// Creates a solver client for `solver_url` (e.g. `http://localhost:8191`).
    ///
    /// All calls are paced by `client`'s limiter.
    #[must_use]
    pub fn new(client: RateLimitedClient, solver_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1", solver_url.trim_end_matches('/')),
        }
    }

    /// Returns the `/v1` endpoint requests are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Solver for FlareSolverr {
    #[instrument(skip(self))]
    async fn solve(&self, target_url: &str) -> Result<SolvedPage, ProviderError> {
        let request = SolverRequest {
            cmd: "request.get",
            url: target_url,
            max_timeout: SOLVER_MAX_TIMEOUT_MS,
        };

        let response: SolverResponse = self
            .client
            .post_json_checked(&self.endpoint, &request, |response: &SolverResponse| {
                check_target_status(target_url, response)
            })
            .await
            .map_err(|e| ProviderError::http(ProviderKind::Janitor, e))?;

        if !response.status.eq_ignore_ascii_case("ok") {
            return Err(ProviderError::malformed(
                ProviderKind::Janitor,
                target_url,
                format!("solver status '{}': {}", response.status, response.message),
            ));
        }

        let solution = response.solution.ok_or_else(|| {
            ProviderError::malformed(ProviderKind::Janitor, target_url, "solver returned no solution")
        })?;

        debug!(
            status = solution.status,
            html_len = solution.response.len(),
            "solver returned page"
        );

        Ok(SolvedPage {
            status: solution.status,
            html: solution.response,
        })
    }
}

/// Reports a throttled or failing target as an HTTP status error against the
/// target URL, so the client backs off and asks the solver again.
fn check_target_status(target_url: &str, response: &SolverResponse) -> Result<(), HttpError> {
    match &response.solution {
        Some(solution) if solution.status == 429 || solution.status >= 500 => {
            Err(HttpError::http_status(target_url, solution.status))
        }
        _ => Ok(()),
    }
}

/// Extracts and decodes the JSON payload wrapped in the page's `<pre>` element.
///
/// # Errors
///
/// Returns [`ProviderError::MalformedUpstream`] when there is no non-empty
/// `<pre>` element or its text is not valid JSON for `T`.
pub fn extract_json_payload<T: DeserializeOwned>(
    html: &str,
    url: &str,
) -> Result<T, ProviderError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("pre").map_err(|e| {
        ProviderError::malformed(ProviderKind::Janitor, url, format!("bad selector: {e}"))
    })?;

    let payload: String = document
        .select(&selector)
        .next()
        .map(|pre| pre.text().collect())
        .unwrap_or_default();

    if payload.trim().is_empty() {
        return Err(ProviderError::malformed(
            ProviderKind::Janitor,
            url,
            "no <pre> JSON payload in solver response",
        ));
    }

    serde_json::from_str(&payload).map_err(|e| {
        ProviderError::malformed(ProviderKind::Janitor, url, format!("invalid JSON payload: {e}"))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::http::{ClientConfig, RetryPolicy};

    const TARGET: &str = "https://kim.janitorai.com/characters/abc";

    fn solver_for(server: &MockServer, max_attempts: u32) -> FlareSolverr {
        let config = ClientConfig {
            max_concurrent: 2,
            max_rps: 100,
            timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::new(
                max_attempts,
                Duration::from_millis(10),
                Duration::from_millis(10),
                2.0,
            ),
        };
        let client = RateLimitedClient::new("janitor", &config, CancellationToken::new()).unwrap();
        FlareSolverr::new(client, &server.uri())
    }

    fn solution(status: u16, html: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "message": "",
            "solution": {"status": status, "response": html}
        }))
    }

    #[tokio::test]
    async fn test_solve_retries_target_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .respond_with(solution(503, "<html>Service Unavailable</html>"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .respond_with(solution(200, r#"<pre>{"id":"abc"}</pre>"#))
            .expect(1)
            .mount(&server)
            .await;

        let page = solver_for(&server, 3).solve(TARGET).await.unwrap();

        assert_eq!(page.status, 200);
        let value: serde_json::Value = extract_json_payload(&page.html, TARGET).unwrap();
        assert_eq!(value["id"], "abc");
    }

    #[tokio::test]
    async fn test_solve_persistent_throttling_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .respond_with(solution(429, "<html>Too Many Requests</html>"))
            .expect(2)
            .mount(&server)
            .await;

        let error = solver_for(&server, 2).solve(TARGET).await.unwrap_err();

        assert!(error.is_transient(), "unexpected error: {error}");
        assert!(!error.is_malformed());
        assert!(error.to_string().contains("429"), "{error}");
    }

    #[tokio::test]
    async fn test_solve_target_not_found_is_returned_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .respond_with(solution(404, "<html>Not Found</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let page = solver_for(&server, 3).solve(TARGET).await.unwrap();
        assert_eq!(page.status, 404);
    }

    #[test]
    fn test_extract_json_payload_from_pre() {
        let html = r#"<html><head></head><body><pre>{"id":"abc","total":3}</pre></body></html>"#;
        let value: serde_json::Value = extract_json_payload(html, "https://x").unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["total"], 3);
    }

    #[test]
    fn test_extract_json_payload_unescapes_entities() {
        let html = "<pre>{&quot;name&quot;:&quot;A &amp; B&quot;}</pre>";
        let value: serde_json::Value = extract_json_payload(html, "https://x").unwrap();
        assert_eq!(value["name"], "A & B");
    }

    #[test]
    fn test_extract_json_payload_missing_pre_is_malformed() {
        let html = "<html><body><h1>Just a moment...</h1></body></html>";
        let error = extract_json_payload::<serde_json::Value>(html, "https://x").unwrap_err();
        assert!(error.is_malformed());
        assert!(error.to_string().contains("no <pre>"));
    }

    #[test]
    fn test_extract_json_payload_invalid_json_is_malformed() {
        let html = "<pre>{not json</pre>";
        let error = extract_json_payload::<serde_json::Value>(html, "https://x").unwrap_err();
        assert!(error.is_malformed());
    }

    #[test]
    fn test_solver_request_serializes_flaresolverr_shape() {
        let request = SolverRequest {
            cmd: "request.get",
            url: "https://kim.janitorai.com/tags",
            max_timeout: SOLVER_MAX_TIMEOUT_MS,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "cmd": "request.get",
                "url": "https://kim.janitorai.com/tags",
                "maxTimeout": 60000
            })
        );
    }

    #[test]
    fn test_flaresolverr_endpoint_appends_v1() {
        let client = RateLimitedClient::new(
            "janitor",
            &crate::http::ClientConfig::default(),
            tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();
        let solver = FlareSolverr::new(client, "http://localhost:8191/");
        assert_eq!(solver.endpoint(), "http://localhost:8191/v1");
    }
}
