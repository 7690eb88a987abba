//! Post-deployment verification
//!
//! A probe is an HTTP GET whose status (and optionally body) must match
//! the expectation. Failed attempts are retried with exponential backoff;
//! the Verify stage fails if any probe still fails after its last attempt.

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::PipelineError;
use keel_core::domain::probe::{ProbeResult, ProbeSpec};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Response fields a probe can assert on
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

/// Performs one request; retries are handled by `run_probe`
#[async_trait]
pub trait Prober: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ProbeResponse>;
}

pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn fetch(&self, url: &str) -> Result<ProbeResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .with_context(|| format!("reading body of {} failed", url))?;
        Ok(ProbeResponse { status, body })
    }
}

/// Retry schedule for probes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl From<&crate::config::PipelineConfig> for RetryPolicy {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            attempts: config.probe_attempts.max(1),
            initial_delay: config.probe_backoff,
            max_delay: config.probe_max_backoff,
        }
    }
}

/// Checks one response against the probe expectation
fn assess(spec: &ProbeSpec, response: &ProbeResponse) -> std::result::Result<(), String> {
    if !spec.status_ok(response.status) {
        return Err(match spec.expect_status {
            Some(expected) => format!("status {} (expected {})", response.status, expected),
            None => format!("status {}", response.status),
        });
    }
    if let Some(needle) = &spec.contains {
        if !response.body.contains(needle.as_str()) {
            return Err(format!("body does not contain '{}'", needle));
        }
    }
    Ok(())
}

/// Runs a probe until it passes or its attempts are used up
pub async fn run_probe(prober: &dyn Prober, spec: &ProbeSpec, policy: RetryPolicy) -> ProbeResult {
    let max_attempts = policy.attempts.max(1);
    let mut attempt = 0;
    let mut delay = policy.initial_delay;
    let mut status = None;

    loop {
        attempt += 1;

        let outcome = match prober.fetch(&spec.url).await {
            Ok(response) => {
                status = Some(response.status);
                assess(spec, &response)
            }
            Err(e) => {
                status = None;
                Err(format!("{:#}", e))
            }
        };

        match outcome {
            Ok(()) => {
                if attempt > 1 {
                    info!("Probe {} passed after {} attempt(s)", spec.label(), attempt);
                }
                return ProbeResult {
                    probe: spec.label(),
                    url: spec.url.clone(),
                    success: true,
                    status,
                    attempts: attempt,
                    detail: None,
                };
            }
            Err(reason) => {
                if attempt >= max_attempts {
                    warn!(
                        "Probe {} failed after {} attempt(s): {}",
                        spec.label(),
                        attempt,
                        reason
                    );
                    return ProbeResult {
                        probe: spec.label(),
                        url: spec.url.clone(),
                        success: false,
                        status,
                        attempts: attempt,
                        detail: Some(reason),
                    };
                }

                debug!(
                    "Probe {} failed (attempt {}/{}): {}, retrying in {:?}",
                    spec.label(),
                    attempt,
                    max_attempts,
                    reason,
                    delay
                );
                tokio::time::sleep(delay).await;

                // Exponential backoff with cap
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }
}

/// Runs every probe, in order
///
/// All probes run even after a failure so the report shows each one; the
/// error names the first failing probe.
pub async fn verify_all(
    prober: &dyn Prober,
    specs: &[ProbeSpec],
    policy: RetryPolicy,
) -> (Vec<ProbeResult>, Result<(), PipelineError>) {
    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        results.push(run_probe(prober, spec, policy).await);
    }

    let outcome = match results.iter().find(|r| !r.success) {
        Some(failed) => Err(PipelineError::Verification {
            probe: failed.probe.clone(),
            reason: failed
                .detail
                .clone()
                .unwrap_or_else(|| "probe failed".to_string()),
        }),
        None => Ok(()),
    };
    (results, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prober() -> HttpProber {
        HttpProber::new(Duration::from_secs(2)).unwrap()
    }

    fn fast_retries(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_probe_passes_on_2xx_and_body_match() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_body("<h1>hello</h1>")
            .create_async()
            .await;

        let mut spec = ProbeSpec::new(server.url());
        spec.contains = Some("hello".to_string());

        let result = run_probe(&prober(), &spec, RetryPolicy::once()).await;
        assert!(result.success, "{:?}", result.detail);
        assert_eq!(result.status, Some(200));
        assert_eq!(result.attempts, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_retries_until_attempts_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let spec = ProbeSpec::new(format!("{}/health", server.url()));
        let result = run_probe(&prober(), &spec, fast_retries(3)).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.status, Some(502));
        assert_eq!(result.detail.as_deref(), Some("status 502"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_body_mismatch_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_body("<h1>Welcome to nginx!</h1>")
            .create_async()
            .await;

        let mut spec = ProbeSpec::new(server.url());
        spec.contains = Some("hello".to_string());
        let result = run_probe(&prober(), &spec, RetryPolicy::once()).await;

        assert!(!result.success);
        assert!(result.detail.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_truncated_body_is_a_fetch_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Announces 100 bytes, sends 7, then hangs up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n<h1>hel")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let mut spec = ProbeSpec::new(format!("http://{}/", addr));
        spec.contains = Some("hello".to_string());
        let result = run_probe(&prober(), &spec, RetryPolicy::once()).await;

        assert!(!result.success);
        assert_eq!(result.status, None);
        let detail = result.detail.unwrap();
        assert!(detail.contains("reading body"), "{}", detail);
        assert!(!detail.contains("does not contain"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_without_status() {
        // Port 9 (discard) is not expected to have an HTTP listener
        let spec = ProbeSpec::new("http://127.0.0.1:9/");
        let result = run_probe(&prober(), &spec, RetryPolicy::once()).await;
        assert!(!result.success);
        assert_eq!(result.status, None);
    }

    #[tokio::test]
    async fn test_verify_all_reports_every_probe() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ok")
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("GET", "/down")
            .with_status(503)
            .create_async()
            .await;

        let specs = vec![
            ProbeSpec::new(format!("{}/down", server.url())),
            ProbeSpec::new(format!("{}/ok", server.url())),
        ];
        let (results, outcome) = verify_all(&prober(), &specs, RetryPolicy::once()).await;

        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
        let err = outcome.unwrap_err();
        assert_eq!(err.exit_code(), 6);
        assert!(err.to_string().contains("/down"));
    }
}
