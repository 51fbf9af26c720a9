//! First-time web health verification (spec.md §4.8).
//!
//! The teacher keeps no HTTP client of its own - this is grounded on Design
//! Note "Global state": the process-wide HTTP session used for health
//! verification is modeled as an injected `HealthChecker` capability so
//! tests can substitute a fake instead of opening real sockets, the same
//! shape `paasd_scheduler::client::Scheduler` uses for the cluster API.

use std::time::Duration;

use async_trait::async_trait;
use paasd_definitions::Probe;

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `GET http://{domain}:{port}{path}`, returning the status code or an
    /// error describing a transport failure.
    async fn http_get(&self, domain: &str, port: u16, path: &str, timeout: Duration) -> Result<u16, String>;
    /// `connect((domain, port))`.
    async fn tcp_connect(&self, domain: &str, port: u16, timeout: Duration) -> Result<(), String>;
}

/// `reqwest`-backed `HealthChecker` for real deployments.
pub struct ReqwestHealthChecker {
    client: reqwest::Client,
}

impl Default for ReqwestHealthChecker {
    fn default() -> Self {
        ReqwestHealthChecker {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HealthChecker for ReqwestHealthChecker {
    async fn http_get(&self, domain: &str, port: u16, path: &str, timeout: Duration) -> Result<u16, String> {
        let url = format!("http://{}:{}{}", domain, port, path);
        self.client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map(|resp| resp.status().as_u16())
            .map_err(|e| e.to_string())
    }

    async fn tcp_connect(&self, domain: &str, port: u16, timeout: Duration) -> Result<(), String> {
        let addr = format!("{}:{}", domain, port);
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| format!("connect to {} timed out", addr))?
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// HTTP: retry up to 10 attempts, abort once total elapsed exceeds
/// `10 * timeout_seconds`. A liveness probe with an httpGet path accepts only
/// 200; otherwise any 2xx-5xx except 404 is acceptable. A final 404 or
/// transport failure is logged, not raised (spec.md §4.8).
pub async fn verify_http_health(
    checker: &dyn HealthChecker,
    domain: &str,
    port: u16,
    liveness: Option<&Probe>,
) {
    let (path, strict_200, per_request_timeout) = match liveness.and_then(|p| p.path.as_deref()) {
        Some(path) => (
            path.to_string(),
            true,
            Duration::from_secs(liveness.unwrap().timeout_seconds as u64),
        ),
        None => ("/".to_string(), false, Duration::from_secs(3)),
    };
    let budget = per_request_timeout * 10;
    let start = std::time::Instant::now();

    for attempt in 1..=10 {
        if start.elapsed() > budget {
            warn!("health check for {}:{} aborted after exceeding time budget", domain, port);
            return;
        }
        match checker.http_get(domain, port, &path, per_request_timeout).await {
            Ok(status) => {
                let ok = if strict_200 {
                    status == 200
                } else {
                    (200..600).contains(&status) && status != 404
                };
                if ok {
                    return;
                }
                if attempt == 10 {
                    warn!("health check for {}:{} gave up after 10 attempts, last status {}", domain, port, status);
                    return;
                }
            }
            Err(e) => {
                if attempt == 10 {
                    warn!("health check for {}:{} gave up after 10 attempts: {}", domain, port, e);
                    return;
                }
            }
        }
    }
}

/// TCP: up to 10 attempts, 3s per-attempt timeout, 3s backoff. Success on
/// any connect; failure is logged, not raised.
pub async fn verify_tcp_health(checker: &dyn HealthChecker, domain: &str, port: u16) {
    for attempt in 1..=10 {
        match checker.tcp_connect(domain, port, Duration::from_secs(3)).await {
            Ok(()) => return,
            Err(e) => {
                if attempt == 10 {
                    warn!("tcp health check for {}:{} gave up after 10 attempts: {}", domain, port, e);
                    return;
                }
                tokio::time::delay_for(Duration::from_secs(3)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedChecker {
        responses: Mutex<Vec<Result<u16, String>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthChecker for ScriptedChecker {
        async fn http_get(&self, _domain: &str, _port: u16, _path: &str, _timeout: Duration) -> Result<u16, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut r = self.responses.lock().unwrap();
            if r.is_empty() {
                Ok(200)
            } else {
                r.remove(0)
            }
        }

        async fn tcp_connect(&self, _domain: &str, _port: u16, _timeout: Duration) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn succeeds_after_five_404s_then_200() {
        let checker = ScriptedChecker {
            responses: Mutex::new(vec![
                Ok(404),
                Ok(404),
                Ok(404),
                Ok(404),
                Ok(404),
                Ok(200),
            ]),
            calls: AtomicUsize::new(0),
        };
        verify_http_health(&checker, "alpha.example", 80, None).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn strict_mode_requires_exactly_200() {
        let checker = ScriptedChecker {
            responses: Mutex::new(vec![Ok(204)]),
            calls: AtomicUsize::new(0),
        };
        let probe = Probe {
            path: Some("/healthz".to_string()),
            timeout_seconds: 1,
            ..Default::default()
        };
        // non-200 with a declared liveness probe never passes; exhausts all
        // attempts and returns without panicking (logged, not raised).
        verify_http_health(&checker, "alpha.example", 80, Some(&probe)).await;
        assert!(checker.calls.load(Ordering::SeqCst) >= 1);
    }
}
