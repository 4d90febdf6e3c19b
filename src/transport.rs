//! Retrying HTTP execution
//!
//! The upstream blob server sits behind flaky links; blob operations
//! are content addressed so re-sending the same request is safe. This
//! wraps a `reqwest::Client` in a bounded retry loop: a transport error
//! or a 5xx response is retried with exponential backoff, a 4xx comes
//! back untouched, and a request whose body cannot be replayed gets
//! exactly one attempt.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{GateError, Result};

/// Backoff knobs. The total budget is additionally clamped to 0.9x of
/// whatever deadline the caller is operating under.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
    pub max_total_duration: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_attempts: 5,
            max_total_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct RetryClient {
    client: reqwest::Client,
    strategy: RetryStrategy,
}

impl RetryClient {
    pub fn new(client: reqwest::Client, strategy: RetryStrategy) -> Self {
        Self { client, strategy }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute `req`, retrying on transport errors and 5xx responses.
    ///
    /// `deadline` narrows the retry budget: the loop gets at most 0.9x
    /// of the time remaining until it. Running out of budget surfaces
    /// [`GateError::Cancelled`].
    pub async fn execute(
        &self,
        req: reqwest::Request,
        deadline: Option<Instant>,
    ) -> Result<reqwest::Response> {
        let mut budget = self.strategy.max_total_duration;
        if let Some(dl) = deadline {
            let remaining = dl.saturating_duration_since(Instant::now());
            budget = budget.min(remaining.mul_f64(0.9));
        }
        match tokio::time::timeout(budget, self.attempt_loop(req)).await {
            Ok(res) => res,
            Err(_) => Err(GateError::Cancelled),
        }
    }

    async fn attempt_loop(&self, req: reqwest::Request) -> Result<reqwest::Response> {
        // A streaming body has no clone hook; it gets one shot.
        if req.try_clone().is_none() {
            return Ok(self.client.execute(req).await?);
        }

        let url = req.url().clone();
        let mut delay = self.strategy.initial_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let this = match req.try_clone() {
                Some(r) => r,
                None => return Err(GateError::EmptyResponse),
            };
            match self.client.execute(this).await {
                Ok(resp) if resp.status().as_u16() < 500 => return Ok(resp),
                Ok(resp) => {
                    if attempt >= self.strategy.max_attempts {
                        return Ok(resp);
                    }
                    debug!(url = %url, status = resp.status().as_u16(), attempt, "retrying");
                }
                Err(e) => {
                    if attempt >= self.strategy.max_attempts {
                        return Err(e.into());
                    }
                    warn!(url = %url, error = %e, attempt, "retrying after transport error");
                }
            }
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(self.strategy.backoff_factor).min(self.strategy.max_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve fixed status responses, counting requests.
    async fn spawn_fixed_server(status_line: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let resp = format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        (format!("http://{addr}/"), hits)
    }

    fn fast_client(max_attempts: u32) -> RetryClient {
        RetryClient::new(
            reqwest::Client::new(),
            RetryStrategy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_factor: 2.0,
                max_attempts,
                max_total_duration: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn five_hundred_is_retried_up_to_max_attempts() {
        let (url, hits) = spawn_fixed_server("HTTP/1.1 500 Internal Server Error").await;
        let client = fast_client(3);
        let req = client.client().get(&url).build().unwrap();
        let resp = client.execute(req, None).await.unwrap();
        assert_eq!(resp.status().as_u16(), 500);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn four_hundred_is_not_retried() {
        let (url, hits) = spawn_fixed_server("HTTP/1.1 404 Not Found").await;
        let client = fast_client(3);
        let req = client.client().get(&url).build().unwrap();
        let resp = client.execute(req, None).await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_returns_immediately() {
        let (url, hits) = spawn_fixed_server("HTTP/1.1 200 OK").await;
        let client = fast_client(5);
        let req = client.client().get(&url).build().unwrap();
        let resp = client.execute(req, None).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_deadline_cancels() {
        let (url, _) = spawn_fixed_server("HTTP/1.1 500 Internal Server Error").await;
        let client = fast_client(100);
        let req = client.client().get(&url).build().unwrap();
        let deadline = Instant::now(); // already elapsed
        let err = client.execute(req, Some(deadline)).await.unwrap_err();
        assert!(matches!(err, GateError::Cancelled));
    }
}
