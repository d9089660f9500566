//! Bounded retry with a total deadline
//!
//! [`request_with_retry`] wraps [`JsonRpcClient::request`] with an error
//! classifier, a retry budget, and one overall deadline. Retryable failures
//! (transport breakage, implementation-defined JSON-RPC errors,
//! authentication-like failures) are reissued with a fresh request ID, so
//! the server sees a new logical request each attempt. Non-retryable
//! failures propagate immediately, and deadline expiry always surfaces as
//! [`XzmcpError::Timeout`] no matter how much retry budget remains.
//!
//! The backoff between attempts is a constant 150 ms; the sleep is a plain
//! `tokio::time::sleep`, so dropping the future (caller cancellation)
//! always wins over a pending retry.

use std::time::Duration;

use crate::client::JsonRpcClient;
use crate::error::{is_retryable, Result, XzmcpError};

/// Retry and deadline configuration for one logical request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, counting the first.
    pub max_attempts: u32,
    /// Total wall-clock budget across all attempts and backoffs.
    pub deadline: Duration,
    /// Constant pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            deadline: Duration::from_secs(10),
            backoff: Duration::from_millis(150),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries; the deadline still applies.
    pub fn no_retry(deadline: Duration) -> Self {
        Self {
            max_attempts: 1,
            deadline,
            backoff: Duration::ZERO,
        }
    }
}

/// Issue `method` with retry and an overall deadline per `policy`.
///
/// # Errors
///
/// Propagates the final attempt's error: [`XzmcpError::Timeout`] when the
/// deadline passes, the last retryable error once attempts are exhausted,
/// or the first non-retryable error immediately.
pub async fn request_with_retry<P, R>(
    client: &JsonRpcClient,
    method: &str,
    params: P,
    policy: &RetryPolicy,
) -> Result<R>
where
    P: serde::Serialize + Send,
    R: serde::de::DeserializeOwned,
{
    let params = serde_json::to_value(params).map_err(XzmcpError::Serialization)?;
    let started = tokio::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let remaining = match policy.deadline.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => {
                return Err(XzmcpError::Timeout {
                    method: method.to_string(),
                }
                .into())
            }
        };

        match client
            .request::<_, R>(method, params.clone(), Some(remaining))
            .await
        {
            Ok(value) => return Ok(value),
            Err(err) => {
                // Timeout and cancellation classify as non-retryable, so
                // both tie-breaks fall out of this single check.
                if !is_retryable(&err) || attempt >= policy.max_attempts {
                    return Err(err);
                }

                // A backoff that cannot complete inside the deadline is a
                // timeout, not a retry.
                if started.elapsed() + policy.backoff >= policy.deadline {
                    return Err(XzmcpError::Timeout {
                        method: method.to_string(),
                    }
                    .into());
                }

                tracing::debug!(
                    "attempt {attempt}/{} for {method} failed retryably ({err}); backing off {:?}",
                    policy.max_attempts,
                    policy.backoff
                );
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{FakeTransport, FakeTransportHandle};
    use std::sync::Arc;

    fn wired_client() -> (JsonRpcClient, FakeTransportHandle) {
        let (transport, handle) = FakeTransport::opened();
        let client = JsonRpcClient::new(Arc::new(transport));
        client.start_read_loop();
        (client, handle)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            deadline: Duration::from_secs(5),
            backoff: Duration::from_millis(10),
        }
    }

    /// Responder that fails the first `failures` requests with `code` and
    /// then succeeds, collecting the observed request IDs.
    fn flaky_responder(
        mut handle: FakeTransportHandle,
        failures: usize,
        code: i64,
        message: &'static str,
    ) -> Arc<std::sync::Mutex<Vec<i64>>> {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(raw) = handle.outbound_rx.recv().await {
                let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
                let id = req["id"].clone();
                seen_clone.lock().unwrap().push(id.as_i64().unwrap());
                count += 1;
                if count <= failures {
                    handle.inject(serde_json::json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": { "code": code, "message": message },
                    }));
                } else {
                    handle.inject(serde_json::json!({
                        "jsonrpc": "2.0", "id": id, "result": { "ok": true },
                    }));
                }
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_retryable_error_is_reissued_with_fresh_id() {
        let (client, handle) = wired_client();
        let seen = flaky_responder(handle, 1, -32000, "transient overload");

        let result: serde_json::Value =
            request_with_retry(&client, "tools/call", serde_json::json!({}), &fast_policy())
                .await
                .unwrap();
        assert_eq!(result["ok"], true);

        let ids = seen.lock().unwrap().clone();
        assert_eq!(ids.len(), 2, "one failure plus one retry");
        assert_ne!(ids[0], ids[1], "each attempt must use a fresh ID");
    }

    #[tokio::test]
    async fn test_auth_like_failure_is_retried() {
        let (client, handle) = wired_client();
        let seen = flaky_responder(handle, 1, -32001, "401 unauthorized");

        let result: serde_json::Value =
            request_with_retry(&client, "tools/list", serde_json::json!({}), &fast_policy())
                .await
                .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates_immediately() {
        let (client, handle) = wired_client();
        let seen = flaky_responder(handle, 99, -32601, "Method not found");

        let result: Result<serde_json::Value> =
            request_with_retry(&client, "bogus/method", serde_json::json!({}), &fast_policy())
                .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<XzmcpError>(),
            Some(XzmcpError::Rpc { code: -32601, .. })
        ));
        assert_eq!(seen.lock().unwrap().len(), 1, "must not retry");
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_returns_last_error() {
        let (client, handle) = wired_client();
        let seen = flaky_responder(handle, 99, -32000, "still failing");

        let result: Result<serde_json::Value> =
            request_with_retry(&client, "tools/call", serde_json::json!({}), &fast_policy())
                .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<XzmcpError>(),
            Some(XzmcpError::Rpc { code: -32000, .. })
        ));
        assert_eq!(seen.lock().unwrap().len(), 3, "exactly max_attempts tries");
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_timeout_regardless_of_budget() {
        let (client, _handle) = wired_client();

        // No responder: the first attempt consumes the whole deadline.
        let policy = RetryPolicy {
            max_attempts: 5,
            deadline: Duration::from_millis(80),
            backoff: Duration::from_millis(10),
        };
        let result: Result<serde_json::Value> =
            request_with_retry(&client, "tools/call", serde_json::json!({}), &policy).await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<XzmcpError>(),
            Some(XzmcpError::Timeout { method }) if method == "tools/call"
        ));
    }

    #[tokio::test]
    async fn test_no_retry_policy_makes_one_attempt() {
        let (client, handle) = wired_client();
        let seen = flaky_responder(handle, 99, -32000, "transient");

        let result: Result<serde_json::Value> = request_with_retry(
            &client,
            "ping",
            serde_json::json!({}),
            &RetryPolicy::no_retry(Duration::from_secs(1)),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
