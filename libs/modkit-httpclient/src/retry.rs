use crate::error::HttpClientError;
use crate::request::{RequestArgs, RetryPredicate};
use crate::response::HttpResponse;
use std::future::Future;
use std::time::Duration;

/// Retry settings of one call
#[derive(Clone, Default)]
pub struct RetryPolicy {
    /// Extra attempts allowed after the first
    pub retry: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Outcome predicate; when unset, errors and 5xx responses are retried
    pub is_retry: Option<RetryPredicate>,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_args(args: &RequestArgs) -> Self {
        Self {
            retry: args.retry,
            retry_delay: args.retry_delay,
            is_retry: args.is_retry.clone(),
        }
    }

    fn should_retry(&self, outcome: &Result<HttpResponse, HttpClientError>) -> bool {
        match &self.is_retry {
            Some(predicate) => predicate(outcome),
            None => match outcome {
                Ok(resp) => resp.status().is_server_error(),
                Err(_) => true,
            },
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("is_retry", &self.is_retry.is_some())
            .finish()
    }
}

/// Run `attempt` until it yields an outcome the policy accepts.
///
/// The first attempt always runs. Another one follows only while retry
/// budget remains and the predicate asks for it; the last outcome is
/// returned unchanged. `attempt` receives the zero-based attempt number.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<HttpResponse, HttpClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<HttpResponse, HttpClientError>>,
{
    let mut attempt_no: u32 = 0;
    loop {
        let outcome = attempt(attempt_no).await;

        if attempt_no >= policy.retry || !policy.should_retry(&outcome) {
            return outcome.map(|mut resp| {
                resp.retries = attempt_no;
                resp
            });
        }

        match &outcome {
            Ok(resp) => tracing::debug!(
                retry = attempt_no + 1,
                max_retries = policy.retry,
                status = resp.status().as_u16(),
                delay_ms = policy.retry_delay.as_millis(),
                "Retrying request after status code"
            ),
            Err(err) => tracing::debug!(
                retry = attempt_no + 1,
                max_retries = policy.retry,
                error = %err,
                delay_ms = policy.retry_delay.as_millis(),
                "Retrying request after error"
            ),
        }

        // the rejected outcome is dropped before the pause so its body can be released
        drop(outcome);
        if !policy.retry_delay.is_zero() {
            tokio::time::sleep(policy.retry_delay).await;
        }
        attempt_no += 1;
    }
}
