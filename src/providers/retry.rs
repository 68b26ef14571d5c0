use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Exponential backoff for rate-limited or overloaded API calls.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: usize,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn should_retry(&self, attempt: usize, status: StatusCode, body: &str) -> bool {
        attempt < self.max_attempts && is_rate_limited(status, body)
    }

    /// Sleeps for `delay` (or the server's `retry-after` when longer) and
    /// returns the delay for the next attempt.
    pub(crate) async fn wait(
        &self,
        attempt: usize,
        delay: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let wait = retry_after.map_or(delay, |server| server.max(delay));
        warn!(
            "translator rate limited; retrying in {:.1}s (attempt {}/{})",
            wait.as_secs_f32(),
            attempt,
            self.max_attempts
        );
        sleep(wait).await;
        self.next_delay(delay)
    }

    pub(crate) fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .max(self.base_delay)
            .min(self.max_delay)
    }
}

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS || matches!(status.as_u16(), 503 | 529) {
        return true;
    }
    let lower = body.to_lowercase();
    ["rate limit", "rate_limit", "too many requests", "quota", "overloaded"]
        .iter()
        .any(|needle| lower.contains(needle))
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(policy.next_delay(Duration::from_secs(40)), Duration::from_secs(60));
        assert_eq!(policy.next_delay(Duration::ZERO), Duration::from_secs(2));
    }

    #[test]
    fn detects_rate_limits() {
        assert!(is_rate_limited(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(is_rate_limited(StatusCode::BAD_REQUEST, "You exceeded your quota"));
        assert!(!is_rate_limited(StatusCode::UNAUTHORIZED, "invalid api key"));
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(5, StatusCode::TOO_MANY_REQUESTS, ""));
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
