use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

/// Retry ceiling for transient provider failures
pub const MAX_ATTEMPTS: u32 = 3;

const BACKOFF_BASE_MS: u64 = 800;
const BACKOFF_CAP_MS: u64 = 8_000;

/// 429 and server errors are transient; everything else is final
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Capped exponential backoff: 800ms, 1.6s, 3.2s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// Send a request, retrying transient failures (connect/timeout errors,
/// 429, 5xx) with capped exponential backoff up to `max_attempts`. The
/// final response is returned even when its status is an error - the caller
/// inspects it. Validation-style failures (4xx other than 429) come back on
/// the first attempt without retry.
pub async fn send_with_retry(
    builder: RequestBuilder,
    max_attempts: u32,
) -> reqwest::Result<Response> {
    for attempt in 0..max_attempts.saturating_sub(1) {
        let Some(this_attempt) = builder.try_clone() else {
            break;
        };

        match this_attempt.send().await {
            Ok(resp) if !is_retryable_status(resp.status()) => return Ok(resp),
            Ok(resp) => {
                warn!(
                    "Transient provider status {} (attempt {}/{})",
                    resp.status(),
                    attempt + 1,
                    max_attempts
                );
            }
            Err(err) if err.is_connect() || err.is_timeout() => {
                warn!(
                    "Transient transport error (attempt {}/{}): {}",
                    attempt + 1,
                    max_attempts,
                    err
                );
            }
            Err(err) => return Err(err),
        }

        tokio::time::sleep(backoff_delay(attempt)).await;
    }

    builder.send().await
}

/// Parse a provider response body as JSON, falling back to a wrapper around
/// the raw text so the audit log always captures something
pub async fn safe_json(resp: Response) -> serde_json::Value {
    let status = resp.status().as_u16();
    match resp.text().await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|_| {
            serde_json::json!({ "status": false, "http_status": status, "raw_text": text })
        }),
        Err(_) => serde_json::json!({ "status": false, "raw_text": "<unreadable>" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::OK));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(800));
        assert_eq!(backoff_delay(1), Duration::from_millis(1_600));
        assert_eq!(backoff_delay(2), Duration::from_millis(3_200));
        // capped
        assert_eq!(backoff_delay(10), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(30), Duration::from_millis(8_000));
    }
}
