//! Retry classification and exponential backoff.
//!
//! Status-code match arms follow `call_api_with_retry`'s shape: 403 forces
//! a refresh, 429/5xx back off, other 4xx fail immediately.
//! `ValidationException` detection escalates through the context
//! compression ladder instead.

pub mod compression;

use std::time::Duration;

use crate::error::GatewayError;

/// What to do with a failed upstream attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Force a token refresh, then retry without spending a retry slot.
    RefreshAndRetry,
    /// Sleep `delay`, then retry, spending one retry slot.
    BackoffAndRetry { delay: Duration },
    /// Compress the message context one level further and retry.
    CompressAndRetry,
    /// Stop and surface this error to the client.
    Fail(GatewayError),
}

const BASE_DELAY_SECS: f64 = 1.0;
const MAX_COMPRESSION_LEVEL: u8 = 3;

/// One classification pass over an upstream HTTP response. `already_forced_refresh`
/// prevents a second unconditional 403-triggered refresh within the same
/// logical request (HTTP 403 triggers a token refresh once per request).
pub fn classify(
    status: u16,
    error_type_header: Option<&str>,
    body: &str,
    attempt: u32,
    compression_level: u8,
    already_forced_refresh: bool,
    base_delay_secs: f64,
) -> RetryDecision {
    if status == 403 && !already_forced_refresh {
        return RetryDecision::RefreshAndRetry;
    }

    if status == 429 || (500..600).contains(&status) {
        return RetryDecision::BackoffAndRetry {
            delay: exponential_backoff(attempt, base_delay_secs),
        };
    }

    if status == 400 && is_validation_exception(error_type_header, body) {
        if compression_level < MAX_COMPRESSION_LEVEL {
            return RetryDecision::CompressAndRetry;
        }
        return RetryDecision::Fail(GatewayError::context_too_large());
    }

    if (400..500).contains(&status) {
        return RetryDecision::Fail(classify_other_4xx(status, body));
    }

    RetryDecision::Fail(GatewayError::upstream(format!("unexpected upstream status {status}")).with_upstream_detail(body.to_string()))
}

fn classify_other_4xx(status: u16, body: &str) -> GatewayError {
    match status {
        401 => GatewayError::auth_expired(),
        403 => GatewayError::forbidden("upstream rejected credential after refresh"),
        404 => GatewayError::bad_request("model or resource not found"),
        _ => GatewayError::bad_request(format!("upstream returned {status}")),
    }
    .with_upstream_detail(body.to_string())
}

/// `base * 2^attempt`, capped so a misconfigured `base_delay_secs` or a long
/// retry run can't produce multi-minute sleeps.
pub fn exponential_backoff(attempt: u32, base_delay_secs: f64) -> Duration {
    let base = if base_delay_secs > 0.0 { base_delay_secs } else { BASE_DELAY_SECS };
    let secs = base * 2f64.powi(attempt.min(10) as i32);
    Duration::from_secs_f64(secs.min(60.0))
}

/// `x-amzn-errortype: ValidationException` or the literal substring in the
/// body.
fn is_validation_exception(error_type_header: Option<&str>, body: &str) -> bool {
    if let Some(header) = error_type_header {
        if header.contains("ValidationException") {
            return true;
        }
    }
    body.contains("ValidationException")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_403_forces_refresh_once() {
        let decision = classify(403, None, "", 0, 0, false, BASE_DELAY_SECS);
        assert_eq!(decision, RetryDecision::RefreshAndRetry);
    }

    #[test]
    fn status_403_after_forced_refresh_fails() {
        let decision = classify(403, None, "denied", 0, 0, true, BASE_DELAY_SECS);
        assert!(matches!(decision, RetryDecision::Fail(_)));
    }

    #[test]
    fn status_429_backs_off() {
        let decision = classify(429, None, "", 2, 0, false, BASE_DELAY_SECS);
        assert!(matches!(decision, RetryDecision::BackoffAndRetry { .. }));
    }

    #[test]
    fn status_5xx_backs_off() {
        let decision = classify(503, None, "", 0, 0, false, BASE_DELAY_SECS);
        assert!(matches!(decision, RetryDecision::BackoffAndRetry { .. }));
    }

    #[test]
    fn validation_exception_compresses_until_level_three() {
        let decision = classify(400, Some("ValidationException"), "", 0, 2, false, BASE_DELAY_SECS);
        assert_eq!(decision, RetryDecision::CompressAndRetry);

        let exhausted = classify(400, Some("ValidationException"), "", 0, 3, false, BASE_DELAY_SECS);
        assert!(matches!(exhausted, RetryDecision::Fail(_)));
    }

    #[test]
    fn validation_exception_detected_via_body_substring() {
        let decision = classify(400, None, "com.amazon.ValidationException: bad input", 0, 0, false, BASE_DELAY_SECS);
        assert_eq!(decision, RetryDecision::CompressAndRetry);
    }

    #[test]
    fn other_4xx_fails_immediately() {
        let decision = classify(404, None, "not found", 0, 0, false, BASE_DELAY_SECS);
        assert!(matches!(decision, RetryDecision::Fail(_)));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let d0 = exponential_backoff(0, 1.0);
        let d1 = exponential_backoff(1, 1.0);
        let d2 = exponential_backoff(2, 1.0);
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        let d = exponential_backoff(10, 5.0);
        assert_eq!(d, Duration::from_secs(60));
    }
}
