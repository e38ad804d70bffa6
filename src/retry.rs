//! Support utilities for [`keen_retry`]'s retry API.

use async_openai::error::OpenAIError;
use keen_retry::RetryResult;
use reqwest::StatusCode;

/// Macro which implements `?`-like behavior for [`RetryResult`].
macro_rules! try_with_retry_result {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient {
                    input,
                    error: From::from(error),
                };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal {
                    input,
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use try_with_retry_result;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Convert a [`Result`] into a [`RetryResult`].
pub(crate) trait IntoRetryResult<T, E> {
    /// Treat any error as fatal.
    fn into_fatal(self) -> RetryResult<(), (), T, E>;

    /// Treat any error as transient.
    fn into_transient(self) -> RetryResult<(), (), T, E>;

    /// Ask `is_transient` about each error.
    fn into_retry_result(self, is_transient: impl Fn(&E) -> bool) -> RetryResult<(), (), T, E>;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E> {
    fn into_fatal(self) -> RetryResult<(), (), T, E> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) => retry_result_fatal(error),
        }
    }

    fn into_transient(self) -> RetryResult<(), (), T, E> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) => retry_result_transient(error),
        }
    }

    fn into_retry_result(self, is_transient: impl Fn(&E) -> bool) -> RetryResult<(), (), T, E> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) if is_transient(&error) => retry_result_transient(error),
            Err(error) => retry_result_fatal(error),
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. Unfortunately,
            // there are a lot of things that can go wrong, and `reqwest` doesn't
            // expose most of them in sufficient detail to be certain which are
            // transient.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::ApiError(err) => {
                let kind = err.r#type.as_deref().unwrap_or_default();
                let code = err.code.as_deref().unwrap_or_default();
                kind == "server_error" || code == "rate_limit_exceeded"
            }
            // Gateways occasionally return truncated bodies.
            OpenAIError::JSONDeserialize(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
    }

    #[test]
    fn test_into_retry_result() {
        let ok: Result<u8, &str> = Ok(1);
        assert!(matches!(ok.into_fatal(), RetryResult::Ok { output: 1, .. }));
        let err: Result<u8, &str> = Err("busy");
        assert!(matches!(
            err.into_retry_result(|e| *e == "busy"),
            RetryResult::Transient { .. }
        ));
        let err: Result<u8, &str> = Err("bad key");
        assert!(matches!(
            err.into_retry_result(|e| *e == "busy"),
            RetryResult::Fatal { .. }
        ));
    }
}
