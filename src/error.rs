//! Failure taxonomy for remote operations.

use thiserror::Error;

/// Error codes the service reports that retrying can never fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
  Unauthorized,
  Forbidden,
  NotFound,
  InvalidRequest,
}

impl ErrorCode {
  /// Recognize a code string as returned in a service error body.
  pub fn parse(code: &str) -> Option<Self> {
    match code.to_lowercase().replace('_', "-").as_str() {
      "unauthorized" => Some(ErrorCode::Unauthorized),
      "forbidden" => Some(ErrorCode::Forbidden),
      "not-found" | "notfound" => Some(ErrorCode::NotFound),
      "invalid-request" => Some(ErrorCode::InvalidRequest),
      _ => None,
    }
  }
}

/// A failed attempt at a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
  #[error("service returned HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("service rejected request ({code:?}): {message}")]
  Code { code: ErrorCode, message: String },

  #[error("network error: {0}")]
  Network(String),

  #[error("operation timed out")]
  Timeout,

  #[error("invalid payload: {0}")]
  InvalidPayload(String),

  #[error("service is unreachable")]
  Offline,
}

impl OperationError {
  /// Permanent errors are never retried.
  ///
  /// 4xx statuses are permanent except 408 (request timeout) and 429 (rate limited).
  pub fn is_permanent(&self) -> bool {
    match self {
      OperationError::Http { status, .. } => {
        (400..500).contains(status) && *status != 408 && *status != 429
      }
      OperationError::Code { .. } | OperationError::InvalidPayload(_) => true,
      OperationError::Network(_) | OperationError::Timeout | OperationError::Offline => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn http(status: u16) -> OperationError {
    OperationError::Http {
      status,
      message: String::new(),
    }
  }

  #[test]
  fn test_client_errors_are_permanent() {
    assert!(http(400).is_permanent());
    assert!(http(401).is_permanent());
    assert!(http(404).is_permanent());
    assert!(http(499).is_permanent());
  }

  #[test]
  fn test_timeout_and_rate_limit_are_transient() {
    assert!(!http(408).is_permanent());
    assert!(!http(429).is_permanent());
  }

  #[test]
  fn test_server_and_network_errors_are_transient() {
    assert!(!http(500).is_permanent());
    assert!(!http(503).is_permanent());
    assert!(!OperationError::Network("connection refused".into()).is_permanent());
    assert!(!OperationError::Timeout.is_permanent());
  }

  #[test]
  fn test_error_codes() {
    assert_eq!(ErrorCode::parse("NOT_FOUND"), Some(ErrorCode::NotFound));
    assert_eq!(
      ErrorCode::parse("invalid-request"),
      Some(ErrorCode::InvalidRequest)
    );
    assert_eq!(ErrorCode::parse("overloaded"), None);

    let err = OperationError::Code {
      code: ErrorCode::Forbidden,
      message: "nope".into(),
    };
    assert!(err.is_permanent());
  }
}
