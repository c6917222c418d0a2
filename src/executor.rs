//! Boundary to the remote service that actually performs operations.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{ErrorCode, OperationError};
use crate::types::OperationKind;

/// Performs operations against the remote service.
///
/// Supplied by the caller at construction so tests can swap in a double.
pub trait Executor: Send + Sync {
  fn execute_completion(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>>;

  fn execute_analysis(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>>;

  fn execute_generation(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>>;

  /// Dispatch on `kind`.
  fn execute(
    &self,
    kind: OperationKind,
    payload: Value,
  ) -> BoxFuture<'_, Result<Value, OperationError>> {
    match kind {
      OperationKind::Completion => self.execute_completion(payload),
      OperationKind::Analysis => self.execute_analysis(payload),
      OperationKind::Generation => self.execute_generation(payload),
    }
  }
}

/// Error body the service returns alongside a failing status.
#[derive(Debug, Deserialize)]
struct ErrorBody {
  code: Option<String>,
  message: Option<String>,
}

/// Executor that POSTs the JSON payload to `<base_url>/<kind>`.
#[derive(Clone)]
pub struct HttpExecutor {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpExecutor {
  pub fn new(base_url: Url, timeout: Duration, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create executor client: {}", e))?;

    // Url::join drops the last path segment unless the base ends with '/'
    let base_url = if base_url.path().ends_with('/') {
      base_url
    } else {
      let mut url = base_url;
      let path = format!("{}/", url.path());
      url.set_path(&path);
      url
    };

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn endpoint(&self, kind: OperationKind) -> Result<Url, OperationError> {
    self
      .base_url
      .join(kind.as_str())
      .map_err(|e| OperationError::InvalidPayload(format!("bad endpoint: {}", e)))
  }

  async fn post(&self, kind: OperationKind, payload: Value) -> Result<Value, OperationError> {
    let url = self.endpoint(kind)?;
    debug!(%url, "executing remote operation");

    let mut request = self.client.post(url).json(&payload);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();

    if status.is_success() {
      return response
        .json::<Value>()
        .await
        .map_err(|e| OperationError::Network(format!("unreadable response body: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status.as_u16(), &body))
  }
}

fn classify_transport(e: reqwest::Error) -> OperationError {
  if e.is_timeout() {
    OperationError::Timeout
  } else {
    OperationError::Network(e.to_string())
  }
}

/// Turn a non-success response into an error, preferring a recognized error code.
fn classify_failure(status: u16, body: &str) -> OperationError {
  let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
  let message = parsed
    .as_ref()
    .and_then(|b| b.message.clone())
    .unwrap_or_else(|| body.trim().to_string());

  match parsed
    .and_then(|b| b.code)
    .and_then(|code| ErrorCode::parse(&code))
  {
    Some(code) => OperationError::Code { code, message },
    None => OperationError::Http { status, message },
  }
}

impl Executor for HttpExecutor {
  fn execute_completion(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>> {
    Box::pin(self.post(OperationKind::Completion, payload))
  }

  fn execute_analysis(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>> {
    Box::pin(self.post(OperationKind::Analysis, payload))
  }

  fn execute_generation(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>> {
    Box::pin(self.post(OperationKind::Generation, payload))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_keeps_base_path() {
    let executor = HttpExecutor::new(
      Url::parse("http://localhost:8080/api/v1").unwrap(),
      Duration::from_secs(1),
      None,
    )
    .unwrap();

    assert_eq!(
      executor.endpoint(OperationKind::Analysis).unwrap().as_str(),
      "http://localhost:8080/api/v1/analysis"
    );
  }

  #[test]
  fn test_failure_with_known_code() {
    let err = classify_failure(400, r#"{"code": "invalid_request", "message": "missing prompt"}"#);
    assert_eq!(
      err,
      OperationError::Code {
        code: ErrorCode::InvalidRequest,
        message: "missing prompt".to_string()
      }
    );
  }

  #[test]
  fn test_failure_without_code_keeps_status() {
    let err = classify_failure(503, "upstream overloaded\n");
    assert_eq!(
      err,
      OperationError::Http {
        status: 503,
        message: "upstream overloaded".to_string()
      }
    );
    assert!(!err.is_permanent());
  }
}
