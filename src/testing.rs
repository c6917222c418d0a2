//! Test doubles for the probe and executor seams.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

use crate::connectivity::Probe;
use crate::error::OperationError;
use crate::executor::Executor;
use crate::types::OperationKind;

/// Probe whose answer is set by the test.
pub struct StaticProbe {
  online: AtomicBool,
  hang: AtomicBool,
  calls: AtomicUsize,
}

impl StaticProbe {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
      hang: AtomicBool::new(false),
      calls: AtomicUsize::new(0),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Make the probe never complete.
  pub fn set_hang(&self, hang: bool) {
    self.hang.store(hang, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Probe for StaticProbe {
  fn probe(&self) -> BoxFuture<'_, bool> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let online = self.online.load(Ordering::SeqCst);
    let hang = self.hang.load(Ordering::SeqCst);
    Box::pin(async move {
      if hang {
        futures::future::pending::<()>().await;
      }
      online
    })
  }
}

/// Executor that replays scripted results, then echoes the payload.
///
/// While held, calls are recorded but their results wait for `release`.
pub struct ScriptedExecutor {
  script: Mutex<VecDeque<Result<Value, OperationError>>>,
  calls: Mutex<Vec<(OperationKind, Value)>>,
  open: watch::Sender<bool>,
}

impl ScriptedExecutor {
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      calls: Mutex::new(Vec::new()),
      open: watch::channel(true).0,
    }
  }

  pub fn hold(&self) {
    self.open.send_replace(false);
  }

  pub fn release(&self) {
    self.open.send_replace(true);
  }

  /// Queue results returned by the next calls, in order.
  pub fn push(&self, result: Result<Value, OperationError>) {
    self.script.lock().unwrap().push_back(result);
  }

  pub fn push_failures(&self, error: OperationError, times: usize) {
    for _ in 0..times {
      self.push(Err(error.clone()));
    }
  }

  pub fn calls(&self) -> Vec<(OperationKind, Value)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  fn run(&self, kind: OperationKind, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>> {
    self.calls.lock().unwrap().push((kind, payload.clone()));
    let scripted = self.script.lock().unwrap().pop_front();
    let result = scripted.unwrap_or_else(|| Ok(json!({ "echo": payload, "kind": kind.as_str() })));
    let mut open = self.open.subscribe();
    Box::pin(async move {
      let _ = open.wait_for(|open| *open).await;
      result
    })
  }
}

impl Executor for ScriptedExecutor {
  fn execute_completion(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>> {
    self.run(OperationKind::Completion, payload)
  }

  fn execute_analysis(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>> {
    self.run(OperationKind::Analysis, payload)
  }

  fn execute_generation(&self, payload: Value) -> BoxFuture<'_, Result<Value, OperationError>> {
    self.run(OperationKind::Generation, payload)
  }
}

pub fn server_error() -> OperationError {
  OperationError::Http {
    status: 503,
    message: "unavailable".to_string(),
  }
}

pub fn not_found() -> OperationError {
  OperationError::Http {
    status: 404,
    message: "no such thing".to_string(),
  }
}
