//! An in-memory transport double, useful for testing callers without a live
//! server. Mirrors the handler-closure shape of a JSON-RPC mock client: a
//! call is dispatched to a user-supplied function keyed on method name.

use crate::wire::Update;
use crate::Error;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

type MethodHandlerFn =
    Box<dyn Fn(&str, serde_json::Value) -> Result<serde_json::Value, Error> + Send + Sync>;

/// A mock transport that answers calls programmatically and can have updates
/// injected into it on demand.
pub struct MockTransport {
    handler: MethodHandlerFn,
    calls: Mutex<VecDeque<(String, serde_json::Value)>>,
    updates_tx: mpsc::UnboundedSender<Update>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<Update>>>,
}

impl MockTransport {
    /// Build a mock transport that answers every call via `handler`.
    pub fn from_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, serde_json::Value) -> Result<serde_json::Value, Error> + Send + Sync + 'static,
    {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(VecDeque::new()),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
        }
    }

    /// Issue a call, recording it for later assertion and routing it through
    /// the configured handler.
    pub async fn request(
        &self,
        method: impl Into<String>,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let method = method.into();
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push_back((method.clone(), input.clone()));
        (self.handler)(&method, input)
    }

    /// Push a server-originated update into this transport's update stream.
    pub fn push_update(&self, update: Update) {
        let _ = self.updates_tx.send(update);
    }

    /// Take ownership of the update stream, as [`crate::RpcTransport::take_updates`] does.
    pub fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<Update>> {
        self.updates_rx.lock().expect("updates mutex poisoned").take()
    }

    /// The `(method, input)` pairs recorded so far, oldest first.
    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().expect("calls mutex poisoned").iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_calls_and_answers_via_handler() {
        let mock = MockTransport::from_handler(|method, _input| {
            assert_eq!(method, "ping");
            Ok(json!({"pong": true}))
        });

        let result = mock.request("ping", json!({})).await.unwrap();
        assert_eq!(result, json!({"pong": true}));
        assert_eq!(mock.calls().len(), 1);
    }
}
