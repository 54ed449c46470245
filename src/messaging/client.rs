use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use super::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RpcMethod};
use super::transport::{MessageTransport, EVENT_TOPIC_FIELD};
use crate::{Error, Result};

type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Request/response correlation and topic fan-out over a [`MessageTransport`]
pub struct MessagingClient {
    transport: Arc<MessageTransport>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    topics: RwLock<HashMap<String, Vec<EventCallback>>>,
    disposed: AtomicBool,
}

/// Removes the pending entry however the request future ends
struct PendingGuard<'a> {
    client: &'a MessagingClient,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.abandon(&self.id);
    }
}

impl MessagingClient {
    /// Attach to `transport`; the caller still starts it
    pub fn new(transport: Arc<MessageTransport>) -> Arc<Self> {
        let client = Arc::new(Self {
            transport: transport.clone(),
            pending: Mutex::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        });

        let weak: Weak<Self> = Arc::downgrade(&client);
        transport.subscribe_response(move |body| {
            if let Some(client) = weak.upgrade() {
                client.handle_response(body);
            }
        });
        let weak: Weak<Self> = Arc::downgrade(&client);
        transport.subscribe_event(move |body| {
            if let Some(client) = weak.upgrade() {
                client.handle_event(body);
            }
        });
        client
    }

    pub fn transport(&self) -> &Arc<MessageTransport> {
        &self.transport
    }

    /// Send a request and await its typed result.
    ///
    /// Callers race this against a timer; dropping the future abandons the
    /// request and any late response is discarded.
    pub async fn send_message<M: RpcMethod>(&self, params: &M::Params) -> Result<M::Result> {
        let request = JsonRpcRequest::for_method::<M>(params)?;
        let receiver = self.register(&request.id)?;
        let _guard = PendingGuard {
            client: self,
            id: request.id.clone(),
        };

        tracing::debug!(method = M::NAME, id = %request.id, "sending request");
        self.transport.publish_request(&request)?;

        let value = receiver.await.map_err(|_| Error::HostUnavailable)??;
        Ok(serde_json::from_value(value)?)
    }

    fn register(&self, id: &str) -> Result<oneshot::Receiver<Result<Value>>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::HostUnavailable);
        }
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(Error::Messaging(format!("request id '{id}' is already pending")));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Forget a pending request; returns whether it was still outstanding
    pub fn abandon(&self, id: &str) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver events published under `topic`, decoded as `T`
    pub fn subscribe<T, F>(&self, topic: &str, callback: F)
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let topic_name = topic.to_string();
        let callback: EventCallback = Arc::new(move |body| match serde_json::from_value(body) {
            Ok(event) => callback(event),
            Err(e) => tracing::error!(topic = %topic_name, error = %e, "failed to deliver event"),
        });
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(callback);
    }

    fn handle_response(&self, body: Value) {
        let response: JsonRpcResponse = match serde_json::from_value(body) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed response");
                return;
            }
        };
        let Some(sender) = self.pending.lock().remove(&response.id) else {
            tracing::debug!(id = %response.id, "discarding response with no pending request");
            return;
        };
        let _ = sender.send(response.into_result());
    }

    fn handle_event(&self, body: Value) {
        let Some(topic) = body.get(EVENT_TOPIC_FIELD).and_then(Value::as_str) else {
            tracing::warn!("discarding event without a topic");
            return;
        };
        let callbacks = self.topics.read().get(topic).cloned().unwrap_or_default();
        for callback in callbacks {
            callback(body.clone());
        }
    }

    /// Close the channel and fail every outstanding request. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.dispose();
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, sender) in pending {
            let _ = sender.send(Err(Error::HostUnavailable));
        }
        self.topics.write().clear();
    }
}
