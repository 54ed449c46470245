use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::jsonrpc::{error_codes, JsonRpcRequest, JsonRpcResponse, RpcMethod};
use crate::Result;

type Handler = Arc<dyn Fn(Value) -> HandlerOutcome + Send + Sync>;

enum HandlerOutcome {
    Ok(Value),
    InvalidParams(String),
    Failed(String),
}

/// Routes requests to typed handlers; method names match case-insensitively
#[derive(Default)]
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M, F>(&self, handler: F)
    where
        M: RpcMethod,
        F: Fn(M::Params) -> Result<M::Result> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |params| {
            let params: M::Params = match serde_json::from_value(params) {
                Ok(params) => params,
                Err(e) => return HandlerOutcome::InvalidParams(e.to_string()),
            };
            match handler(params).and_then(|result| Ok(serde_json::to_value(result)?)) {
                Ok(value) => HandlerOutcome::Ok(value),
                Err(e) => HandlerOutcome::Failed(e.to_string()),
            }
        });
        self.handlers
            .write()
            .insert(M::NAME.to_ascii_lowercase(), handler);
    }

    /// Handle one request body and build the response to send back
    pub fn dispatch(&self, body: Value) -> JsonRpcResponse {
        let id = body
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();

        let request: JsonRpcRequest = match serde_json::from_value(body) {
            Ok(request) => request,
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("Invalid request: {e}"),
                )
            }
        };

        let handler = self
            .handlers
            .read()
            .get(&request.method.to_ascii_lowercase())
            .cloned();
        let Some(handler) = handler else {
            return JsonRpcResponse::error(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            );
        };

        match handler(request.params) {
            HandlerOutcome::Ok(result) => JsonRpcResponse::result(request.id, result),
            HandlerOutcome::InvalidParams(message) => JsonRpcResponse::error(
                request.id,
                error_codes::INVALID_PARAMS,
                format!("Invalid params: {message}"),
            ),
            HandlerOutcome::Failed(message) => {
                tracing::debug!(method = %request.method, error = %message, "request failed");
                JsonRpcResponse::error(request.id, error_codes::INTERNAL_ERROR, message)
            }
        }
    }
}
