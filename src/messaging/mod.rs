//! JSON-RPC messaging between a container and its host process
//!
//! Frames are JSON envelopes, one per line, over a pair of byte streams
//! (the host's stdin and stdout in production).

mod client;
mod dispatcher;
pub mod jsonrpc;
mod transport;

pub use client::MessagingClient;
pub use dispatcher::MessageDispatcher;
pub use jsonrpc::{JsonRpcRequest, JsonRpcResponse, RpcMethod};
pub use transport::{ContentType, Envelope, MessageTransport, TransportState, EVENT_TOPIC_FIELD};
