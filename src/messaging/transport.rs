use std::io::{BufRead, Write};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::{Error, Result};

/// Body field naming the topic of an event
pub const EVENT_TOPIC_FIELD: &str = "EventTopic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Request,
    Response,
    Event,
}

/// One line on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub content_type: ContentType,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Started,
    Disposed,
}

type BodyHandler = Arc<dyn Fn(Value) + Send + Sync>;
type ClosedHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    request: Vec<BodyHandler>,
    response: Vec<BodyHandler>,
    event: Vec<BodyHandler>,
    closed: Vec<ClosedHandler>,
}

/// Line-delimited JSON envelopes over any reader/writer pair.
///
/// A single reader thread dispatches frames inline, in arrival order.
pub struct MessageTransport {
    reader: Mutex<Option<Box<dyn BufRead + Send>>>,
    writer: Mutex<Box<dyn Write + Send>>,
    state: Mutex<TransportState>,
    subscribers: RwLock<Subscribers>,
}

impl MessageTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        Arc::new(Self {
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            state: Mutex::new(TransportState::Disconnected),
            subscribers: RwLock::new(Subscribers::default()),
        })
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn subscribe_request(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.subscribers.write().request.push(Arc::new(handler));
    }

    pub fn subscribe_response(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.subscribers.write().response.push(Arc::new(handler));
    }

    /// Handlers receive the whole event body, `EventTopic` included
    pub fn subscribe_event(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.subscribers.write().event.push(Arc::new(handler));
    }

    /// Fires once when the peer closes the stream before disposal
    pub fn on_closed(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.subscribers.write().closed.push(Arc::new(handler));
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TransportState::Disconnected => {}
            TransportState::Started => {
                return Err(Error::Messaging("transport already started".into()))
            }
            TransportState::Disposed => return Err(Error::Disposed("message transport".into())),
        }

        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| Error::Messaging("transport reader already consumed".into()))?;
        // The reader holds a weak reference so dropping the transport ends it
        let transport = Arc::downgrade(self);
        std::thread::Builder::new()
            .name("ironframe-transport".into())
            .spawn(move || read_loop(reader, transport))?;

        *state = TransportState::Started;
        Ok(())
    }

    pub fn publish_request(&self, request: &JsonRpcRequest) -> Result<()> {
        self.publish(ContentType::Request, serde_json::to_value(request)?)
    }

    pub fn publish_response(&self, response: &JsonRpcResponse) -> Result<()> {
        self.publish(ContentType::Response, serde_json::to_value(response)?)
    }

    /// Publish `event` under `topic`; the event must serialize to an object
    pub fn publish_event<T: Serialize>(&self, topic: &str, event: &T) -> Result<()> {
        let mut body = serde_json::to_value(event)?;
        let Value::Object(fields) = &mut body else {
            return Err(Error::Messaging(format!(
                "event for topic '{topic}' is not a JSON object"
            )));
        };
        fields.insert(EVENT_TOPIC_FIELD.to_string(), Value::String(topic.to_string()));
        self.publish(ContentType::Event, body)
    }

    fn publish(&self, content_type: ContentType, body: Value) -> Result<()> {
        if self.state() == TransportState::Disposed {
            return Err(Error::Disposed("message transport".into()));
        }
        let mut line = serde_json::to_string(&Envelope { content_type, body })?;
        line.push('\n');

        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Stop dispatching and close the outgoing stream. Idempotent.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if *state == TransportState::Disposed {
                return;
            }
            *state = TransportState::Disposed;
        }
        // Dropping the writer closes the pipe, which is the peer's cue to exit
        *self.writer.lock() = Box::new(std::io::sink());
        self.reader.lock().take();
        *self.subscribers.write() = Subscribers::default();
        tracing::debug!("message transport disposed");
    }

    fn dispatch(&self, envelope: Envelope) {
        let handlers = {
            let subscribers = self.subscribers.read();
            match envelope.content_type {
                ContentType::Request => subscribers.request.clone(),
                ContentType::Response => subscribers.response.clone(),
                ContentType::Event => subscribers.event.clone(),
            }
        };
        for handler in handlers {
            handler(envelope.body.clone());
        }
    }

    fn closed(&self) {
        if self.state() == TransportState::Disposed {
            return;
        }
        let handlers = self.subscribers.read().closed.clone();
        for handler in handlers {
            handler();
        }
    }
}

fn read_loop(mut reader: Box<dyn BufRead + Send>, transport: Weak<MessageTransport>) {
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "transport read failed");
                break;
            }
        }

        let text = String::from_utf8_lossy(&line);
        if text.trim().is_empty() {
            continue;
        }
        let Some(transport) = transport.upgrade() else {
            return;
        };
        if transport.state() == TransportState::Disposed {
            return;
        }
        match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => transport.dispatch(envelope),
            Err(e) => tracing::warn!(error = %e, "discarding malformed frame"),
        }
    }

    if let Some(transport) = transport.upgrade() {
        transport.closed();
    }
}
