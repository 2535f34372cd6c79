use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Collector, EventStream, StopSignal};
use crate::events::Event;
use crate::logging::{self, obj, v_str, Domain};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscribes to a WebSocket feed (e.g. `eth_subscribe` on a node) and emits
/// every JSON text frame as an event of `event_type`.
///
/// Object frames become the event payload as-is; anything else is wrapped as
/// `{"message": frame}`. Non-JSON and control frames are skipped.
pub struct WsCollector {
    name: String,
    url: String,
    subscribe: Option<Value>,
    event_type: String,
    socket: Mutex<Option<Socket>>,
    stop: StopSignal,
}

impl WsCollector {
    pub fn new(name: impl Into<String>, url: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            subscribe: None,
            event_type: event_type.into(),
            socket: Mutex::new(None),
            stop: StopSignal::new(),
        }
    }

    /// Message sent right after connecting.
    pub fn with_subscription(mut self, msg: Value) -> Self {
        self.subscribe = Some(msg);
        self
    }
}

fn frame_to_event(event_type: &str, text: &str) -> Option<Event> {
    let value: Value = serde_json::from_str(text).ok()?;
    let data = match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("message".to_string(), other);
            map
        }
    };
    Some(Event::new(event_type, data))
}

#[async_trait]
impl Collector for WsCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        let mut slot = self.socket.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let (mut ws, _) = timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", self.url))?
            .with_context(|| format!("connect to {}", self.url))?;
        if let Some(msg) = &self.subscribe {
            ws.send(Message::Text(msg.to_string())).await?;
        }
        logging::info(
            Domain::Collector,
            "collector.ws_connected",
            obj(&[("collector", v_str(&self.name)), ("url", v_str(&self.url))]),
        );
        *slot = Some(ws);
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        let ws = self
            .socket
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("collector {} is not connected", self.name))?;
        let name = self.name.clone();
        let event_type = self.event_type.clone();
        let frames = ws
            .take_while(move |msg| {
                let keep = match msg {
                    Ok(_) => true,
                    Err(e) => {
                        logging::log_failure(Domain::Collector, "collector.ws_error", &name, &e.to_string(), &[]);
                        false
                    }
                };
                futures_util::future::ready(keep)
            })
            .filter_map(move |msg| {
                let evt = match msg {
                    Ok(Message::Text(text)) => frame_to_event(&event_type, &text),
                    _ => None,
                };
                futures_util::future::ready(evt)
            });
        Ok(self.stop.guard(frames))
    }

    async fn stop(&self) {
        self.stop.stop();
        if let Some(mut ws) = self.socket.lock().await.take() {
            let _ = ws.close(None).await;
        }
    }
}
