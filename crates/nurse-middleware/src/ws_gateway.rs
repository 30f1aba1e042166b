//! WebSocket gateway onto the [`SubjectBus`].
//!
//! Lets out-of-process producers, execution engines and dashboards speak the
//! bus protocol as JSON text frames:
//!
//! ```json
//! {"op":"pub","subject":"cio.intent.momentum","headers":{"traceparent":"00-…"},"payload":{…}}
//! {"op":"sub","subject":"signals.>"}
//! {"op":"unsub","subject":"signals.>"}
//! ```
//!
//! Matching bus traffic is pushed back as `{"op":"msg",…}` frames; protocol
//! problems come back as `{"op":"err","message":…}` and never close the socket.

use std::collections::HashMap;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info};

use crate::bus::{BusError, Headers, Message, SubjectBus};

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientFrame {
    Pub {
        subject: String,
        #[serde(default)]
        reply_to: Option<String>,
        #[serde(default)]
        headers: Headers,
        /// A JSON string is sent as its raw text; anything else is re-encoded.
        payload: Value,
    },
    Sub {
        subject: String,
    },
    Unsub {
        subject: String,
    },
}

impl ClientFrame {
    /// # Errors
    ///
    /// [`BusError::Transport`] when the text is not a recognised frame.
    pub fn parse(text: &str) -> Result<Self, BusError> {
        serde_json::from_str(text).map_err(|e| BusError::Transport(format!("bad frame: {e}")))
    }
}

/// Frames sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ServerFrame {
    Msg {
        subject: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        headers: Headers,
        payload: String,
    },
    Err {
        message: String,
    },
}

impl From<Message> for ServerFrame {
    fn from(message: Message) -> Self {
        ServerFrame::Msg {
            subject: message.subject,
            reply_to: message.reply_to,
            headers: message.headers,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        }
    }
}

/// Turn a `pub` frame's fields into a bus [`Message`].
fn to_bus_message(
    subject: String,
    reply_to: Option<String>,
    headers: Headers,
    payload: Value,
) -> Message {
    let bytes = match payload {
        Value::String(raw) => raw.into_bytes(),
        other => other.to_string().into_bytes(),
    };
    Message {
        subject,
        reply_to,
        headers,
        payload: bytes,
    }
}

/// Serves the bus protocol over WebSocket.
#[derive(Clone)]
pub struct BusGateway {
    bus: SubjectBus,
}

impl BusGateway {
    pub fn new(bus: SubjectBus) -> Self {
        Self { bus }
    }

    /// Accept clients on `addr` until a fatal bind error.
    ///
    /// # Errors
    ///
    /// [`BusError::Transport`] if the listener cannot be bound.
    pub async fn run(self, addr: SocketAddr) -> Result<(), BusError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BusError::Transport(format!("ws bind error on {addr}: {e}")))?;
        info!(%addr, "bus gateway listening");
        self.serve(listener).await
    }

    /// Accept clients on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), BusError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_client(stream, peer).await {
                            error!(%peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "ws accept error"),
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BusError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| BusError::Transport(format!("ws handshake from {peer}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Every subscription forwards into this one queue.
        let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(256);
        let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let json = serde_json::to_string(&frame)
                        .map_err(|e| BusError::Transport(e.to_string()))?;
                    if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Err(e) = self.apply(text.as_str(), &out_tx, &mut forwarders) {
                                let _ = out_tx.try_send(ServerFrame::Err { message: e.to_string() });
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        for (_, handle) in forwarders {
            handle.abort();
        }
        debug!(%peer, "ws client disconnected");
        Ok(())
    }

    /// Apply one client frame.
    fn apply(
        &self,
        text: &str,
        out_tx: &mpsc::Sender<ServerFrame>,
        forwarders: &mut HashMap<String, JoinHandle<()>>,
    ) -> Result<(), BusError> {
        match ClientFrame::parse(text)? {
            ClientFrame::Pub {
                subject,
                reply_to,
                headers,
                payload,
            } => {
                self.bus
                    .publish(to_bus_message(subject, reply_to, headers, payload))?;
            }
            ClientFrame::Sub { subject } => {
                if forwarders.contains_key(&subject) {
                    return Ok(());
                }
                let mut subscription = self.bus.subscribe(&subject)?;
                let out_tx = out_tx.clone();
                let handle = tokio::spawn(async move {
                    while let Some(message) = subscription.recv().await {
                        if out_tx.send(ServerFrame::from(message)).await.is_err() {
                            break;
                        }
                    }
                });
                forwarders.insert(subject, handle);
            }
            ClientFrame::Unsub { subject } => {
                if let Some(handle) = forwarders.remove(&subject) {
                    handle.abort();
                }
            }
        }
        Ok(())
    }
}
