//! WebSocket transport.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use offsync_common::{Error, Result};

use super::transport::{Transport, TransportConnection, TransportFrame};

/// Transport over `ws://` or `wss://` URLs.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn open(&self, url: &str) -> Result<TransportConnection> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("WebSocket connect to {} failed: {}", url, e)))?;
        debug!("WebSocket connected to {}", url);

        let (mut sink, mut stream) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (frames, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("WebSocket send failed: {}", e);
                    return;
                }
            }
            // Channel side hung up
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            loop {
                let frame = match stream.next().await {
                    Some(Ok(Message::Text(text))) => TransportFrame::Message(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => TransportFrame::Message(text),
                        Err(_) => {
                            warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => TransportFrame::Closed,
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => TransportFrame::Error(e.to_string()),
                };

                let terminal = !matches!(frame, TransportFrame::Message(_));
                if frames.send(frame).is_err() || terminal {
                    return;
                }
            }
        });

        Ok(TransportConnection { outgoing, incoming })
    }
}
