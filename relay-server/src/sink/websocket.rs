//! WebSocket delivery: one short-lived connection per payload.

use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use super::{DeliveryError, DeliverySink};
use crate::relay::Envelope;

/// Delivers each envelope as a single JSON text frame.
///
/// Opens a fresh connection per delivery and closes it afterwards, so a
/// restarted endpoint is picked up on the next attempt without any
/// reconnect bookkeeping.
#[derive(Debug, Clone)]
pub struct WebSocketSink {
    url: String,
    probe_timeout: Duration,
}

impl WebSocketSink {
    pub fn new(url: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            probe_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DeliverySink for WebSocketSink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let body = serde_json::to_string(envelope)?;

        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| DeliveryError::Connect(e.to_string()))?;

        stream
            .send(Message::text(body.clone()))
            .await
            .map_err(|e| DeliveryError::Send(e.to_string()))?;

        // The frame is already written; a failed close handshake is not a failed delivery.
        if let Err(e) = stream.close(None).await {
            debug!(error = %e, "websocket_close_failed");
        }

        let summary = envelope.summary();
        info!(
            sender = %summary.sender,
            preview = %summary.preview,
            body_length = body.len(),
            "websocket_delivered"
        );

        Ok(())
    }

    async fn probe(&self) -> bool {
        match timeout(self.probe_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((mut stream, _))) => {
                let _ = stream.close(None).await;
                true
            }
            Ok(Err(e)) => {
                debug!(url = %self.url, error = %e, "websocket_probe_failed");
                false
            }
            Err(_) => {
                debug!(url = %self.url, "websocket_probe_timeout");
                false
            }
        }
    }
}
