//! WebSocket framing for the latency phase.
//!
//! The server sends `{"type":"probe","seq":N}` and the client bounces the
//! frame back, either unchanged or as `{"type":"echo","seq":N}`. The final
//! `{"type":"result",...}` frame is followed by a close.

use crate::error::{Result, SpeedTestError};
use crate::latency::{LatencyResult, ProbeTransport};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// One text frame of the latency exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeFrame {
    Probe { seq: u32 },
    Echo { seq: u32 },
    Result { result: LatencyResult },
}

impl ProbeFrame {
    /// Sequence number this frame answers, if it is an echo of a probe
    pub fn echoed_seq(&self) -> Option<u32> {
        match self {
            ProbeFrame::Probe { seq } | ProbeFrame::Echo { seq } => Some(*seq),
            ProbeFrame::Result { .. } => None,
        }
    }
}

/// Probe transport over an upgraded WebSocket
pub struct WsProbeTransport {
    socket: WebSocket,
}

impl WsProbeTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }

    async fn send_frame(&mut self, frame: &ProbeFrame) -> Result<()> {
        let text = serde_json::to_string(frame)
            .map_err(|e| SpeedTestError::Internal(format!("frame encoding failed: {}", e)))?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SpeedTestError::Transport(e.to_string()))
    }
}

#[async_trait]
impl ProbeTransport for WsProbeTransport {
    async fn round_trip(&mut self, seq: u32) -> Result<()> {
        self.send_frame(&ProbeFrame::Probe { seq }).await?;

        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ProbeFrame>(text.as_str()) {
                        Ok(frame) if frame.echoed_seq() == Some(seq) => return Ok(()),
                        Ok(frame) => trace!("Skipping stale frame {:?}", frame),
                        Err(e) => debug!("Ignoring malformed probe frame: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SpeedTestError::ClientCancelled);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SpeedTestError::Transport(e.to_string())),
            }
        }
    }

    async fn finish(&mut self, result: &LatencyResult) -> Result<()> {
        self.send_frame(&ProbeFrame::Result {
            result: result.clone(),
        })
        .await?;
        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| SpeedTestError::Transport(e.to_string()))
    }
}
