//! A networked controller: one named endpoint owning one protocol/channel pair.

use crate::error::Result;
use crate::protocol::{BinaryBlock, CommandProtocol, ProtocolMode, ProtocolSettings, Reply};
use crate::transport::{AsyncFrame, Endpoint, TransportChannel};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Controller hosting a set of axes.
///
/// Controllers are compared by identity (`Arc::ptr_eq`): every command for
/// one controller goes through the same channel.
#[derive(Debug)]
pub struct Controller {
    name: String,
    protocol: CommandProtocol,
}

impl Controller {
    /// Connect to `endpoint` and wrap the channel in a protocol instance.
    pub async fn connect(name: &str, endpoint: &Endpoint, settings: ProtocolSettings) -> Result<Arc<Self>> {
        let channel = TransportChannel::connect(endpoint).await?;
        info!(controller = name, host = %endpoint.host, port = endpoint.port, mode = ?settings.mode, "controller connected");
        Ok(Arc::new(Self::from_protocol(name, CommandProtocol::new(channel, settings))))
    }

    /// Wrap an existing protocol instance.
    pub fn from_protocol(name: &str, protocol: CommandProtocol) -> Self {
        Self {
            name: name.to_string(),
            protocol,
        }
    }

    /// Configuration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hostname used in diagnostics.
    pub fn host(&self) -> &str {
        self.protocol.host()
    }

    /// Wire dialect.
    pub fn mode(&self) -> ProtocolMode {
        self.protocol.mode()
    }

    /// Underlying protocol.
    pub fn protocol(&self) -> &CommandProtocol {
        &self.protocol
    }

    /// See [`CommandProtocol::command`].
    pub async fn command(&self, text: &str, payload: Option<&BinaryBlock>) -> Result<Reply> {
        self.protocol.command(text, payload).await
    }

    /// See [`CommandProtocol::ackcommand`].
    pub async fn ackcommand(&self, text: &str, payload: Option<&BinaryBlock>) -> Result<Reply> {
        self.protocol.ackcommand(text, payload).await
    }

    /// Acknowledged command returning its ASCII answer.
    pub async fn ack_text(&self, text: &str) -> Result<String> {
        Ok(self.protocol.ackcommand(text, None).await?.into_text())
    }

    /// See [`CommandProtocol::is_alive`].
    pub async fn is_alive(&self) -> Result<bool> {
        self.protocol.is_alive().await
    }

    /// Subscribe to async frames pushed by this controller.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<AsyncFrame> {
        self.protocol.subscribe_frames()
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.protocol.close().await;
    }
}

/// Controller whose peer end is already gone; enough for tests that never talk to it.
#[cfg(test)]
pub(crate) fn offline(host: &str) -> Arc<Controller> {
    let (_peer, stream) = tokio::io::duplex(64);
    let channel = TransportChannel::from_stream(host, stream);
    Arc::new(Controller::from_protocol(
        host,
        CommandProtocol::new(channel, ProtocolSettings::default()),
    ))
}
