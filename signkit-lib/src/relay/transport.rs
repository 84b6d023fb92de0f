use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// What the transport reports back to the relayer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A raw text frame from the relay.
    Message(String),
    /// The connection is gone. No more events follow on this receiver.
    Closed,
}

/// Socket seam between the relayer and the relay server.
///
/// Implementations wrap a websocket (or anything frame-oriented). Each
/// successful `connect` returns a fresh receiver; the relayer reads frames
/// from it until it yields [`TransportEvent::Closed`] or ends.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open the connection.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Send one text frame. Fails with `Transport` when not connected.
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;
}
