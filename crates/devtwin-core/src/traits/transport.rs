// # Transport Trait
//
// The core never owns a connection. The transport collaborator (an MQTT
// style client, a fieldbus gateway, a test double) moves bytes and reports
// whether the link is up; the core decides what to read, write and send.
//
// ## Usage
//
// ```rust,ignore
// use devtwin_core::Transport;
//
// let raw = transport.read("pump-7", &visitor).await?;
// transport.write("pump-7", &visitor, &payload).await?;
// transport.send("edge-a", &message).await?;
// ```

use async_trait::async_trait;
use std::pin::Pin;
use tokio::sync::watch;
use tokio_stream::Stream;

use crate::device::PropertyVisitor;

/// Bytes pushed by a device without being asked (the `OnReceive` path)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReport {
    /// Device that produced the report
    pub device_id: String,
    /// Property the payload belongs to
    pub property_name: String,
    /// Raw protocol bytes
    pub payload: Vec<u8>,
}

impl InboundReport {
    pub fn new(
        device_id: impl Into<String>,
        property_name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            property_name: property_name.into(),
            payload,
        }
    }
}

/// Stream of unsolicited device reports
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundReport> + Send + 'static>>;

/// Transport collaborator
///
/// # Thread Safety
///
/// Shared by every property task; all methods must be safe to call
/// concurrently.
///
/// # Errors
///
/// Connection-level failures must be reported as `Error::Transport`: the
/// calling task then pauses until [`Transport::liveness`] turns `true`
/// instead of burning its retry budget. A device that answers but rejects a
/// write should be reported as `Error::Encode`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a payload to a target (an edge node for sync messages)
    async fn send(&self, target_id: &str, payload: &[u8]) -> Result<(), crate::Error>;

    /// Read the raw bytes a visitor addresses on a device
    async fn read(&self, device_id: &str, visitor: &PropertyVisitor)
    -> Result<Vec<u8>, crate::Error>;

    /// Write raw bytes to the location a visitor addresses on a device
    async fn write(
        &self,
        device_id: &str,
        visitor: &PropertyVisitor,
        payload: &[u8],
    ) -> Result<(), crate::Error>;

    /// Unsolicited reports
    ///
    /// Called once when the reconciler starts running. Transports without
    /// push support keep the default, which never yields.
    fn reports(&self) -> InboundStream {
        Box::pin(tokio_stream::empty())
    }

    /// Link state: `true` while the transport can move bytes
    fn liveness(&self) -> watch::Receiver<bool>;
}
