//! The seam between the connection manager and a concrete broker transport.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Instructions from the manager to an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCommand {
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    /// Close the link cleanly. The link ends after sending it.
    Disconnect,
}

/// What an open link reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Message { destination: String, body: String },
    /// The link failed. No further events follow.
    Fault(TransportError),
}

/// A connected, authenticated broker session.
///
/// Dropping the command sender or the event receiver tears the link down.
#[derive(Debug)]
pub struct BrokerLink {
    pub commands: mpsc::UnboundedSender<BrokerCommand>,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

impl BrokerLink {
    /// Both ends of an in-process link: the manager's half and the
    /// transport's half.
    pub fn pair() -> (BrokerLink, LinkEnd) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            BrokerLink {
                commands: cmd_tx,
                events: event_rx,
            },
            LinkEnd {
                commands: cmd_rx,
                events: event_tx,
            },
        )
    }
}

/// The transport side of a [`BrokerLink`].
#[derive(Debug)]
pub struct LinkEnd {
    pub commands: mpsc::UnboundedReceiver<BrokerCommand>,
    pub events: mpsc::UnboundedSender<BrokerEvent>,
}

/// Opens broker sessions.
///
/// `connect` performs the whole handshake, so a returned link is ready for
/// `SUBSCRIBE` commands. A credential the broker refuses must be reported
/// as [`TransportError::Unauthorized`] so the manager does not retry it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, access_token: &str) -> Result<BrokerLink, TransportError>;
}

#[async_trait]
impl<T> Connector for std::sync::Arc<T>
where
    T: Connector + ?Sized,
{
    async fn connect(&self, access_token: &str) -> Result<BrokerLink, TransportError> {
        (**self).connect(access_token).await
    }
}
