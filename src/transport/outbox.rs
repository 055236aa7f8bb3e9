//! Outbound packet channel
//!
//! Every connection owns one bounded channel. Sockets and room broadcasts push
//! packets into it without blocking; the connection task drains it into the
//! WebSocket sink.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::server::Packet;

/// Default capacity of a connection's outbound channel
pub const OUTBOX_CAPACITY: usize = 1024;

/// Errors raised by the transport when writing to a connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("outbound buffer full")]
    Backpressure,

    #[error("socket {0} is disconnected")]
    Disconnected(String),

    #[error("\"{0}\" is a reserved event name")]
    ReservedEvent(String),

    #[error("acknowledgements are not supported when broadcasting")]
    AckWhileBroadcasting,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Item carried by the outbound channel
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A packet to serialize and send
    Packet(Packet),
    /// Close the whole connection once everything before it was sent
    Close,
}

/// Sending half of a connection's outbound channel
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    /// Create an outbox and the receiver the connection task drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a packet for the connection.
    ///
    /// Volatile packets are dropped silently when the connection cannot take
    /// them right now.
    pub fn deliver(&self, packet: Packet, volatile: bool) -> TransportResult<()> {
        match self.tx.try_send(Outbound::Packet(packet)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) if volatile => {
                debug!("Outbound buffer full, dropping volatile packet");
                Ok(())
            }
            Err(TrySendError::Closed(_)) if volatile => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Ask the connection task to close the WebSocket
    pub fn close(&self) {
        if let Err(e) = self.tx.try_send(Outbound::Close) {
            warn!("Failed to queue close request: {}", e);
        }
    }

    /// Whether the connection task has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_queues_packet() {
        let (outbox, mut rx) = Outbox::channel(4);
        outbox.deliver(Packet::disconnect("/"), false).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Packet(Packet::disconnect("/"))
        );
    }

    #[test]
    fn test_full_outbox_rejects_regular_packets() {
        let (outbox, _rx) = Outbox::channel(1);
        outbox.deliver(Packet::disconnect("/"), false).unwrap();
        let result = outbox.deliver(Packet::disconnect("/"), false);
        assert!(matches!(result, Err(TransportError::Backpressure)));
    }

    #[test]
    fn test_full_outbox_drops_volatile_packets() {
        let (outbox, mut rx) = Outbox::channel(1);
        outbox.deliver(Packet::disconnect("/"), false).unwrap();
        assert!(outbox.deliver(Packet::disconnect("/chat"), true).is_ok());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_outbox() {
        let (outbox, rx) = Outbox::channel(4);
        drop(rx);
        assert!(outbox.is_closed());
        let result = outbox.deliver(Packet::disconnect("/"), false);
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
