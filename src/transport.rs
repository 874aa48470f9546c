//! Transport and observability seams
//!
//! TCAP hands encoded messages to a point-to-point datagram transport
//! (SCCP connectionless service or an equivalent); address resolution and
//! link management live below this trait.

use crate::errors::{TcapError, TransportError};
use crate::messages::TcapMessage;
use crate::types::PeerAddress;
use async_trait::async_trait;

/// Datagram transport below the transaction layer
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer: &PeerAddress, data: &[u8]) -> Result<(), TransportError>;
}

/// Message direction as seen from this endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Observer invoked with every message and any associated error.
///
/// `message` is `None` when inbound bytes failed to decode. The hook is
/// for logging and metrics; dispatch correctness never depends on it.
pub trait TraceHook: Send + Sync {
    fn on_message(
        &self,
        direction: Direction,
        message: Option<&TcapMessage>,
        error: Option<&TcapError>,
    );
}
