//! Remote-Control (AVRCP) Boundary
//!
//! The connection state machine routes remote-control notifications to the
//! correct peer but never interprets them; complete events are forwarded to
//! the external AVRCP signaling module through the remote-control channel.
//! The payload is an opaque, bounded, owned byte buffer so the originating
//! transport buffer can be released immediately after dispatch.

use crate::{AvError, PeerAddress, RC_CHANNEL, constants::MAX_RC_PAYLOAD};
use heapless::Vec;

/// Kind of a remote-control notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum RcEventKind {
    /// Remote-control channel opened
    Open,
    /// Remote-control channel closed
    Close,
    /// Browsing channel opened
    BrowseOpen,
    /// Browsing channel closed
    BrowseClose,
    /// Passthrough command from the remote, carrying the operation id
    RemoteCommand {
        /// AVRCP passthrough operation id
        op: u8,
    },
    /// Passthrough response from the remote
    RemoteResponse,
    /// Vendor-dependent command
    VendorCommand,
    /// Metadata message
    MetaMessage,
    /// Remote-control feature notification
    Features,
    /// Cover-art PSM notification
    CoverArtPsm,
}

/// One remote-control notification with its opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcEvent {
    kind: RcEventKind,
    payload: Vec<u8, MAX_RC_PAYLOAD>,
}

impl RcEvent {
    /// Create a remote-control event, copying the payload into owned storage
    ///
    /// # Errors
    /// Returns `AvError::InvalidParameter` if the payload exceeds
    /// `MAX_RC_PAYLOAD` bytes
    pub fn new(kind: RcEventKind, payload: &[u8]) -> Result<Self, AvError> {
        let payload = Vec::from_slice(payload).map_err(|()| AvError::InvalidParameter)?;
        Ok(Self { kind, payload })
    }

    /// The notification kind
    #[must_use]
    pub fn kind(&self) -> RcEventKind {
        self.kind
    }

    /// The opaque payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A remote-control event forwarded to the AVRCP signaling module together
/// with the peer it was resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcForward {
    /// The peer the event was routed to
    pub address: PeerAddress,
    /// The forwarded event
    pub event: RcEvent,
}

/// Forward a remote-control event to the AVRCP signaling module
pub(crate) fn forward(address: PeerAddress, event: &RcEvent) {
    if RC_CHANNEL
        .try_send(RcForward {
            address,
            event: event.clone(),
        })
        .is_err()
    {
        defmt::warn!("[RC] forward channel full, dropping {} event", event.kind());
    }
}

/// Receive the next forwarded remote-control event.
///
/// Intended for the external AVRCP signaling module's task.
pub async fn next_forwarded() -> RcForward {
    RC_CHANNEL.receive().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rc_event_owns_payload() {
        let data = [0x01, 0x02, 0x03];
        let event = RcEvent::new(RcEventKind::MetaMessage, &data).unwrap();
        let copy = event.clone();
        assert_eq!(copy, event);
        assert_eq!(copy.payload(), &data);
    }

    #[test]
    fn test_rc_event_payload_bound() {
        let oversized = [0u8; MAX_RC_PAYLOAD + 1];
        assert_eq!(
            RcEvent::new(RcEventKind::VendorCommand, &oversized),
            Err(AvError::InvalidParameter)
        );
    }

    #[test]
    fn test_rc_event_empty_payload_is_valid() {
        let event = RcEvent::new(RcEventKind::Close, &[]).unwrap();
        assert!(event.payload().is_empty());
    }
}
