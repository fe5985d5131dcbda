//! Transport Boundary
//!
//! The AVDTP transport/link manager is an external collaborator: the state
//! machine issues fire-and-forget [`TransportRequest`]s through a static
//! channel and reacts to the completion notifications the transport posts
//! back as event envelopes. The actual radio/link procedures live outside
//! this crate.

use crate::{PeerAddress, Role, TRANSPORT_CHANNEL};

/// Handle identifying one registered stream endpoint at the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, defmt::Format)]
pub struct TransportHandle(pub u8);

impl TransportHandle {
    /// Sentinel for a not-yet-resolved handle
    pub const UNKNOWN: TransportHandle = TransportHandle(0xFF);

    /// Whether this handle is the unknown sentinel
    #[must_use]
    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }
}

/// One request issued to the transport/link manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum TransportRequest {
    /// Open a transport connection to a peer
    Open {
        /// Peer to connect to
        address: PeerAddress,
        /// Stream endpoint handle to use
        handle: TransportHandle,
    },
    /// Close the transport connection
    Close {
        /// Stream endpoint handle
        handle: TransportHandle,
    },
    /// Start the stream
    Start {
        /// Stream endpoint handle
        handle: TransportHandle,
        /// Request low-latency mode
        use_latency_mode: bool,
    },
    /// Stop the stream
    Stop {
        /// Stream endpoint handle
        handle: TransportHandle,
        /// Stop via the suspend procedure
        suspend: bool,
    },
    /// Change the stream latency mode
    SetLatency {
        /// Stream endpoint handle
        handle: TransportHandle,
        /// Use low-latency mode
        low_latency: bool,
    },
    /// Change the codec operating mode
    SetCodecMode {
        /// Stream endpoint handle
        handle: TransportHandle,
        /// Opaque encoder mode
        mode: u8,
    },
    /// Hand the started stream to the offload data path
    OffloadStart {
        /// Stream endpoint handle
        handle: TransportHandle,
    },
    /// Bring up the remote-control channel for a connected peer
    RcOpen {
        /// Stream endpoint handle
        handle: TransportHandle,
    },
    /// Tear down the remote-control channel
    RcClose {
        /// Stream endpoint handle
        handle: TransportHandle,
    },
    /// Register one stream endpoint for a role; the transport answers with a
    /// `Registered` event carrying the assigned handle
    Register {
        /// Remote endpoint role the registration serves
        endpoint_role: Role,
        /// Peer id used as the registration's application id
        peer_id: u8,
    },
    /// Deregister a previously registered stream endpoint
    Deregister {
        /// Stream endpoint handle
        handle: TransportHandle,
    },
}

/// Post a request to the transport manager
pub(crate) fn request(request: TransportRequest) {
    if TRANSPORT_CHANNEL.try_send(request).is_err() {
        defmt::error!("[TRANSPORT] request channel full, dropping {}", request);
    }
}

/// Receive the next transport request.
///
/// Intended for the external transport manager's task.
pub async fn next_request() -> TransportRequest {
    TRANSPORT_CHANNEL.receive().await
}
