//! Client Callback Surface
//!
//! State changes are reported to the client through a static channel of
//! [`AvCallback`] values instead of role-scoped callback tables. The client
//! consumes them on its own context.

use crate::codec::AudioConfig;
use crate::event::TransportStatus;
use crate::{CALLBACK_CHANNEL, PeerAddress, Role};

/// Connection state reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ConnectionState {
    /// No transport connection
    Disconnected,
    /// Transport connection being established
    Connecting,
    /// Transport connection established
    Connected,
    /// Transport connection being torn down
    Disconnecting,
}

/// Audio stream state reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum AudioState {
    /// Stream not flowing
    Stopped,
    /// Stream flowing
    Started,
    /// Stream suspended by the remote
    RemoteSuspend,
}

/// Overall status attached to a connection state report
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum AvStatus {
    /// Operation succeeded
    Success,
    /// Operation failed
    Fail,
    /// Operation failed for lack of resources (admission rejected)
    NoResources,
    /// Operation rejected by the remote
    AuthRejected,
}

/// One notification for the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum AvCallback {
    /// The connection state of a peer changed
    ConnectionState {
        /// Local role serving the peer
        role: Role,
        /// The peer
        address: PeerAddress,
        /// New connection state
        state: ConnectionState,
        /// Overall status of the change
        status: AvStatus,
        /// Transport-level error code for failures
        error: TransportStatus,
    },
    /// The audio stream state of a peer changed
    AudioState {
        /// Local role serving the peer
        role: Role,
        /// The peer
        address: PeerAddress,
        /// New audio state
        state: AudioState,
    },
    /// The decoded audio configuration of a remote source peer changed
    AudioConfig {
        /// Local role serving the peer
        role: Role,
        /// The peer
        address: PeerAddress,
        /// Decoded stream configuration
        config: AudioConfig,
    },
}

/// Report a connection state change to the client
pub(crate) fn report_connection_state(
    role: Role,
    address: PeerAddress,
    state: ConnectionState,
    status: AvStatus,
    error: TransportStatus,
) {
    defmt::info!(
        "[CALLBACK] peer {} connection state {} status {}",
        address,
        state,
        status
    );
    deliver(AvCallback::ConnectionState {
        role,
        address,
        state,
        status,
        error,
    });
}

/// Report an audio stream state change to the client
pub(crate) fn report_audio_state(role: Role, address: PeerAddress, state: AudioState) {
    defmt::info!("[CALLBACK] peer {} audio state {}", address, state);
    deliver(AvCallback::AudioState {
        role,
        address,
        state,
    });
}

/// Report a decoded audio configuration to the client
pub(crate) fn report_audio_config(role: Role, address: PeerAddress, config: AudioConfig) {
    deliver(AvCallback::AudioConfig {
        role,
        address,
        config,
    });
}

fn deliver(callback: AvCallback) {
    if CALLBACK_CHANNEL.try_send(callback).is_err() {
        defmt::warn!("[CALLBACK] channel full, dropping notification");
    }
}

/// Receive the next client notification.
///
/// Intended for the client's callback-dispatch task.
pub async fn next_callback() -> AvCallback {
    CALLBACK_CHANNEL.receive().await
}
