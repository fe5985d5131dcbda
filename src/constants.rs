//! `Avlark` Constants
//!
//! This module contains all the constants used throughout the `Avlark` library.
//! These constants define table capacities, channel depths and the timing
//! parameters of the connection state machine.

use embassy_time::Duration;

/// Maximum number of peers per role registry (also the size of the peer-id
/// pool; one transport stream endpoint is registered per id)
pub const MAX_PEERS_PER_ROLE: usize = 8;

/// Default maximum number of simultaneously connected peers per role
pub const DEFAULT_MAX_CONNECTED_PEERS: usize = 1;

/// Depth of the home-context request channel
pub const HOME_CHANNEL_DEPTH: usize = 16;

/// Depth of the collaborator command channels (transport, audio pipeline)
pub const COMMAND_CHANNEL_DEPTH: usize = 16;

/// Depth of the client callback channel
pub const CALLBACK_CHANNEL_DEPTH: usize = 16;

/// Depth of the synchronous-request response channel
pub const RESPONSE_CHANNEL_DEPTH: usize = 4;

/// Depth of the remote-control forwarding channel
pub const RC_CHANNEL_DEPTH: usize = 8;

/// Depth of the device-configuration update channel
pub const CONFIG_CHANNEL_DEPTH: usize = 8;

/// Depth of the admission-queue advance channel
pub const QUEUE_CHANNEL_DEPTH: usize = 8;

/// Maximum opaque remote-control payload carried in an event envelope
pub const MAX_RC_PAYLOAD: usize = 64;

/// Maximum number of codec preference entries in one update
pub const MAX_CODEC_PREFERENCES: usize = 8;

/// Delay before a transport connection is auto-initiated after the peer
/// opened only the remote-control channel
pub const OPEN_FALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait applied to the synchronous client entry points
/// (set-active-peer, codec-config update); on expiry the caller proceeds
/// and the timeout is logged
pub const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// `BD_ADDR` length in bytes
pub const BD_ADDR_LENGTH: usize = 6;

/// AVRCP passthrough operation id for PLAY
pub const RC_OP_PLAY: u8 = 0x44;
