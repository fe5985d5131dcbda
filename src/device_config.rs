//! Device Configuration Store Boundary
//!
//! Per-device profile counters are persisted by an external configuration
//! store. From this crate's perspective the store is write-only: the state
//! machine posts [`ConfigUpdate`]s as side effects of connection attempts
//! and never reads them back.

use crate::{CONFIG_CHANNEL, PeerAddress, Role};

/// One write-only update for the device configuration store
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ConfigUpdate {
    /// Record the profile role a device connects with
    ProfileRole {
        /// The device
        address: PeerAddress,
        /// The remote endpoint role
        endpoint_role: Role,
    },
    /// Count one connection attempt for a device
    ConnectionAttempt {
        /// The device
        address: PeerAddress,
    },
    /// Count one failed connection for a device
    ConnectionFailure {
        /// The device
        address: PeerAddress,
    },
}

/// Post an update to the device configuration store
pub(crate) fn update(update: ConfigUpdate) {
    if CONFIG_CHANNEL.try_send(update).is_err() {
        defmt::warn!("[CONFIG] update channel full, dropping {}", update);
    }
}

/// Receive the next device-configuration update.
///
/// Intended for the external configuration store's task.
pub async fn next_update() -> ConfigUpdate {
    CONFIG_CHANNEL.receive().await
}
