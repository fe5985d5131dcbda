//! `Avlark` API Functions
//!
//! This module provides the public client entry points. They never touch
//! peer or registry state directly: each call constructs a request and
//! marshals it onto the home context through the static channels, so all
//! mutation stays on the single serialized execution context.
//!
//! The two synchronous entry points ([`set_active_peer`] and
//! [`update_codec_config`]) post their request and then block on the
//! response channel with a bounded timeout; on expiry they log and proceed
//! rather than deadlock the caller.
//!
//! # Usage
//!
//! ```rust,no_run
//! use avlark::{api, AvInitOptions, PeerAddress, Role};
//!
//! # async fn example() -> Result<(), avlark::AvError> {
//! api::init(Role::Source, AvInitOptions::default()).await?;
//! let addr = PeerAddress::from_hex("AA:BB:CC:DD:EE:FF")?;
//! api::connect(Role::Source, addr).await?;
//! api::set_active_peer(Role::Source, addr).await?;
//! # Ok(())
//! # }
//! ```

use crate::constants::SYNC_REQUEST_TIMEOUT;
use crate::codec::CodecPreferences;
use crate::event::{AvEvent, HomeRequest, HomeResponse, StartStreamParams};
use crate::transport::TransportHandle;
use crate::{AvError, AvInitOptions, HOME_CHANNEL, PeerAddress, RESPONSE_CHANNEL, Role, av_context};
use embassy_time::with_timeout;

pub use crate::callback::next_callback;

async fn post(request: HomeRequest) {
    HOME_CHANNEL.send(request).await;
}

async fn post_event(endpoint_role: Option<Role>, address: PeerAddress, event: AvEvent) {
    post(HomeRequest::Event {
        endpoint_role,
        address,
        handle: TransportHandle::UNKNOWN,
        event,
    })
    .await;
}

async fn ensure_enabled(role: Role) -> Result<(), AvError> {
    let ctx = av_context().await?;
    if ctx.registry(role).enabled() {
        Ok(())
    } else {
        defmt::warn!("[API] {} role is not enabled", role);
        Err(AvError::NotEnabled)
    }
}

/// Enable one profile role. Idempotent: enabling an enabled role succeeds
/// without side effects.
///
/// # Errors
/// Returns `AvError::NotInitialized` if the global context does not exist.
pub async fn init(role: Role, options: AvInitOptions) -> Result<(), AvError> {
    let mut ctx = av_context().await?;
    ctx.init_role(role, options);
    Ok(())
}

/// Disable one profile role, releasing its active peer and draining all of
/// its peers. The teardown runs on the home context.
pub async fn cleanup(role: Role) {
    post(HomeRequest::Cleanup { role }).await;
}

/// Request a connection to a peer.
///
/// Connect requests are expected to arrive through the external serialized
/// admission queue (one in-flight connect per role); the state machine posts
/// one [`crate::queue`] advance token per self-initiated attempt outcome.
///
/// # Errors
/// Returns an error if the context is not initialized or the role is not
/// enabled.
pub async fn connect(role: Role, address: PeerAddress) -> Result<(), AvError> {
    defmt::debug!("[API] connect {} peer {}", role, address);
    ensure_enabled(role).await?;
    post_event(Some(role.opposite()), address, AvEvent::ConnectRequest).await;
    Ok(())
}

/// Request disconnection from a peer.
///
/// # Errors
/// Returns an error if the context is not initialized or the role is not
/// enabled.
pub async fn disconnect(role: Role, address: PeerAddress) -> Result<(), AvError> {
    defmt::debug!("[API] disconnect {} peer {}", role, address);
    ensure_enabled(role).await?;
    post_event(Some(role.opposite()), address, AvEvent::DisconnectRequest).await;
    Ok(())
}

/// Set (or clear, with [`PeerAddress::EMPTY`]) the active peer of a role.
///
/// Blocks for at most the bounded sync-request timeout; on expiry the call
/// logs the timeout and returns success, treating the outcome as degraded
/// but not fatal.
///
/// # Errors
/// Returns an error if the role is not enabled or the target peer does not
/// exist or is not connected.
pub async fn set_active_peer(role: Role, address: PeerAddress) -> Result<(), AvError> {
    ensure_enabled(role).await?;
    post(HomeRequest::SetActivePeer { role, address }).await;
    match with_timeout(SYNC_REQUEST_TIMEOUT, RESPONSE_CHANNEL.receive()).await {
        Ok(HomeResponse::ActivePeerSet(result)) => result,
        Ok(_) => Err(AvError::InvalidState),
        Err(_) => {
            defmt::warn!("[API] timed out waiting for active-peer change, proceeding");
            Ok(())
        }
    }
}

/// Enable or disable silence mode for a connected source-role peer.
///
/// # Errors
/// Returns an error if the role is not enabled, the peer is unknown or not
/// connected, or the bounded wait expired.
pub async fn set_silence(address: PeerAddress, silence: bool) -> Result<(), AvError> {
    ensure_enabled(Role::Source).await?;
    post(HomeRequest::SetSilence { address, silence }).await;
    match with_timeout(SYNC_REQUEST_TIMEOUT, RESPONSE_CHANNEL.receive()).await {
        Ok(HomeResponse::SilenceSet(result)) => result,
        Ok(_) => Err(AvError::InvalidState),
        Err(_) => {
            defmt::warn!("[API] timed out waiting for silence change, proceeding");
            Ok(())
        }
    }
}

/// Whether a connected source-role peer is in silence mode.
///
/// # Errors
/// Returns an error if the role is not enabled, the peer is unknown or not
/// connected, or the bounded wait expired.
pub async fn is_silenced(address: PeerAddress) -> Result<bool, AvError> {
    ensure_enabled(Role::Source).await?;
    post(HomeRequest::QuerySilence { address }).await;
    match with_timeout(SYNC_REQUEST_TIMEOUT, RESPONSE_CHANNEL.receive()).await {
        Ok(HomeResponse::Silence(result)) => result,
        Ok(_) => Err(AvError::InvalidState),
        Err(_) => {
            defmt::warn!("[API] timed out waiting for silence query");
            Err(AvError::Timeout)
        }
    }
}

/// Forward updated codec preferences for a peer to the encoder, restarting
/// the shared session first if the peer is active.
///
/// Blocks for at most the bounded sync-request timeout; on expiry the call
/// logs and proceeds.
///
/// # Errors
/// Returns an error if the source role is not enabled or the address is
/// empty.
pub async fn update_codec_config(
    address: PeerAddress,
    preferences: CodecPreferences,
) -> Result<(), AvError> {
    ensure_enabled(Role::Source).await?;
    if address.is_empty() {
        defmt::warn!("[API] codec config update needs a peer");
        return Err(AvError::InvalidParameter);
    }
    post(HomeRequest::UpdateCodecConfig {
        address,
        preferences,
    })
    .await;
    match with_timeout(SYNC_REQUEST_TIMEOUT, RESPONSE_CHANNEL.receive()).await {
        Ok(HomeResponse::CodecConfigUpdated(result)) => result,
        Ok(_) => Err(AvError::InvalidState),
        Err(_) => {
            defmt::warn!("[API] timed out waiting for codec config update, proceeding");
            Ok(())
        }
    }
}

/// Start streaming to the source role's active peer.
///
/// # Errors
/// Returns `AvError::NotInitialized` if the global context does not exist.
pub async fn start_stream(params: Option<StartStreamParams>) -> Result<(), AvError> {
    let active = { av_context().await?.registry(Role::Source).active_peer() };
    post_event(Some(Role::Sink), active, AvEvent::StartStreamRequest(params)).await;
    Ok(())
}

/// Stop streaming. With an address the request targets that peer; without
/// one every started source-role peer is stopped (the active peer may have
/// changed mid-reconfiguration, so all started peers are addressed).
pub async fn stop_stream(address: Option<PeerAddress>) {
    post(HomeRequest::StreamSuspend {
        stop: true,
        address,
    })
    .await;
}

/// Suspend streaming for every started source-role peer.
pub async fn suspend_stream() {
    post(HomeRequest::StreamSuspend {
        stop: false,
        address: None,
    })
    .await;
}

/// Hand the started stream of the source role's active peer to the offload
/// data path.
///
/// # Errors
/// Returns `AvError::NotInitialized` if the global context does not exist.
pub async fn start_offload() -> Result<(), AvError> {
    let active = { av_context().await?.registry(Role::Source).active_peer() };
    post_event(Some(Role::Sink), active, AvEvent::OffloadStartRequest).await;
    Ok(())
}

/// Change the latency mode of the source role's active peer.
///
/// # Errors
/// Returns `AvError::NotInitialized` if the global context does not exist.
pub async fn set_latency(low_latency: bool) -> Result<(), AvError> {
    let active = { av_context().await?.registry(Role::Source).active_peer() };
    post_event(
        Some(Role::Sink),
        active,
        AvEvent::SetLatencyRequest { low_latency },
    )
    .await;
    Ok(())
}

/// Change the codec operating mode of the source role's active peer.
///
/// # Errors
/// Returns `AvError::NotInitialized` if the global context does not exist.
pub async fn set_codec_mode(mode: u8) -> Result<(), AvError> {
    let active = { av_context().await?.registry(Role::Source).active_peer() };
    post_event(
        Some(Role::Sink),
        active,
        AvEvent::SetCodecModeRequest { mode },
    )
    .await;
    Ok(())
}

/// Clear the active peer's remote-suspend marker so the pipeline may
/// restart the stream.
pub async fn clear_remote_suspend_flag() {
    post(HomeRequest::ClearRemoteSuspend).await;
}

/// The active peer of a role, or [`PeerAddress::EMPTY`] when none is set.
///
/// # Errors
/// Returns `AvError::NotInitialized` if the global context does not exist.
pub async fn active_peer(role: Role) -> Result<PeerAddress, AvError> {
    Ok(av_context().await?.registry(role).active_peer())
}

/// Whether a profile role is currently enabled.
///
/// # Errors
/// Returns `AvError::NotInitialized` if the global context does not exist.
pub async fn is_enabled(role: Role) -> Result<bool, AvError> {
    Ok(av_context().await?.registry(role).enabled())
}
