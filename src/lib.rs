#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines)]

#[cfg(test)]
extern crate std;

mod address;
pub mod api;
pub mod audio;
pub mod callback;
pub mod codec;
pub mod constants;
pub mod device_config;
pub mod event;
mod peer;
pub mod processor;
pub mod queue;
pub mod rc;
mod registry;
mod router;
mod state_machine;
pub mod transport;

use crate::audio::AudioCommand;
use crate::callback::AvCallback;
use crate::constants::{
    CALLBACK_CHANNEL_DEPTH, COMMAND_CHANNEL_DEPTH, CONFIG_CHANNEL_DEPTH, DEFAULT_MAX_CONNECTED_PEERS,
    HOME_CHANNEL_DEPTH, QUEUE_CHANNEL_DEPTH, RC_CHANNEL_DEPTH, RESPONSE_CHANNEL_DEPTH,
};
use crate::device_config::ConfigUpdate;
use crate::event::{HomeRequest, HomeResponse};
use crate::queue::QueueAdvance;
use crate::rc::RcForward;
use crate::registry::PeerRegistry;
use crate::transport::TransportRequest;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::{MappedMutexGuard, Mutex, MutexGuard};

pub use address::PeerAddress;
pub use event::{
    AvEvent, AvEventKind, OpenCompleted, StartCompleted, StartStreamParams, SuspendCompleted,
    TransportStatus,
};
pub use peer::{EDR_2MBPS, EDR_3MBPS, Peer, PeerFlags, StreamState};

/// Requests marshalled onto the home context (single FIFO, single consumer)
pub(crate) static HOME_CHANNEL: Channel<CriticalSectionRawMutex, HomeRequest, HOME_CHANNEL_DEPTH> =
    Channel::new();

/// Responses for the synchronous client entry points
pub(crate) static RESPONSE_CHANNEL: Channel<
    CriticalSectionRawMutex,
    HomeResponse,
    RESPONSE_CHANNEL_DEPTH,
> = Channel::new();

/// Requests for the external transport/link manager
pub(crate) static TRANSPORT_CHANNEL: Channel<
    CriticalSectionRawMutex,
    TransportRequest,
    COMMAND_CHANNEL_DEPTH,
> = Channel::new();

/// Commands for the external audio pipeline
pub(crate) static AUDIO_CHANNEL: Channel<
    CriticalSectionRawMutex,
    AudioCommand,
    COMMAND_CHANNEL_DEPTH,
> = Channel::new();

/// Notifications for the client
pub(crate) static CALLBACK_CHANNEL: Channel<
    CriticalSectionRawMutex,
    AvCallback,
    CALLBACK_CHANNEL_DEPTH,
> = Channel::new();

/// Remote-control events forwarded to the AVRCP signaling module
pub(crate) static RC_CHANNEL: Channel<CriticalSectionRawMutex, RcForward, RC_CHANNEL_DEPTH> =
    Channel::new();

/// Write-only updates for the device configuration store
pub(crate) static CONFIG_CHANNEL: Channel<CriticalSectionRawMutex, ConfigUpdate, CONFIG_CHANNEL_DEPTH> =
    Channel::new();

/// Advance tokens for the external admission queue
pub(crate) static QUEUE_CHANNEL: Channel<CriticalSectionRawMutex, QueueAdvance, QUEUE_CHANNEL_DEPTH> =
    Channel::new();

/// Global `AvContext`, initialized by the client at runtime
pub(crate) static AV_CONTEXT: Mutex<CriticalSectionRawMutex, Option<AvContext>> = Mutex::new(None);

/// A stream endpoint role: which side of the audio stream a device plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, defmt::Format)]
pub enum Role {
    /// Sends audio
    Source,
    /// Receives audio
    Sink,
}

impl Role {
    /// The counterpart role: a remote source endpoint is served by the local
    /// sink role and vice versa
    #[must_use]
    pub const fn opposite(self) -> Role {
        match self {
            Role::Source => Role::Sink,
            Role::Sink => Role::Source,
        }
    }
}

/// Errors surfaced by the `Avlark` API
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum AvError {
    /// The global context has not been initialized
    NotInitialized,
    /// The global context was already initialized
    AlreadyInitialized,
    /// The requested role is not enabled
    NotEnabled,
    /// Invalid parameter provided (e.g. malformed address, oversized payload)
    InvalidParameter,
    /// The bounded peer-id pool is exhausted
    PoolExhausted,
    /// No peer exists for the given address
    PeerNotFound,
    /// The peer exists but is not connected
    PeerNotConnected,
    /// The operation is not valid in the current state
    InvalidState,
    /// A bounded wait expired before the home context answered
    Timeout,
}

/// Options for the process-wide context
#[derive(Debug, Clone, Copy, Default)]
pub struct AvContextOptions {
    /// Allow the source and sink roles to be enabled simultaneously
    /// ("coexist" mode); the roles remain mutually exclusive per remote
    /// device once either side is at capacity
    pub coexist: bool,
}

/// Options for enabling one profile role
#[derive(Debug, Clone, Copy)]
pub struct AvInitOptions {
    /// Maximum number of simultaneously connected peers for the role
    pub max_connected_peers: usize,
}

impl Default for AvInitOptions {
    fn default() -> Self {
        Self {
            max_connected_peers: DEFAULT_MAX_CONNECTED_PEERS,
        }
    }
}

/// Process-wide connection state: both role registries plus the coexist
/// policy flag. All mutation happens on the home context; the context is
/// created at process start and its roles are enabled/disabled through
/// [`api::init`]/[`api::cleanup`].
#[derive(Debug)]
pub struct AvContext {
    pub(crate) source: PeerRegistry,
    pub(crate) sink: PeerRegistry,
    pub(crate) coexist: bool,
    pub(crate) purge_pending: bool,
}

impl AvContext {
    /// Create a context with both roles disabled
    #[must_use]
    pub fn new(options: AvContextOptions) -> Self {
        Self {
            source: PeerRegistry::new(Role::Source),
            sink: PeerRegistry::new(Role::Sink),
            coexist: options.coexist,
            purge_pending: false,
        }
    }

    /// The registry serving `role`
    pub(crate) fn registry(&self, role: Role) -> &PeerRegistry {
        match role {
            Role::Source => &self.source,
            Role::Sink => &self.sink,
        }
    }

    /// Mutable access to the registry serving `role`
    pub(crate) fn registry_mut(&mut self, role: Role) -> &mut PeerRegistry {
        match role {
            Role::Source => &mut self.source,
            Role::Sink => &mut self.sink,
        }
    }

    /// Whether both roles are currently enabled
    #[must_use]
    pub fn both_enabled(&self) -> bool {
        self.source.enabled() && self.sink.enabled()
    }

    /// Whether coexist mode is configured for this device
    #[must_use]
    pub fn coexist_enabled(&self) -> bool {
        self.coexist
    }
}

impl Default for AvContext {
    fn default() -> Self {
        Self::new(AvContextOptions::default())
    }
}

/// Initialize the global `AvContext` with the given options.
///
/// Must be called before spawning [`processor::run`] or using any API
/// function.
///
/// # Errors
/// Returns `AvError::AlreadyInitialized` if the context already exists.
pub async fn init_av_context(options: AvContextOptions) -> Result<(), AvError> {
    let mut guard = AV_CONTEXT.lock().await;
    if guard.is_some() {
        return Err(AvError::AlreadyInitialized);
    }
    *guard = Some(AvContext::new(options));
    Ok(())
}

/// Get a locked reference to the global `AvContext`.
///
/// # Errors
/// Returns `AvError::NotInitialized` if [`init_av_context`] has not run.
///
/// # Panics
/// Panics if the mutex guard cannot be mapped (never happens in practice).
pub async fn av_context<'a>()
-> Result<MappedMutexGuard<'a, CriticalSectionRawMutex, AvContext>, AvError> {
    let guard = AV_CONTEXT.lock().await;
    if guard.is_none() {
        return Err(AvError::NotInitialized);
    }
    Ok(MutexGuard::map(guard, |opt| opt.as_mut().unwrap()))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Host-test plumbing: a process-wide lock serializing tests that touch
    //! the static channels, a drain helper, and a no-op defmt sink.

    use std::sync::{Mutex, MutexGuard, OnceLock};

    static TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    /// Serialize tests that use the static channels
    pub fn serialize() -> MutexGuard<'static, ()> {
        TEST_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Empty every static channel
    pub fn drain_channels() {
        while crate::HOME_CHANNEL.try_receive().is_ok() {}
        while crate::RESPONSE_CHANNEL.try_receive().is_ok() {}
        while crate::TRANSPORT_CHANNEL.try_receive().is_ok() {}
        while crate::AUDIO_CHANNEL.try_receive().is_ok() {}
        while crate::CALLBACK_CHANNEL.try_receive().is_ok() {}
        while crate::RC_CHANNEL.try_receive().is_ok() {}
        while crate::CONFIG_CHANNEL.try_receive().is_ok() {}
        while crate::QUEUE_CHANNEL.try_receive().is_ok() {}
    }

    #[defmt::global_logger]
    struct TestLogger;

    unsafe impl defmt::Logger for TestLogger {
        fn acquire() {}
        unsafe fn flush() {}
        unsafe fn release() {}
        unsafe fn write(_bytes: &[u8]) {}
    }

    // defmt requires a timestamp source and a panic handler to be defined
    // exactly once in the linked binary; supply no-op/host versions here.
    defmt::timestamp!("{=u32}", 0);

    #[defmt::panic_handler]
    fn defmt_panic() -> ! {
        core::panic!("defmt panic")
    }
}
