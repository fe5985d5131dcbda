//! Peer State
//!
//! A [`Peer`] holds one remote device's connection state for one profile
//! role: identity, transport handle, the connection state machine position,
//! the suspend/start bookkeeping flags and the open-fallback deadline.
//!
//! A peer has no side effects beyond its own fields; all cross-peer and
//! cross-registry effects are driven by the state machine through explicit
//! collaborator calls. Exactly one peer exists per (address, role) pair at a
//! time; it is owned exclusively by its registry and removed only once its
//! state machine has returned to Idle after having left Idle at least once.

use crate::transport::TransportHandle;
use crate::{PeerAddress, Role};
use embassy_time::Instant;

/// EDR capability bit: 2 Mbps packets supported
pub const EDR_2MBPS: u8 = 0x01;

/// EDR capability bit: 3 Mbps packets supported
pub const EDR_3MBPS: u8 = 0x02;

/// Position of a peer's connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum StreamState {
    /// Transport disconnected
    Idle,
    /// Opening the transport connection
    Opening,
    /// Transport connection established
    Opened,
    /// Audio stream started
    Started,
    /// Closing the transport connection
    Closing,
}

/// Bookkeeping flags that make start/suspend requests idempotent and keep
/// the shared audio pipeline from being restarted while a suspend is in
/// flight
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags(u8);

impl PeerFlags {
    /// A locally-initiated suspend is in flight
    pub const LOCAL_SUSPEND_PENDING: u8 = 0x01;
    /// The remote suspended the stream
    pub const REMOTE_SUSPEND: u8 = 0x02;
    /// A start request is awaiting its completion
    pub const PENDING_START: u8 = 0x04;
    /// A stop request is awaiting its completion
    pub const PENDING_STOP: u8 = 0x08;

    /// Check whether any of the flags in `mask` is set
    #[must_use]
    pub fn check(self, mask: u8) -> bool {
        (self.0 & mask) != 0
    }

    /// Set the flags in `mask`
    pub fn set(&mut self, mask: u8) {
        self.0 |= mask;
    }

    /// Clear the flags in `mask`
    pub fn clear(&mut self, mask: u8) {
        self.0 &= !mask;
    }

    /// Clear all flags
    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    /// Whether no flag is set
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw flag bits
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl defmt::Format for PeerFlags {
    fn format(&self, fmt: defmt::Formatter<'_>) {
        defmt::write!(fmt, "{=u8:x}", self.0);
    }
}

/// One remote device's connection state for one profile role
#[derive(Debug, Clone)]
pub struct Peer {
    address: PeerAddress,
    endpoint_role: Role,
    handle: TransportHandle,
    peer_id: u8,
    state: StreamState,
    previous_state: Option<StreamState>,
    flags: PeerFlags,
    edr: u8,
    self_initiated: bool,
    silenced: bool,
    delay_report: u16,
    mandatory_codec_preferred: bool,
    use_latency_mode: bool,
    open_fallback_deadline: Option<Instant>,
}

impl Peer {
    /// Create a new peer in its initial Idle state
    #[must_use]
    pub fn new(
        address: PeerAddress,
        endpoint_role: Role,
        handle: TransportHandle,
        peer_id: u8,
    ) -> Self {
        Self {
            address,
            endpoint_role,
            handle,
            peer_id,
            state: StreamState::Idle,
            previous_state: None,
            flags: PeerFlags::default(),
            edr: 0,
            self_initiated: false,
            silenced: false,
            delay_report: 0,
            mandatory_codec_preferred: false,
            use_latency_mode: false,
            open_fallback_deadline: None,
        }
    }

    /// The peer's device address
    #[must_use]
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// The remote device's stream endpoint role
    #[must_use]
    pub fn endpoint_role(&self) -> Role {
        self.endpoint_role
    }

    /// Correct the remote endpoint role once the transport reports it.
    /// Only the registry-migration path may do this.
    pub(crate) fn set_endpoint_role(&mut self, endpoint_role: Role) {
        self.endpoint_role = endpoint_role;
    }

    /// The local role serving this peer (the opposite of the remote endpoint)
    #[must_use]
    pub fn local_role(&self) -> Role {
        self.endpoint_role.opposite()
    }

    /// Whether the remote endpoint is a stream source
    #[must_use]
    pub fn is_remote_source(&self) -> bool {
        self.endpoint_role == Role::Source
    }

    /// Whether the remote endpoint is a stream sink
    #[must_use]
    pub fn is_remote_sink(&self) -> bool {
        self.endpoint_role == Role::Sink
    }

    /// The transport handle assigned to this peer's stream endpoint
    #[must_use]
    pub fn handle(&self) -> TransportHandle {
        self.handle
    }

    /// Update the transport handle (registration bookkeeping)
    pub(crate) fn set_handle(&mut self, handle: TransportHandle) {
        self.handle = handle;
    }

    /// The peer id allocated from the registry's bounded pool
    #[must_use]
    pub fn peer_id(&self) -> u8 {
        self.peer_id
    }

    /// Current state machine position
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The state before the last transition, `None` for a peer that never
    /// left its initial Idle
    #[must_use]
    pub fn previous_state(&self) -> Option<StreamState> {
        self.previous_state
    }

    /// Record a state transition. Re-entering the current state is a valid
    /// transition and counts as having left the initial Idle.
    pub(crate) fn record_transition(&mut self, next: StreamState) {
        self.previous_state = Some(self.state);
        self.state = next;
    }

    /// Whether the peer may be removed from its registry: the machine is in
    /// Idle and has previously left Idle at least once, so a freshly
    /// constructed peer is never deleted mid-construction
    #[must_use]
    pub fn can_be_deleted(&self) -> bool {
        self.state == StreamState::Idle && self.previous_state.is_some()
    }

    /// Whether the peer counts as connected (Opened or Started)
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state, StreamState::Opened | StreamState::Started)
    }

    /// Whether the peer is streaming
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state == StreamState::Started
    }

    /// Current bookkeeping flags
    #[must_use]
    pub fn flags(&self) -> PeerFlags {
        self.flags
    }

    /// Check whether any of the flags in `mask` is set
    #[must_use]
    pub fn check_flags(&self, mask: u8) -> bool {
        self.flags.check(mask)
    }

    /// Set the flags in `mask`
    pub fn set_flags(&mut self, mask: u8) {
        self.flags.set(mask);
    }

    /// Clear the flags in `mask`
    pub fn clear_flags(&mut self, mask: u8) {
        self.flags.clear(mask);
    }

    /// Clear all flags
    pub fn clear_all_flags(&mut self) {
        self.flags.clear_all();
    }

    /// Record the link's EDR capability bits
    pub fn set_edr(&mut self, edr: u8) {
        self.edr = edr;
    }

    /// Whether the link supports EDR packets
    #[must_use]
    pub fn is_edr(&self) -> bool {
        self.edr != 0
    }

    /// Whether the link supports 3 Mbps EDR packets
    #[must_use]
    pub fn is_3mbps(&self) -> bool {
        (self.edr & EDR_3MBPS) != 0
    }

    /// Whether the local side initiated the current connection attempt
    #[must_use]
    pub fn self_initiated_connection(&self) -> bool {
        self.self_initiated
    }

    /// Record who initiated the current connection attempt
    pub fn set_self_initiated_connection(&mut self, self_initiated: bool) {
        self.self_initiated = self_initiated;
    }

    /// Whether the peer is in silence mode
    #[must_use]
    pub fn is_silenced(&self) -> bool {
        self.silenced
    }

    /// Enable or disable silence mode
    pub fn set_silence(&mut self, silence: bool) {
        self.silenced = silence;
    }

    /// The last AVDTP delay report, in 1/10 milliseconds
    #[must_use]
    pub fn delay_report(&self) -> u16 {
        self.delay_report
    }

    /// Record an AVDTP delay report, in 1/10 milliseconds
    pub fn set_delay_report(&mut self, delay: u16) {
        self.delay_report = delay;
    }

    /// Whether the mandatory codec is preferred for this peer
    #[must_use]
    pub fn is_mandatory_codec_preferred(&self) -> bool {
        self.mandatory_codec_preferred
    }

    /// Record the mandatory-codec preference for this peer
    pub fn set_mandatory_codec_preferred(&mut self, preferred: bool) {
        self.mandatory_codec_preferred = preferred;
    }

    /// Whether streams for this peer use low-latency mode
    #[must_use]
    pub fn use_latency_mode(&self) -> bool {
        self.use_latency_mode
    }

    /// Record the latency mode for this peer's streams
    pub fn set_use_latency_mode(&mut self, use_latency_mode: bool) {
        self.use_latency_mode = use_latency_mode;
    }

    /// Arm the open-fallback deadline: if only the remote-control channel
    /// connected, a transport connection is auto-initiated at `deadline`
    pub(crate) fn arm_open_fallback(&mut self, deadline: Instant) {
        self.open_fallback_deadline = Some(deadline);
    }

    /// Cancel the open-fallback deadline
    pub(crate) fn cancel_open_fallback(&mut self) {
        self.open_fallback_deadline = None;
    }

    /// The armed open-fallback deadline, if any
    #[must_use]
    pub fn open_fallback_deadline(&self) -> Option<Instant> {
        self.open_fallback_deadline
    }
}
