//! Event Envelopes
//!
//! Every occurrence the state machine reacts to (transport notifications,
//! remote-control notifications and local client requests) is converted
//! into a self-contained [`AvEvent`] before it is marshalled onto the home
//! context. Each variant owns its payload directly, so cloning an event
//! yields an independent copy and the originating buffer can be freed right
//! after dispatch.

use crate::codec::AudioConfig;
use crate::rc::RcEvent;
use crate::transport::TransportHandle;
use crate::{PeerAddress, Role};

/// Status reported by the transport layer for a completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum TransportStatus {
    /// Operation completed successfully
    Success,
    /// Generic failure
    Fail,
    /// Failure due to resource exhaustion
    FailResources,
    /// Stream-level failure
    FailStream,
}

impl TransportStatus {
    /// Whether this status reports success
    #[must_use]
    pub fn is_success(self) -> bool {
        self == TransportStatus::Success
    }
}

/// Payload of a transport open completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct OpenCompleted {
    /// Outcome of the open procedure
    pub status: TransportStatus,
    /// The peer's stream endpoint role as reported by the transport. This is
    /// the first point at which the real role of a remotely-connecting
    /// device is known.
    pub endpoint_role: Role,
    /// EDR capability bits of the link
    pub edr: u8,
}

/// Payload of a transport start completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct StartCompleted {
    /// Outcome of the start procedure
    pub status: TransportStatus,
    /// A suspend is already in progress for this stream
    pub suspending: bool,
    /// The local side initiated the start
    pub initiator: bool,
}

/// Payload of a transport suspend or stop completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct SuspendCompleted {
    /// Outcome of the suspend/stop procedure
    pub status: TransportStatus,
    /// The local side initiated the suspend/stop
    pub initiator: bool,
}

/// Parameters of a local start-stream request
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct StartStreamParams {
    /// Request low-latency mode for the stream
    pub use_latency_mode: bool,
}

/// One event envelope delivered to a peer's connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvEvent {
    /// Local request to open the transport connection
    ConnectRequest,
    /// Local request to close the transport connection
    DisconnectRequest,
    /// Local request to start streaming, optionally with latency parameters
    StartStreamRequest(Option<StartStreamParams>),
    /// Local request to stop streaming
    StopStreamRequest,
    /// Local request to suspend streaming
    SuspendStreamRequest,
    /// Decoder configuration resolved for a remote source peer
    SinkConfigRequest(AudioConfig),
    /// The underlying link dropped while the transport connection was being
    /// set up
    AclDisconnected,
    /// Local request to hand the stream to the offload path
    OffloadStartRequest,
    /// Local request to change the stream latency mode
    SetLatencyRequest {
        /// Use low-latency mode
        low_latency: bool,
    },
    /// Local request to change the codec operating mode
    SetCodecModeRequest {
        /// Opaque encoder mode forwarded to the transport
        mode: u8,
    },
    /// The AVRCP module reports its control channel opened
    AvrcpOpen,
    /// The AVRCP module reports its control channel closed
    AvrcpClose,
    /// The AVRCP module reports a remote PLAY request
    AvrcpRemotePlay,
    /// AVDTP delay report from the peer, in 1/10 milliseconds
    DelayReport {
        /// Reported delay in 1/10 ms
        delay: u16,
    },
    /// The transport profile was enabled
    Enabled,
    /// A stream endpoint was registered with the transport
    Registered {
        /// Peer id the endpoint was registered for
        peer_id: u8,
        /// Transport handle assigned to the endpoint
        handle: TransportHandle,
        /// Remote endpoint role the registration serves
        endpoint_role: Role,
    },
    /// A remote device started an incoming transport connection
    IncomingConnection,
    /// Transport open procedure completed
    OpenCompleted(OpenCompleted),
    /// Transport connection closed
    CloseCompleted,
    /// Transport open was rejected by the remote
    OpenRejected,
    /// Transport start procedure completed
    StartCompleted(StartCompleted),
    /// Transport stop procedure completed
    StopCompleted(SuspendCompleted),
    /// Transport suspend procedure completed
    SuspendCompleted(SuspendCompleted),
    /// Transport reconfiguration completed
    ReconfigCompleted {
        /// Outcome of the reconfiguration
        status: TransportStatus,
    },
    /// The transport answered an offload-start request
    OffloadStartResponse {
        /// Outcome of the offload start
        status: TransportStatus,
    },
    /// Remote-control notification, routed through but not interpreted
    RemoteControl(RcEvent),
}

/// Fieldless discriminant of an [`AvEvent`], used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[allow(missing_docs)]
pub enum AvEventKind {
    ConnectRequest,
    DisconnectRequest,
    StartStreamRequest,
    StopStreamRequest,
    SuspendStreamRequest,
    SinkConfigRequest,
    AclDisconnected,
    OffloadStartRequest,
    SetLatencyRequest,
    SetCodecModeRequest,
    AvrcpOpen,
    AvrcpClose,
    AvrcpRemotePlay,
    DelayReport,
    Enabled,
    Registered,
    IncomingConnection,
    OpenCompleted,
    CloseCompleted,
    OpenRejected,
    StartCompleted,
    StopCompleted,
    SuspendCompleted,
    ReconfigCompleted,
    OffloadStartResponse,
    RemoteControl,
}

impl AvEvent {
    /// The discriminant of this event
    #[must_use]
    pub fn kind(&self) -> AvEventKind {
        match self {
            AvEvent::ConnectRequest => AvEventKind::ConnectRequest,
            AvEvent::DisconnectRequest => AvEventKind::DisconnectRequest,
            AvEvent::StartStreamRequest(_) => AvEventKind::StartStreamRequest,
            AvEvent::StopStreamRequest => AvEventKind::StopStreamRequest,
            AvEvent::SuspendStreamRequest => AvEventKind::SuspendStreamRequest,
            AvEvent::SinkConfigRequest(_) => AvEventKind::SinkConfigRequest,
            AvEvent::AclDisconnected => AvEventKind::AclDisconnected,
            AvEvent::OffloadStartRequest => AvEventKind::OffloadStartRequest,
            AvEvent::SetLatencyRequest { .. } => AvEventKind::SetLatencyRequest,
            AvEvent::SetCodecModeRequest { .. } => AvEventKind::SetCodecModeRequest,
            AvEvent::AvrcpOpen => AvEventKind::AvrcpOpen,
            AvEvent::AvrcpClose => AvEventKind::AvrcpClose,
            AvEvent::AvrcpRemotePlay => AvEventKind::AvrcpRemotePlay,
            AvEvent::DelayReport { .. } => AvEventKind::DelayReport,
            AvEvent::Enabled => AvEventKind::Enabled,
            AvEvent::Registered { .. } => AvEventKind::Registered,
            AvEvent::IncomingConnection => AvEventKind::IncomingConnection,
            AvEvent::OpenCompleted(_) => AvEventKind::OpenCompleted,
            AvEvent::CloseCompleted => AvEventKind::CloseCompleted,
            AvEvent::OpenRejected => AvEventKind::OpenRejected,
            AvEvent::StartCompleted(_) => AvEventKind::StartCompleted,
            AvEvent::StopCompleted(_) => AvEventKind::StopCompleted,
            AvEvent::SuspendCompleted(_) => AvEventKind::SuspendCompleted,
            AvEvent::ReconfigCompleted { .. } => AvEventKind::ReconfigCompleted,
            AvEvent::OffloadStartResponse { .. } => AvEventKind::OffloadStartResponse,
            AvEvent::RemoteControl(_) => AvEventKind::RemoteControl,
        }
    }
}

/// One request marshalled onto the home context
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HomeRequest {
    /// An event envelope with its routing information. `address` is
    /// `PeerAddress::EMPTY` and `handle` is `TransportHandle::UNKNOWN` when
    /// not known at dispatch time; `endpoint_role` is the remote endpoint
    /// role hint, `None` when the peer's role is still undetermined.
    Event {
        endpoint_role: Option<Role>,
        address: PeerAddress,
        handle: TransportHandle,
        event: AvEvent,
    },
    SetActivePeer {
        role: Role,
        address: PeerAddress,
    },
    UpdateCodecConfig {
        address: PeerAddress,
        preferences: crate::codec::CodecPreferences,
    },
    SetSilence {
        address: PeerAddress,
        silence: bool,
    },
    QuerySilence {
        address: PeerAddress,
    },
    StreamSuspend {
        stop: bool,
        address: Option<PeerAddress>,
    },
    ClearRemoteSuspend,
    Cleanup {
        role: Role,
    },
}

/// Response to a synchronous home-context request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HomeResponse {
    ActivePeerSet(Result<(), crate::AvError>),
    CodecConfigUpdated(Result<(), crate::AvError>),
    SilenceSet(Result<(), crate::AvError>),
    Silence(Result<bool, crate::AvError>),
}
