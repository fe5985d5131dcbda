//! Connection State Machine
//!
//! Five states per peer: Idle, Opening, Opened, Started, Closing. Idle is
//! the initial state and re-enterable indefinitely; there is no terminal
//! state. Handlers are pure reactive logic over event envelopes: they
//! mutate the peer, post collaborator commands and drive transitions, and
//! return whether the event was recognized. Unrecognized events are logged
//! and ignored.
//!
//! No dedicated Suspend state is needed: the actions are no different from
//! the Opened state. The suspend flags exist to keep the shared audio
//! pipeline from restarting the stream during a remote suspend or while a
//! local suspend is in flight.

use crate::audio::{self, AudioCommandKind};
use crate::callback::{self, AudioState, AvStatus, ConnectionState};
use crate::constants::{OPEN_FALLBACK_TIMEOUT, RC_OP_PLAY};
use crate::device_config::{self, ConfigUpdate};
use crate::event::{
    AvEvent, HomeRequest, OpenCompleted, StartCompleted, SuspendCompleted, TransportStatus,
};
use crate::peer::{Peer, PeerFlags, StreamState};
use crate::queue;
use crate::rc::{self, RcEvent, RcEventKind};
use crate::transport::{self, TransportHandle, TransportRequest};
use crate::{AvContext, PeerAddress, Role};
use embassy_time::Instant;

impl AvContext {
    /// Feed one event to the state machine of the peer at (`role`,
    /// `address`). Returns whether the event was recognized in the peer's
    /// current state.
    pub(crate) fn process_peer_event(
        &mut self,
        role: Role,
        address: PeerAddress,
        event: &AvEvent,
    ) -> bool {
        let Some(peer) = self.peer(role, address) else {
            return false;
        };
        let state = peer.state();
        defmt::debug!(
            "[SM] peer {} : state={} event={} flags={} active={}",
            address,
            state,
            event.kind(),
            peer.flags(),
            self.is_active_peer(role, address)
        );

        let handled = match state {
            StreamState::Idle => self.idle_on_event(role, address, event),
            StreamState::Opening => self.opening_on_event(role, address, event),
            StreamState::Opened => self.opened_on_event(role, address, event),
            StreamState::Started => self.started_on_event(role, address, event),
            StreamState::Closing => self.closing_on_event(role, address, event),
        };
        if !handled {
            defmt::warn!(
                "[SM] peer {} : unhandled event {} in {}",
                address,
                event.kind(),
                state
            );
        }
        handled
    }

    /// Run the exit actions of the current state, record the transition and
    /// run the entry actions of the next state. Re-entering the current
    /// state is a valid transition.
    pub(crate) fn transition_to(&mut self, role: Role, address: PeerAddress, next: StreamState) {
        let Some(current) = self.peer_state(role, address) else {
            return;
        };
        defmt::debug!("[SM] peer {} : {} -> {}", address, current, next);

        match current {
            StreamState::Idle => {
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.cancel_open_fallback();
                }
            }
            StreamState::Opened => {
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.clear_flags(PeerFlags::PENDING_START);
                }
            }
            _ => {}
        }

        if let Some(peer) = self.peer_mut(role, address) {
            peer.record_transition(next);
        }

        match next {
            StreamState::Idle => self.enter_idle(role, address),
            StreamState::Opening => self.enter_opening(role, address),
            StreamState::Opened => self.enter_opened(role, address),
            StreamState::Started => self.enter_started(role, address),
            StreamState::Closing => self.enter_closing(role, address),
        }
    }

    fn enter_idle(&mut self, role: Role, address: PeerAddress) {
        if let Some(peer) = self.peer_mut(role, address) {
            peer.set_edr(0);
            peer.clear_all_flags();
        }

        // Stop pipeline activity if this is the active peer
        let active = self.registry(role).active_peer();
        let is_active = active == address;
        if is_active || active.is_empty() {
            audio::command(role, AudioCommandKind::OnIdle { address });
        }

        // Release the active-peer slot if this was the active peer and the
        // Idle state was re-entered
        let deletable = self.peer(role, address).is_some_and(Peer::can_be_deleted);
        if is_active && deletable {
            let _ = self.set_active_peer(role, PeerAddress::EMPTY);
        }

        // Purge idle peers once the current dispatch step completes
        self.purge_pending = true;
    }

    fn enter_opening(&mut self, role: Role, address: PeerAddress) {
        // An incoming connection on a dual-role device has an undetermined
        // role until open time; defer the report for those
        if self.both_enabled()
            && !self
                .peer(role, address)
                .is_some_and(Peer::self_initiated_connection)
        {
            return;
        }
        callback::report_connection_state(
            role,
            address,
            ConnectionState::Connecting,
            AvStatus::Success,
            TransportStatus::Success,
        );
    }

    fn enter_opened(&mut self, role: Role, address: PeerAddress) {
        if let Some(peer) = self.peer_mut(role, address) {
            peer.clear_flags(
                PeerFlags::LOCAL_SUSPEND_PENDING
                    | PeerFlags::PENDING_START
                    | PeerFlags::PENDING_STOP,
            );
        }

        // Elect the first connected remote source as the sink role's active
        // peer; source-side election is driven by the client
        if role == Role::Sink && self.sink.active_peer().is_empty() {
            if let Err(e) = self.set_active_peer(Role::Sink, address) {
                defmt::error!(
                    "[SM] error setting {} as active sink-role peer: {}",
                    address,
                    e
                );
            }
        }
    }

    fn enter_started(&mut self, role: Role, address: PeerAddress) {
        // Back in Started, clear any remote suspend marker
        if let Some(peer) = self.peer_mut(role, address) {
            peer.clear_flags(PeerFlags::REMOTE_SUSPEND);
        }
        if role == Role::Sink {
            audio::command(Role::Sink, AudioCommandKind::SetRxFlush(false));
        }
        callback::report_audio_state(role, address, AudioState::Started);
    }

    fn enter_closing(&mut self, role: Role, address: PeerAddress) {
        if self.is_active_peer(role, address) {
            // Immediately stop the media path while the close completes
            match role {
                Role::Source => audio::command(role, AudioCommandKind::SetTxFlush(true)),
                Role::Sink => audio::command(role, AudioCommandKind::SetRxFlush(true)),
            }
        }
    }

    fn idle_on_event(&mut self, role: Role, address: PeerAddress, event: &AvEvent) -> bool {
        match event {
            AvEvent::Enabled => true,

            AvEvent::StopStreamRequest | AvEvent::SuspendStreamRequest | AvEvent::AclDisconnected => {
                // Re-enter Idle so the peer becomes eligible for deletion
                self.transition_to(role, address, StreamState::Idle);
                true
            }

            AvEvent::DisconnectRequest => {
                let handle = self.peer_handle(role, address);
                if !handle.is_unknown() {
                    transport::request(TransportRequest::Close { handle });
                    if self.peer(role, address).is_some_and(Peer::is_remote_source) {
                        transport::request(TransportRequest::RcClose { handle });
                    }
                }
                self.transition_to(role, address, StreamState::Idle);
                true
            }

            AvEvent::ConnectRequest | AvEvent::IncomingConnection => {
                let self_initiated = matches!(event, AvEvent::ConnectRequest);
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.set_self_initiated_connection(self_initiated);
                }
                if !self.allowed_to_connect(role, address) {
                    defmt::error!(
                        "[SM] cannot connect to peer {}: too many connected peers",
                        address
                    );
                    self.post_own_event(role, address, AvEvent::DisconnectRequest);
                    if self_initiated {
                        queue::advance();
                    }
                    return true;
                }
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::Open { address, handle });
                self.transition_to(role, address, StreamState::Opening);
                if self_initiated {
                    device_config::update(ConfigUpdate::ProfileRole {
                        address,
                        endpoint_role: role.opposite(),
                    });
                }
                device_config::update(ConfigUpdate::ConnectionAttempt { address });
                true
            }

            AvEvent::AvrcpOpen => self.idle_remote_control_open(role, address, None),
            AvEvent::RemoteControl(rc) if rc.kind() == RcEventKind::Open => {
                self.idle_remote_control_open(role, address, Some(rc))
            }

            AvEvent::AvrcpClose => {
                self.cancel_open_fallback(role, address);
                true
            }
            AvEvent::RemoteControl(rc) if rc.kind() == RcEventKind::Close => {
                self.cancel_open_fallback(role, address);
                rc::forward(address, rc);
                true
            }
            AvEvent::RemoteControl(rc) => {
                rc::forward(address, rc);
                true
            }

            AvEvent::SinkConfigRequest(config) => {
                // The remote may start the streaming procedure before the
                // signaling channel is fully up; still report the config
                callback::report_audio_config(role, address, *config);
                true
            }

            AvEvent::OpenCompleted(open) => self.idle_open_completed(role, address, *open),

            AvEvent::OffloadStartRequest => {
                defmt::error!("[SM] peer {} : stream is not opened", address);
                audio::command(
                    role,
                    AudioCommandKind::OnOffloadStarted {
                        address,
                        status: TransportStatus::Fail,
                    },
                );
                true
            }

            _ => false,
        }
    }

    /// An AVRCP connection cannot exist without a transport connection, but
    /// some headsets establish AVRCP first. Arm a timer that initiates the
    /// transport connection if the peer never does.
    fn idle_remote_control_open(
        &mut self,
        role: Role,
        address: PeerAddress,
        rc: Option<&RcEvent>,
    ) -> bool {
        defmt::warn!(
            "[SM] peer {} : remote-control open received without transport connection",
            address
        );

        if !self.allowed_to_connect(role, address) {
            defmt::error!(
                "[SM] cannot connect to peer {}: too many connected peers",
                address
            );
            if self.coexist {
                let handle = self.peer_handle(role, address);
                if !handle.is_unknown() {
                    transport::request(TransportRequest::RcClose { handle });
                }
            } else {
                self.post_own_event(role, address, AvEvent::DisconnectRequest);
            }
            return true;
        }

        let deadline = Instant::now() + OPEN_FALLBACK_TIMEOUT;
        if let Some(peer) = self.peer_mut(role, address) {
            peer.arm_open_fallback(deadline);
        }
        if let Some(rc) = rc {
            rc::forward(address, rc);
        }
        true
    }

    fn idle_open_completed(&mut self, role: Role, address: PeerAddress, open: OpenCompleted) -> bool {
        defmt::info!(
            "[SM] peer {} : open completed status={} edr={=u8:x}",
            address,
            open.status,
            open.edr
        );

        callback::report_connection_state(
            role,
            address,
            ConnectionState::Connecting,
            AvStatus::Success,
            TransportStatus::Success,
        );

        if open.status.is_success() {
            if let Some(peer) = self.peer_mut(role, address) {
                peer.set_edr(open.edr);
            }
            let role = self.reconcile_endpoint_role(role, address, open.endpoint_role);
            assert!(
                self.peer(role, address)
                    .is_some_and(|peer| peer.endpoint_role() == open.endpoint_role),
                "peer endpoint role disagrees with transport-reported role after open"
            );

            if self.allowed_to_connect(role, address) {
                if self.peer(role, address).is_some_and(Peer::is_remote_source) {
                    // Bring up the remote-control connection as well
                    let handle = self.peer_handle(role, address);
                    transport::request(TransportRequest::RcOpen { handle });
                }
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Connected,
                    AvStatus::Success,
                    TransportStatus::Success,
                );
                self.transition_to(role, address, StreamState::Opened);
            } else {
                defmt::error!(
                    "[SM] cannot connect to peer {}: too many connected peers",
                    address
                );
                self.post_own_event(role, address, AvEvent::DisconnectRequest);
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnected,
                    AvStatus::NoResources,
                    TransportStatus::FailResources,
                );
                self.transition_to(role, address, StreamState::Idle);
            }
        } else {
            callback::report_connection_state(
                role,
                address,
                ConnectionState::Disconnected,
                AvStatus::Fail,
                open.status,
            );
            self.transition_to(role, address, StreamState::Idle);
            device_config::update(ConfigUpdate::ConnectionFailure { address });
        }
        queue::advance();
        true
    }

    fn opening_on_event(&mut self, role: Role, address: PeerAddress, event: &AvEvent) -> bool {
        match event {
            AvEvent::StopStreamRequest | AvEvent::SuspendStreamRequest => true, // Ignore

            AvEvent::AclDisconnected => {
                // Only Opening reacts to a link-layer drop distinctly: it is
                // the one window where resources must be unwound without a
                // "connected" report having been made
                defmt::warn!(
                    "[SM] peer {} : transitioning to Idle due to link-layer disconnect",
                    address
                );
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnected,
                    AvStatus::Fail,
                    TransportStatus::Fail,
                );
                self.transition_to(role, address, StreamState::Idle);
                self.advance_if_self_initiated(role, address);
                true
            }

            AvEvent::OpenRejected => {
                defmt::warn!("[SM] peer {} : open rejected by remote", address);
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnected,
                    AvStatus::AuthRejected,
                    TransportStatus::Fail,
                );
                self.transition_to(role, address, StreamState::Idle);
                self.advance_if_self_initiated(role, address);
                true
            }

            AvEvent::OpenCompleted(open) => self.opening_open_completed(role, address, *open),

            AvEvent::SinkConfigRequest(config) => {
                if self.both_enabled() || self.peer(role, address).is_some_and(Peer::is_remote_source)
                {
                    callback::report_audio_config(role, address, *config);
                }
                true
            }

            AvEvent::ConnectRequest => {
                defmt::warn!(
                    "[SM] peer {} : already connecting, ignoring connect request",
                    address
                );
                queue::advance();
                true
            }

            AvEvent::IncomingConnection => {
                defmt::warn!(
                    "[SM] peer {} : already connecting, ignoring incoming request",
                    address
                );
                true
            }

            AvEvent::OffloadStartRequest => {
                defmt::error!("[SM] peer {} : stream is not opened", address);
                audio::command(
                    role,
                    AudioCommandKind::OnOffloadStarted {
                        address,
                        status: TransportStatus::Fail,
                    },
                );
                true
            }

            AvEvent::CloseCompleted => {
                audio::command(role, AudioCommandKind::OnStopped);
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnected,
                    AvStatus::Fail,
                    TransportStatus::Fail,
                );
                self.transition_to(role, address, StreamState::Idle);
                device_config::update(ConfigUpdate::ConnectionFailure { address });
                self.advance_if_self_initiated(role, address);
                true
            }

            AvEvent::DisconnectRequest => {
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::Close { handle });
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnected,
                    AvStatus::Fail,
                    TransportStatus::Fail,
                );
                self.transition_to(role, address, StreamState::Idle);
                device_config::update(ConfigUpdate::ConnectionFailure { address });
                self.advance_if_self_initiated(role, address);
                true
            }

            AvEvent::RemoteControl(rc) => {
                rc::forward(address, rc);
                true
            }

            _ => false,
        }
    }

    fn opening_open_completed(
        &mut self,
        role: Role,
        address: PeerAddress,
        open: OpenCompleted,
    ) -> bool {
        defmt::info!(
            "[SM] peer {} : open completed status={} edr={=u8:x}",
            address,
            open.status,
            open.edr
        );

        if open.status.is_success() {
            if let Some(peer) = self.peer_mut(role, address) {
                peer.set_edr(open.edr);
            }
            let role = self.reconcile_endpoint_role(role, address, open.endpoint_role);
            assert!(
                self.peer(role, address)
                    .is_some_and(|peer| peer.endpoint_role() == open.endpoint_role),
                "peer endpoint role disagrees with transport-reported role after open"
            );

            // The admission decision may have been deferred while the role
            // was undetermined; re-validate now that it is known
            if self.coexist && !self.allowed_to_connect(role, address) {
                defmt::error!(
                    "[SM] cannot connect to peer {}: too many connected peers",
                    address
                );
                self.post_own_event(role, address, AvEvent::DisconnectRequest);
            }

            callback::report_connection_state(
                role,
                address,
                ConnectionState::Connected,
                AvStatus::Success,
                TransportStatus::Success,
            );
            self.transition_to(role, address, StreamState::Opened);

            if self.peer(role, address).is_some_and(Peer::is_remote_source)
                && self.coexist
                && self.allowed_to_connect(role, address)
            {
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::RcOpen { handle });
            }
            self.advance_if_self_initiated(role, address);
        } else {
            // Tear down any remote-control connection the peer brought up;
            // the transport connection failed
            let handle = self.peer_handle(role, address);
            if !handle.is_unknown() {
                transport::request(TransportRequest::RcClose { handle });
            }
            device_config::update(ConfigUpdate::ConnectionFailure { address });
            callback::report_connection_state(
                role,
                address,
                ConnectionState::Disconnected,
                AvStatus::Fail,
                open.status,
            );
            self.transition_to(role, address, StreamState::Idle);
            self.advance_if_self_initiated(role, address);
        }
        true
    }

    fn opened_on_event(&mut self, role: Role, address: PeerAddress, event: &AvEvent) -> bool {
        // A remote PLAY overrides a remote suspend
        if let AvEvent::RemoteControl(rc) = event {
            if let RcEventKind::RemoteCommand { op } = rc.kind() {
                if op == RC_OP_PLAY
                    && self
                        .peer(role, address)
                        .is_some_and(|peer| peer.check_flags(PeerFlags::REMOTE_SUSPEND))
                {
                    defmt::debug!(
                        "[SM] peer {} : clearing remote suspend on remote PLAY",
                        address
                    );
                    if let Some(peer) = self.peer_mut(role, address) {
                        peer.clear_flags(PeerFlags::REMOTE_SUSPEND);
                    }
                }
            }
        }

        match event {
            AvEvent::StopStreamRequest | AvEvent::SuspendStreamRequest | AvEvent::AclDisconnected => {
                true // Ignore
            }

            AvEvent::StartStreamRequest(params) => {
                if let Some(params) = params {
                    if let Some(peer) = self.peer_mut(role, address) {
                        peer.set_use_latency_mode(params.use_latency_mode);
                    }
                }
                let handle = self.peer_handle(role, address);
                let use_latency_mode = self
                    .peer(role, address)
                    .is_some_and(Peer::use_latency_mode);
                transport::request(TransportRequest::Start {
                    handle,
                    use_latency_mode,
                });
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.set_flags(PeerFlags::PENDING_START);
                }
                true
            }

            AvEvent::StartCompleted(start) => self.opened_start_completed(role, address, *start),

            AvEvent::DisconnectRequest => {
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::Close { handle });
                if self.peer(role, address).is_some_and(Peer::is_remote_source) {
                    transport::request(TransportRequest::RcClose { handle });
                }
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnecting,
                    AvStatus::Success,
                    TransportStatus::Success,
                );
                // Wait in Closing until fully closed
                self.transition_to(role, address, StreamState::Closing);
                true
            }

            AvEvent::CloseCompleted => {
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnecting,
                    AvStatus::Success,
                    TransportStatus::Success,
                );
                if self
                    .peer(role, address)
                    .is_some_and(|peer| peer.check_flags(PeerFlags::PENDING_START))
                {
                    defmt::warn!("[SM] peer {} : failed pending start request", address);
                    audio::command(
                        role,
                        AudioCommandKind::OnStarted {
                            address,
                            status: TransportStatus::FailStream,
                        },
                    );
                    // Pending start flag is cleared on state exit
                } else if self.is_active_peer(role, address) {
                    audio::command(role, AudioCommandKind::OnStopped);
                }
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnected,
                    AvStatus::Success,
                    TransportStatus::Success,
                );
                self.transition_to(role, address, StreamState::Idle);
                true
            }

            AvEvent::ReconfigCompleted { status } => {
                if !status.is_success() {
                    defmt::warn!("[SM] peer {} : failed reconfiguration", address);
                    if self
                        .peer(role, address)
                        .is_some_and(|peer| peer.check_flags(PeerFlags::PENDING_START))
                    {
                        if let Some(peer) = self.peer_mut(role, address) {
                            peer.clear_flags(PeerFlags::PENDING_START);
                        }
                        audio::command(
                            role,
                            AudioCommandKind::OnStarted {
                                address,
                                status: TransportStatus::Fail,
                            },
                        );
                    }
                    self.post_own_event(role, address, AvEvent::DisconnectRequest);
                    return true;
                }
                if self.is_active_peer(role, address) {
                    // Reconfiguration done, restart the pipeline session
                    audio::command(role, AudioCommandKind::StartSession { address });
                }
                if self
                    .peer(role, address)
                    .is_some_and(|peer| peer.check_flags(PeerFlags::PENDING_START))
                {
                    let handle = self.peer_handle(role, address);
                    let use_latency_mode = self
                        .peer(role, address)
                        .is_some_and(Peer::use_latency_mode);
                    transport::request(TransportRequest::Start {
                        handle,
                        use_latency_mode,
                    });
                }
                true
            }

            AvEvent::ConnectRequest => {
                defmt::warn!(
                    "[SM] peer {} : ignoring connect request for connected device",
                    address
                );
                queue::advance();
                true
            }

            AvEvent::OffloadStartRequest => {
                defmt::error!("[SM] peer {} : stream is not started", address);
                audio::command(
                    role,
                    AudioCommandKind::OnOffloadStarted {
                        address,
                        status: TransportStatus::Fail,
                    },
                );
                true
            }

            AvEvent::AvrcpRemotePlay => {
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.clear_flags(PeerFlags::REMOTE_SUSPEND);
                }
                true
            }

            AvEvent::SetLatencyRequest { low_latency } => {
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::SetLatency {
                    handle,
                    low_latency: *low_latency,
                });
                true
            }

            AvEvent::SetCodecModeRequest { mode } => {
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::SetCodecMode {
                    handle,
                    mode: *mode,
                });
                true
            }

            AvEvent::DelayReport { delay } => {
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.set_delay_report(*delay);
                }
                true
            }

            AvEvent::RemoteControl(rc) => {
                rc::forward(address, rc);
                true
            }

            _ => false,
        }
    }

    fn opened_start_completed(
        &mut self,
        role: Role,
        address: PeerAddress,
        start: StartCompleted,
    ) -> bool {
        defmt::info!(
            "[SM] peer {} : start completed status={} suspending={} initiator={}",
            address,
            start.status,
            start.suspending,
            start.initiator
        );

        if start.status.is_success() && start.suspending {
            return true;
        }

        // A remote-initiated start may only drive the shared pipeline if the
        // peer is the active one; otherwise counter it with a suspend
        let mut should_suspend = false;
        if role == Role::Source {
            let flags = self
                .peer(role, address)
                .map(Peer::flags)
                .unwrap_or_default();
            if !flags.check(PeerFlags::PENDING_START | PeerFlags::REMOTE_SUSPEND) {
                defmt::warn!(
                    "[SM] peer {} : triggering suspend, start was remote-initiated",
                    address
                );
                should_suspend = true;
            } else if !self.is_active_peer(role, address) {
                defmt::warn!(
                    "[SM] peer {} : triggering suspend, peer is not active",
                    address
                );
                should_suspend = true;
            }

            audio::command(
                role,
                AudioCommandKind::OnStarted {
                    address,
                    status: start.status,
                },
            );
            if let Some(peer) = self.peer_mut(role, address) {
                peer.clear_flags(PeerFlags::PENDING_START);
            }
        }

        // Remain in Opened if the start failed
        if !start.status.is_success() {
            return false;
        }

        if role == Role::Sink && self.is_active_peer(role, address) {
            // Remove the flush state, ready for streaming
            audio::command(role, AudioCommandKind::SetRxFlush(false));
            audio::command(
                role,
                AudioCommandKind::OnStarted {
                    address,
                    status: start.status,
                },
            );
        }

        if should_suspend {
            self.post_own_event(role, address, AvEvent::SuspendStreamRequest);
        }
        self.transition_to(role, address, StreamState::Started);
        true
    }

    fn started_on_event(&mut self, role: Role, address: PeerAddress, event: &AvEvent) -> bool {
        match event {
            AvEvent::AclDisconnected => true, // Ignore

            AvEvent::StartStreamRequest(_) => {
                // We were started remotely, just ack back the local request
                if role == Role::Source {
                    audio::command(
                        role,
                        AudioCommandKind::OnStarted {
                            address,
                            status: TransportStatus::Success,
                        },
                    );
                }
                true
            }

            AvEvent::StopStreamRequest | AvEvent::SuspendStreamRequest => {
                let stop = matches!(event, AvEvent::StopStreamRequest);

                // A local suspend is already pending, ignore
                if self
                    .peer(role, address)
                    .is_some_and(|peer| peer.check_flags(PeerFlags::LOCAL_SUSPEND_PENDING))
                {
                    return true;
                }

                // The pending flag keeps the pipeline from restarting the
                // stream while the suspend is in progress; a local suspend
                // always overrides a remote one
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.set_flags(PeerFlags::LOCAL_SUSPEND_PENDING);
                    peer.clear_flags(PeerFlags::REMOTE_SUSPEND);
                }

                if role == Role::Source
                    && (self.is_active_peer(role, address) || !self.stream_started_ready())
                {
                    if stop {
                        audio::command(role, AudioCommandKind::OnStopped);
                    } else {
                        // Ensure tx frames are flushed while suspend is pending
                        audio::command(role, AudioCommandKind::SetTxFlush(true));
                    }
                } else if role == Role::Sink {
                    audio::command(role, AudioCommandKind::OnStopped);
                }

                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::Stop {
                    handle,
                    suspend: true,
                });
                true
            }

            AvEvent::DisconnectRequest => {
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::Close { handle });
                if self.peer(role, address).is_some_and(Peer::is_remote_source) {
                    transport::request(TransportRequest::RcClose { handle });
                }
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnecting,
                    AvStatus::Success,
                    TransportStatus::Success,
                );
                self.transition_to(role, address, StreamState::Closing);
                true
            }

            AvEvent::SuspendCompleted(suspend) => {
                self.started_suspend_completed(role, address, *suspend)
            }

            AvEvent::StopCompleted(stop) => {
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.set_flags(PeerFlags::PENDING_STOP);
                    peer.clear_flags(PeerFlags::LOCAL_SUSPEND_PENDING);
                }
                // The encoder state is shared; only the active peer (or a
                // pipeline not started-ready) may stop it
                if self.is_active_peer(role, address) || !self.stream_started_ready() {
                    audio::command(role, AudioCommandKind::OnStopped);
                }
                callback::report_audio_state(role, address, AudioState::Stopped);
                if stop.status.is_success() {
                    self.transition_to(role, address, StreamState::Opened);
                }
                true
            }

            AvEvent::CloseCompleted => {
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnecting,
                    AvStatus::Success,
                    TransportStatus::Success,
                );
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.set_flags(PeerFlags::PENDING_STOP);
                }
                if self.is_active_peer(role, address) {
                    audio::command(role, AudioCommandKind::OnStopped);
                }
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnected,
                    AvStatus::Success,
                    TransportStatus::Success,
                );
                self.transition_to(role, address, StreamState::Idle);
                true
            }

            AvEvent::OffloadStartRequest => {
                if self.peer(role, address).is_some_and(|peer| {
                    peer.check_flags(
                        PeerFlags::LOCAL_SUSPEND_PENDING
                            | PeerFlags::REMOTE_SUSPEND
                            | PeerFlags::PENDING_STOP,
                    )
                }) {
                    defmt::warn!("[SM] peer {} : stream is suspending, failing offload", address);
                    audio::command(
                        role,
                        AudioCommandKind::OnOffloadStarted {
                            address,
                            status: TransportStatus::Fail,
                        },
                    );
                } else {
                    let handle = self.peer_handle(role, address);
                    transport::request(TransportRequest::OffloadStart { handle });
                }
                true
            }

            AvEvent::OffloadStartResponse { status } => {
                audio::command(
                    role,
                    AudioCommandKind::OnOffloadStarted {
                        address,
                        status: *status,
                    },
                );
                true
            }

            AvEvent::SetLatencyRequest { low_latency } => {
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::SetLatency {
                    handle,
                    low_latency: *low_latency,
                });
                true
            }

            AvEvent::SetCodecModeRequest { mode } => {
                let handle = self.peer_handle(role, address);
                transport::request(TransportRequest::SetCodecMode {
                    handle,
                    mode: *mode,
                });
                true
            }

            AvEvent::DelayReport { delay } => {
                if let Some(peer) = self.peer_mut(role, address) {
                    peer.set_delay_report(*delay);
                }
                true
            }

            AvEvent::RemoteControl(rc) => {
                rc::forward(address, rc);
                true
            }

            _ => false,
        }
    }

    fn started_suspend_completed(
        &mut self,
        role: Role,
        address: PeerAddress,
        suspend: SuspendCompleted,
    ) -> bool {
        defmt::info!(
            "[SM] peer {} : suspend completed status={} initiator={}",
            address,
            suspend.status,
            suspend.initiator
        );

        // Stop the shared encoder/decoder until resumed
        if self.is_active_peer(role, address) || !self.stream_started_ready() {
            audio::command(
                role,
                AudioCommandKind::OnSuspended {
                    initiator: suspend.initiator,
                },
            );
        }

        // If not successful, remain in Started
        if !suspend.status.is_success() {
            if let Some(peer) = self.peer_mut(role, address) {
                peer.clear_flags(PeerFlags::LOCAL_SUSPEND_PENDING);
            }
            if role == Role::Source && self.is_active_peer(role, address) {
                // Suspend failed, reset the tx flush state
                audio::command(role, AudioCommandKind::SetTxFlush(false));
            }
            return false;
        }

        let mut state = AudioState::RemoteSuspend;
        if suspend.initiator {
            state = AudioState::Stopped;
        } else if !self
            .peer(role, address)
            .is_some_and(|peer| peer.check_flags(PeerFlags::LOCAL_SUSPEND_PENDING))
        {
            // Remote suspend blocks the pipeline from restarting the stream
            // unless a local suspend was already tracked
            if let Some(peer) = self.peer_mut(role, address) {
                peer.set_flags(PeerFlags::REMOTE_SUSPEND);
            }
        }
        callback::report_audio_state(role, address, state);
        self.transition_to(role, address, StreamState::Opened);
        true
    }

    fn closing_on_event(&mut self, role: Role, address: PeerAddress, event: &AvEvent) -> bool {
        match event {
            AvEvent::SuspendStreamRequest | AvEvent::AclDisconnected => true, // Ignore

            AvEvent::StopCompleted(_) | AvEvent::StopStreamRequest => {
                if self.is_active_peer(role, address) {
                    audio::command(role, AudioCommandKind::OnStopped);
                }
                true
            }

            AvEvent::CloseCompleted => {
                callback::report_connection_state(
                    role,
                    address,
                    ConnectionState::Disconnected,
                    AvStatus::Success,
                    TransportStatus::Success,
                );
                self.transition_to(role, address, StreamState::Idle);
                true
            }

            AvEvent::RemoteControl(rc)
                if matches!(rc.kind(), RcEventKind::Close | RcEventKind::BrowseClose) =>
            {
                rc::forward(address, rc);
                true
            }

            AvEvent::OffloadStartRequest => {
                defmt::error!("[SM] peer {} : stream is not opened", address);
                audio::command(
                    role,
                    AudioCommandKind::OnOffloadStarted {
                        address,
                        status: TransportStatus::Fail,
                    },
                );
                true
            }

            AvEvent::ConnectRequest => {
                defmt::warn!("[SM] peer {} : ignoring connect request while closing", address);
                queue::advance();
                self.transition_to(role, address, StreamState::Idle);
                true
            }

            _ => false,
        }
    }

    /// Once the transport reports the peer's real endpoint role, migrate the
    /// peer to the other registry if it was created under the wrong
    /// assumption. Returns the local role serving the peer afterwards.
    fn reconcile_endpoint_role(
        &mut self,
        role: Role,
        address: PeerAddress,
        reported: Role,
    ) -> Role {
        if !self.coexist {
            return role;
        }
        self.registry_mut(role).set_invalid_peer_check(false);
        let assumed = role.opposite();
        if assumed != reported {
            let to = reported.opposite();
            if self.move_peer(address, role, to) {
                return to;
            }
        }
        role
    }

    fn cancel_open_fallback(&mut self, role: Role, address: PeerAddress) {
        defmt::debug!("[SM] peer {} : stopping open-fallback timer", address);
        if let Some(peer) = self.peer_mut(role, address) {
            peer.cancel_open_fallback();
        }
    }

    fn peer_handle(&self, role: Role, address: PeerAddress) -> TransportHandle {
        self.peer(role, address)
            .map_or(TransportHandle::UNKNOWN, Peer::handle)
    }

    fn advance_if_self_initiated(&self, role: Role, address: PeerAddress) {
        if self
            .peer(role, address)
            .is_some_and(Peer::self_initiated_connection)
        {
            queue::advance();
        }
    }

    /// Post an event for one of our own peers back onto the home queue
    pub(crate) fn post_own_event(&self, role: Role, address: PeerAddress, event: AvEvent) {
        let request = HomeRequest::Event {
            endpoint_role: Some(role.opposite()),
            address,
            handle: TransportHandle::UNKNOWN,
            event,
        };
        if crate::HOME_CHANNEL.try_send(request).is_err() {
            defmt::error!("[SM] home channel full, dropping self-posted event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AvInitOptions;
    use crate::audio::AudioCommand;
    use crate::callback::AvCallback;
    use crate::constants::MAX_PEERS_PER_ROLE;
    use crate::test_support;

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn source_ctx(max_connected_peers: usize) -> AvContext {
        let mut ctx = AvContext::default();
        ctx.init_role(Role::Source, AvInitOptions { max_connected_peers });
        for id in 0..MAX_PEERS_PER_ROLE as u8 {
            ctx.handle_event(
                Some(Role::Sink),
                PeerAddress::EMPTY,
                TransportHandle::UNKNOWN,
                AvEvent::Registered {
                    peer_id: id,
                    handle: TransportHandle(id),
                    endpoint_role: Role::Sink,
                },
            );
        }
        test_support::drain_channels();
        ctx
    }

    fn open_success(endpoint_role: Role) -> AvEvent {
        AvEvent::OpenCompleted(OpenCompleted {
            status: TransportStatus::Success,
            endpoint_role,
            edr: crate::peer::EDR_2MBPS,
        })
    }

    fn connect_to_opened(ctx: &mut AvContext, address: PeerAddress) {
        ctx.handle_event(
            Some(Role::Sink),
            address,
            TransportHandle::UNKNOWN,
            AvEvent::ConnectRequest,
        );
        ctx.handle_event(
            Some(Role::Sink),
            address,
            TransportHandle::UNKNOWN,
            open_success(Role::Sink),
        );
        assert_eq!(
            ctx.peer_state(Role::Source, address),
            Some(StreamState::Opened)
        );
    }

    fn drain_transport() -> std::vec::Vec<TransportRequest> {
        let mut requests = std::vec::Vec::new();
        while let Ok(request) = crate::TRANSPORT_CHANNEL.try_receive() {
            requests.push(request);
        }
        requests
    }

    #[test]
    fn test_connect_flow_reaches_opened() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::ConnectRequest,
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Opening));

        let requests = drain_transport();
        assert!(requests.contains(&TransportRequest::Open {
            address: x,
            handle: TransportHandle(0),
        }));
        assert!(matches!(
            crate::CALLBACK_CHANNEL.try_receive(),
            Ok(AvCallback::ConnectionState {
                state: ConnectionState::Connecting,
                ..
            })
        ));

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            open_success(Role::Sink),
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Opened));
        assert!(ctx.peer(Role::Source, x).unwrap().is_edr());
        assert!(matches!(
            crate::CALLBACK_CHANNEL.try_receive(),
            Ok(AvCallback::ConnectionState {
                state: ConnectionState::Connected,
                ..
            })
        ));
        // The self-initiated attempt advanced the admission queue once
        assert!(crate::QUEUE_CHANNEL.try_receive().is_ok());
        assert!(crate::QUEUE_CHANNEL.try_receive().is_err());
    }

    #[test]
    fn test_admission_rejects_second_peer_at_capacity() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        let y = addr(2);
        connect_to_opened(&mut ctx, x);
        test_support::drain_channels();

        assert!(!ctx.allowed_to_connect(Role::Source, y));
        assert!(ctx.allowed_to_connect(Role::Source, x)); // already accounted

        ctx.handle_event(
            Some(Role::Sink),
            y,
            TransportHandle::UNKNOWN,
            AvEvent::ConnectRequest,
        );
        // The rejected peer never leaves Idle and is told to disconnect
        assert_eq!(ctx.peer_state(Role::Source, y), Some(StreamState::Idle));
        match crate::HOME_CHANNEL.try_receive() {
            Ok(HomeRequest::Event { address, event, .. }) => {
                assert_eq!(address, y);
                assert_eq!(event, AvEvent::DisconnectRequest);
            }
            other => panic!("expected posted disconnect, got {other:?}"),
        }
        // The queue still advances exactly once for the failed attempt
        assert!(crate::QUEUE_CHANNEL.try_receive().is_ok());
        assert!(crate::QUEUE_CHANNEL.try_receive().is_err());
        // No transport open was issued for the rejected peer
        assert!(
            !drain_transport()
                .iter()
                .any(|request| matches!(request, TransportRequest::Open { address, .. } if *address == y))
        );
    }

    #[test]
    fn test_suspend_request_is_idempotent_in_started() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        connect_to_opened(&mut ctx, x);
        ctx.set_active_peer(Role::Source, x).unwrap();

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StartStreamRequest(None),
        );
        assert!(
            ctx.peer(Role::Source, x)
                .unwrap()
                .check_flags(PeerFlags::PENDING_START)
        );
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StartCompleted(StartCompleted {
                status: TransportStatus::Success,
                suspending: false,
                initiator: true,
            }),
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Started));
        test_support::drain_channels();

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::SuspendStreamRequest,
        );
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::SuspendStreamRequest,
        );
        // LocalSuspendPending gates the second request
        let stops = drain_transport()
            .into_iter()
            .filter(|request| matches!(request, TransportRequest::Stop { .. }))
            .count();
        assert_eq!(stops, 1);

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::SuspendCompleted(SuspendCompleted {
                status: TransportStatus::Success,
                initiator: true,
            }),
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Opened));
    }

    #[test]
    fn test_remote_start_on_non_active_peer_is_counter_suspended() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(2);
        let x = addr(1);
        let y = addr(2);
        connect_to_opened(&mut ctx, x);
        connect_to_opened(&mut ctx, y);
        ctx.set_active_peer(Role::Source, x).unwrap();
        ctx.peer_mut(Role::Source, y)
            .unwrap()
            .set_flags(PeerFlags::REMOTE_SUSPEND);
        test_support::drain_channels();

        // Remote-initiated start success for the non-active peer
        ctx.handle_event(
            Some(Role::Sink),
            y,
            TransportHandle::UNKNOWN,
            AvEvent::StartCompleted(StartCompleted {
                status: TransportStatus::Success,
                suspending: false,
                initiator: false,
            }),
        );
        // State remains Started until the counter-suspend completes
        assert_eq!(ctx.peer_state(Role::Source, y), Some(StreamState::Started));
        let request = crate::HOME_CHANNEL.try_receive().unwrap();
        match &request {
            HomeRequest::Event { address, event, .. } => {
                assert_eq!(*address, y);
                assert_eq!(*event, AvEvent::SuspendStreamRequest);
            }
            other => panic!("expected counter-suspend, got {other:?}"),
        }
        ctx.process_request(request);
        assert!(
            drain_transport()
                .iter()
                .any(|request| matches!(request, TransportRequest::Stop { suspend: true, .. }))
        );

        ctx.handle_event(
            Some(Role::Sink),
            y,
            TransportHandle::UNKNOWN,
            AvEvent::SuspendCompleted(SuspendCompleted {
                status: TransportStatus::Success,
                initiator: true,
            }),
        );
        assert_eq!(ctx.peer_state(Role::Source, y), Some(StreamState::Opened));
    }

    #[test]
    fn test_link_drop_in_opening_returns_to_idle_and_advances_queue() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::ConnectRequest,
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Opening));
        test_support::drain_channels();

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::AclDisconnected,
        );
        assert!(matches!(
            crate::CALLBACK_CHANNEL.try_receive(),
            Ok(AvCallback::ConnectionState {
                state: ConnectionState::Disconnected,
                status: AvStatus::Fail,
                ..
            })
        ));
        // Exactly one queue advance for the self-initiated attempt
        assert!(crate::QUEUE_CHANNEL.try_receive().is_ok());
        assert!(crate::QUEUE_CHANNEL.try_receive().is_err());
        // The peer re-entered Idle and was purged after the dispatch step
        assert!(ctx.peer(Role::Source, x).is_none());
    }

    #[test]
    fn test_remote_control_only_open_arms_fallback_timer() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::AvrcpOpen,
        );
        let deadline = ctx
            .peer(Role::Source, x)
            .unwrap()
            .open_fallback_deadline()
            .expect("fallback timer armed");
        test_support::drain_channels();

        // Timer fire issues a connect request for the peer
        ctx.process_open_fallback(deadline);
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Opening));
        assert!(
            ctx.peer(Role::Source, x)
                .unwrap()
                .open_fallback_deadline()
                .is_none()
        );
        assert!(
            drain_transport()
                .iter()
                .any(|request| matches!(request, TransportRequest::Open { address, .. } if *address == x))
        );
    }

    #[test]
    fn test_fallback_timer_cancelled_when_transport_connects_first() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::AvrcpOpen,
        );
        assert!(
            ctx.peer(Role::Source, x)
                .unwrap()
                .open_fallback_deadline()
                .is_some()
        );

        // The transport connection arrives before the timer fires
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::IncomingConnection,
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Opening));
        // Cancelled on Idle exit: the timer can never fire now
        assert!(
            ctx.peer(Role::Source, x)
                .unwrap()
                .open_fallback_deadline()
                .is_none()
        );
    }

    #[test]
    fn test_fallback_timer_cancelled_on_remote_control_close() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::AvrcpOpen,
        );
        assert!(
            ctx.peer(Role::Source, x)
                .unwrap()
                .open_fallback_deadline()
                .is_some()
        );

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::AvrcpClose,
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Idle));
        assert!(
            ctx.peer(Role::Source, x)
                .unwrap()
                .open_fallback_deadline()
                .is_none()
        );
    }

    #[test]
    fn test_disconnect_from_started_closes_and_releases_active_peer() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        connect_to_opened(&mut ctx, x);
        ctx.set_active_peer(Role::Source, x).unwrap();
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StartStreamRequest(None),
        );
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StartCompleted(StartCompleted {
                status: TransportStatus::Success,
                suspending: false,
                initiator: true,
            }),
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Started));
        test_support::drain_channels();

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::DisconnectRequest,
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Closing));
        // The active peer's tx path is flushed while the close completes
        assert!(matches!(
            crate::AUDIO_CHANNEL.try_receive(),
            Ok(AudioCommand {
                kind: AudioCommandKind::SetTxFlush(true),
                ..
            })
        ));

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::CloseCompleted,
        );
        // Idle re-entry released the active-peer slot and purged the peer
        assert!(ctx.peer(Role::Source, x).is_none());
        assert!(ctx.source.active_peer().is_empty());
    }

    #[test]
    fn test_stop_and_suspend_ignored_in_opening() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::ConnectRequest,
        );
        test_support::drain_channels();

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::SuspendStreamRequest,
        );
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StopStreamRequest,
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Opening));
        assert!(drain_transport().is_empty());
    }

    #[test]
    fn test_failed_suspend_remains_started_and_unflushes() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        connect_to_opened(&mut ctx, x);
        ctx.set_active_peer(Role::Source, x).unwrap();
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StartStreamRequest(None),
        );
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StartCompleted(StartCompleted {
                status: TransportStatus::Success,
                suspending: false,
                initiator: true,
            }),
        );
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::SuspendStreamRequest,
        );
        test_support::drain_channels();

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::SuspendCompleted(SuspendCompleted {
                status: TransportStatus::Fail,
                initiator: true,
            }),
        );
        assert_eq!(ctx.peer_state(Role::Source, x), Some(StreamState::Started));
        assert!(
            !ctx.peer(Role::Source, x)
                .unwrap()
                .check_flags(PeerFlags::LOCAL_SUSPEND_PENDING)
        );
        // Suspend failed: the tx flush state is reset
        assert!(
            std::iter::from_fn(|| crate::AUDIO_CHANNEL.try_receive().ok())
                .any(|command| command.kind == AudioCommandKind::SetTxFlush(false))
        );
    }

    #[test]
    fn test_remote_play_clears_remote_suspend_in_opened() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        connect_to_opened(&mut ctx, x);
        ctx.peer_mut(Role::Source, x)
            .unwrap()
            .set_flags(PeerFlags::REMOTE_SUSPEND);

        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::RemoteControl(
                RcEvent::new(RcEventKind::RemoteCommand { op: RC_OP_PLAY }, &[]).unwrap(),
            ),
        );
        assert!(
            !ctx.peer(Role::Source, x)
                .unwrap()
                .check_flags(PeerFlags::REMOTE_SUSPEND)
        );
        // The remote-control event itself is forwarded, not interpreted
        assert!(crate::RC_CHANNEL.try_receive().is_ok());
    }

    #[test]
    fn test_unrecognized_event_is_reported_unhandled() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::AvrcpOpen,
        );
        // A start completion makes no sense in Idle
        assert!(!ctx.process_peer_event(
            Role::Source,
            x,
            &AvEvent::StartCompleted(StartCompleted {
                status: TransportStatus::Success,
                suspending: false,
                initiator: false,
            }),
        ));
    }

    #[test]
    fn test_offload_gated_by_pending_suspend() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = source_ctx(1);
        let x = addr(1);
        connect_to_opened(&mut ctx, x);
        ctx.set_active_peer(Role::Source, x).unwrap();
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StartStreamRequest(None),
        );
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::StartCompleted(StartCompleted {
                status: TransportStatus::Success,
                suspending: false,
                initiator: true,
            }),
        );
        test_support::drain_channels();

        // No suspend in flight: the offload request reaches the transport
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::OffloadStartRequest,
        );
        assert!(
            drain_transport()
                .iter()
                .any(|request| matches!(request, TransportRequest::OffloadStart { .. }))
        );

        // With a suspend in flight the offload fails closed
        ctx.peer_mut(Role::Source, x)
            .unwrap()
            .set_flags(PeerFlags::LOCAL_SUSPEND_PENDING);
        ctx.handle_event(
            Some(Role::Sink),
            x,
            TransportHandle::UNKNOWN,
            AvEvent::OffloadStartRequest,
        );
        assert!(drain_transport().is_empty());
        assert!(
            std::iter::from_fn(|| crate::AUDIO_CHANNEL.try_receive().ok()).any(|command| matches!(
                command.kind,
                AudioCommandKind::OnOffloadStarted {
                    status: TransportStatus::Fail,
                    ..
                }
            ))
        );
    }
}
