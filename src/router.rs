//! Dispatch / Routing
//!
//! Resolves an incoming event, which may arrive with only a transport
//! handle, only an address, or a role-ambiguous device, to exactly one
//! peer and its owning registry, creating the peer on first contact subject
//! to the registry's admission control, and feeds the event to that peer's
//! state machine. Everything here runs on the home context.
//!
//! When the role hint is ambiguous (device seen before its role is known),
//! both registries are searched. If no peer exists anywhere the device is
//! assumed to be a sink endpoint; otherwise the already-populated registry
//! wins, avoiding spurious dual-role churn. A wrongly-placed peer is
//! migrated between registries once the transport reports the real role at
//! open time.

use crate::audio::{self, AudioCommandKind};
use crate::constants::MAX_PEERS_PER_ROLE;
use crate::event::{AvEvent, HomeRequest, HomeResponse};
use crate::peer::Peer;
use crate::queue;
use crate::transport::TransportHandle;
use crate::{AvContext, AvError, PeerAddress, RESPONSE_CHANNEL, Role};
use embassy_time::Instant;
use heapless::Vec;

fn respond(response: HomeResponse) {
    if RESPONSE_CHANNEL.try_send(response).is_err() {
        defmt::warn!("[ROUTER] response channel full");
    }
}

impl AvContext {
    /// Process one request from the home queue
    pub(crate) fn process_request(&mut self, request: HomeRequest) {
        match request {
            HomeRequest::Event {
                endpoint_role,
                address,
                handle,
                event,
            } => self.handle_event(endpoint_role, address, handle, event),

            HomeRequest::SetActivePeer { role, address } => {
                let result = if self.registry(role).enabled() {
                    self.set_active_peer(role, address)
                } else {
                    Err(AvError::NotEnabled)
                };
                respond(HomeResponse::ActivePeerSet(result));
            }

            HomeRequest::UpdateCodecConfig {
                address,
                preferences,
            } => {
                let result = self.update_codec_config(address, preferences);
                respond(HomeResponse::CodecConfigUpdated(result));
            }

            HomeRequest::SetSilence { address, silence } => {
                let result = self.set_silence_peer(address, silence);
                respond(HomeResponse::SilenceSet(result));
            }

            HomeRequest::QuerySilence { address } => {
                respond(HomeResponse::Silence(self.is_peer_silenced(address)));
            }

            HomeRequest::StreamSuspend { stop, address } => self.stream_suspend(stop, address),

            HomeRequest::ClearRemoteSuspend => self.clear_remote_suspend(),

            HomeRequest::Cleanup { role } => self.cleanup_role(role),
        }
    }

    /// Deliver one event to the peer it resolves to, creating the peer on
    /// first contact. Unresolvable events are dropped with a warning, never
    /// silently retried.
    pub(crate) fn handle_event(
        &mut self,
        endpoint_role: Option<Role>,
        address: PeerAddress,
        handle: TransportHandle,
        event: AvEvent,
    ) {
        match &event {
            AvEvent::Enabled => return, // Nothing to do
            AvEvent::Registered {
                peer_id,
                handle,
                endpoint_role: registered_role,
            } => {
                let endpoint = endpoint_role.unwrap_or(*registered_role);
                self.registry_mut(endpoint.opposite())
                    .handle_registered(*peer_id, *handle);
                return; // Nothing else to do
            }
            _ => {}
        }

        let Some((role, address)) = self.resolve_peer(endpoint_role, address, handle) else {
            defmt::warn!(
                "[ROUTER] cannot find or create peer for address {} handle {}: {} dropped",
                address,
                handle,
                event.kind()
            );
            // A failed-closed connect attempt must still release the
            // admission queue for the next request
            if matches!(event, AvEvent::ConnectRequest) {
                queue::advance();
            }
            return;
        };

        self.process_peer_event(role, address, &event);

        // Deferred purge: peers that re-entered Idle during this dispatch
        // step are removed only once their handler has fully unwound
        if self.purge_pending {
            self.purge_pending = false;
            self.source.delete_idle_peers();
            self.sink.delete_idle_peers();
        }
    }

    fn resolve_peer(
        &mut self,
        endpoint_role: Option<Role>,
        address: PeerAddress,
        handle: TransportHandle,
    ) -> Option<(Role, PeerAddress)> {
        if self.coexist {
            return self.resolve_peer_coexist(endpoint_role, address, handle);
        }

        if !address.is_empty() {
            let role = endpoint_role?.opposite();
            return self.ensure_peer(role, address, handle).then_some((role, address));
        }
        if !handle.is_unknown() {
            let role = endpoint_role?.opposite();
            return self
                .registry(role)
                .address_by_handle(handle)
                .map(|address| (role, address));
        }
        None
    }

    fn resolve_peer_coexist(
        &mut self,
        endpoint_role: Option<Role>,
        address: PeerAddress,
        handle: TransportHandle,
    ) -> Option<(Role, PeerAddress)> {
        if !address.is_empty() {
            if self.both_enabled() {
                if let Some(peer) = self.find_peer_any(address) {
                    return Some((peer.local_role(), address));
                }
                let role = match endpoint_role {
                    Some(endpoint) => endpoint.opposite(),
                    None => {
                        // Role still unknown: defer the admission decision
                        // and side with whichever registry is already
                        // populated, defaulting to a sink-endpoint device
                        self.source.set_invalid_peer_check(true);
                        if self.source.has_peers() {
                            Role::Source
                        } else if self.sink.has_peers() {
                            Role::Sink
                        } else {
                            Role::Source
                        }
                    }
                };
                if self.ensure_peer(role, address, handle) {
                    return Some((role, address));
                }
            } else if let Some(endpoint) = endpoint_role {
                let role = endpoint.opposite();
                if self.ensure_peer(role, address, handle) {
                    return Some((role, address));
                }
            }
            // Fall back to a handle lookup in the hinted registry
            if !handle.is_unknown() {
                let role = endpoint_role?.opposite();
                return self
                    .registry(role)
                    .address_by_handle(handle)
                    .map(|address| (role, address));
            }
            return None;
        }

        if !handle.is_unknown() {
            return match endpoint_role {
                Some(endpoint) => {
                    let role = endpoint.opposite();
                    self.registry(role)
                        .address_by_handle(handle)
                        .map(|address| (role, address))
                }
                None => self
                    .source
                    .address_by_handle(handle)
                    .map(|address| (Role::Source, address))
                    .or_else(|| {
                        self.sink
                            .address_by_handle(handle)
                            .map(|address| (Role::Sink, address))
                    }),
            };
        }
        None
    }

    /// Suspend or stop streaming. With an address the request goes to that
    /// peer; without one every started source-role peer is suspended, and if
    /// none is streaming the pipeline is acked stopped directly so a pending
    /// reconfiguration cannot stall it.
    pub(crate) fn stream_suspend(&mut self, stop: bool, address: Option<PeerAddress>) {
        if let Some(address) = address {
            self.handle_event(
                Some(Role::Sink),
                address,
                TransportHandle::UNKNOWN,
                AvEvent::StopStreamRequest,
            );
            return;
        }

        let started: Vec<PeerAddress, MAX_PEERS_PER_ROLE> = self
            .source
            .peers()
            .filter(|peer| peer.is_streaming())
            .map(Peer::address)
            .collect();
        if started.is_empty() {
            audio::command(Role::Source, AudioCommandKind::OnStopped);
            return;
        }
        let event = if stop {
            AvEvent::StopStreamRequest
        } else {
            AvEvent::SuspendStreamRequest
        };
        for address in started {
            self.handle_event(
                Some(Role::Sink),
                address,
                TransportHandle::UNKNOWN,
                event.clone(),
            );
        }
    }

    /// Auto-initiate transport connections for peers whose open-fallback
    /// deadline expired. Timers fire on the home context by construction.
    pub(crate) fn process_open_fallback(&mut self, now: Instant) {
        for role in [Role::Source, Role::Sink] {
            let expired = self.registry_mut(role).take_expired_fallbacks(now);
            for address in expired {
                if !self.registry(role).enabled() {
                    continue;
                }
                defmt::info!(
                    "[ROUTER] open fallback expired, connecting to peer {}",
                    address
                );
                self.handle_event(
                    Some(role.opposite()),
                    address,
                    TransportHandle::UNKNOWN,
                    AvEvent::ConnectRequest,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{OpenCompleted, TransportStatus};
    use crate::peer::StreamState;
    use crate::test_support;
    use crate::{AvContextOptions, AvInitOptions};

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0xA0, 0xB0, 0xC0, 0xD0, 0xE0, last])
    }

    fn register_handles(ctx: &mut AvContext, endpoint: Role) {
        for id in 0..MAX_PEERS_PER_ROLE as u8 {
            ctx.handle_event(
                Some(endpoint),
                PeerAddress::EMPTY,
                TransportHandle::UNKNOWN,
                AvEvent::Registered {
                    peer_id: id,
                    handle: TransportHandle(id),
                    endpoint_role: endpoint,
                },
            );
        }
    }

    fn sink_ctx() -> AvContext {
        let mut ctx = AvContext::default();
        ctx.init_role(Role::Sink, AvInitOptions::default());
        register_handles(&mut ctx, Role::Source);
        ctx
    }

    #[test]
    fn test_unresolvable_event_is_dropped() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = sink_ctx();
        test_support::drain_channels();

        // Unknown handle, no address: nothing to deliver to
        ctx.handle_event(
            Some(Role::Source),
            PeerAddress::EMPTY,
            TransportHandle(5),
            AvEvent::CloseCompleted,
        );
        assert!(!ctx.sink.has_peers());
        assert!(crate::CALLBACK_CHANNEL.try_receive().is_err());
    }

    #[test]
    fn test_failed_peer_creation_still_advances_queue() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = AvContext::default();
        ctx.init_role(Role::Source, AvInitOptions::default());
        test_support::drain_channels();

        // No Registered events yet: the connect attempt fails closed but the
        // admission queue must not deadlock
        ctx.handle_event(
            Some(Role::Sink),
            addr(9),
            TransportHandle::UNKNOWN,
            AvEvent::ConnectRequest,
        );
        assert!(ctx.source.find_peer(addr(9)).is_none());
        assert!(crate::QUEUE_CHANNEL.try_receive().is_ok());
        assert!(crate::QUEUE_CHANNEL.try_receive().is_err());
    }

    #[test]
    fn test_registered_events_populate_handle_table() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let ctx = sink_ctx();
        assert_eq!(
            ctx.registry(Role::Sink).handle_for_peer_id(3),
            Some(TransportHandle(3))
        );
    }

    #[test]
    fn test_remote_source_auto_elected_active_on_opened() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = sink_ctx();
        test_support::drain_channels();

        let peer = addr(1);
        ctx.handle_event(
            Some(Role::Source),
            peer,
            TransportHandle::UNKNOWN,
            AvEvent::IncomingConnection,
        );
        assert_eq!(ctx.peer_state(Role::Sink, peer), Some(StreamState::Opening));

        ctx.handle_event(
            Some(Role::Source),
            peer,
            TransportHandle::UNKNOWN,
            AvEvent::OpenCompleted(OpenCompleted {
                status: TransportStatus::Success,
                endpoint_role: Role::Source,
                edr: 0,
            }),
        );
        assert_eq!(ctx.peer_state(Role::Sink, peer), Some(StreamState::Opened));
        // Entering Opened with no sink-role active peer elects this one
        assert_eq!(ctx.sink.active_peer(), peer);
        assert_eq!(
            ctx.find_active_peer().map(Peer::address),
            Some(peer)
        );
    }

    #[test]
    fn test_coexist_unknown_role_defaults_to_source_registry() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = AvContext::new(AvContextOptions { coexist: true });
        ctx.init_role(Role::Source, AvInitOptions::default());
        ctx.init_role(Role::Sink, AvInitOptions::default());
        register_handles(&mut ctx, Role::Sink);
        register_handles(&mut ctx, Role::Source);
        test_support::drain_channels();

        let device = addr(2);
        ctx.handle_event(
            None,
            device,
            TransportHandle::UNKNOWN,
            AvEvent::IncomingConnection,
        );
        // No peer of either role existed: assumed to be a sink endpoint
        assert!(ctx.source.find_peer(device).is_some());
        assert!(ctx.sink.find_peer(device).is_none());
        assert_eq!(
            ctx.peer_state(Role::Source, device),
            Some(StreamState::Opening)
        );
    }

    #[test]
    fn test_coexist_unknown_role_follows_populated_registry() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = AvContext::new(AvContextOptions { coexist: true });
        ctx.init_role(Role::Source, AvInitOptions::default());
        ctx.init_role(Role::Sink, AvInitOptions::default());
        register_handles(&mut ctx, Role::Sink);
        register_handles(&mut ctx, Role::Source);

        // A known remote source populates the sink registry first
        ctx.handle_event(
            Some(Role::Source),
            addr(3),
            TransportHandle::UNKNOWN,
            AvEvent::AvrcpOpen,
        );
        assert!(ctx.sink.find_peer(addr(3)).is_some());
        test_support::drain_channels();

        // An unknown-role device now lands in the populated registry
        ctx.handle_event(
            None,
            addr(4),
            TransportHandle::UNKNOWN,
            AvEvent::AvrcpOpen,
        );
        assert!(ctx.sink.find_peer(addr(4)).is_some());
        assert!(ctx.source.find_peer(addr(4)).is_none());
    }

    #[test]
    fn test_misplaced_peer_migrates_at_open_time() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = AvContext::new(AvContextOptions { coexist: true });
        ctx.init_role(Role::Source, AvInitOptions::default());
        ctx.init_role(Role::Sink, AvInitOptions::default());
        register_handles(&mut ctx, Role::Sink);
        register_handles(&mut ctx, Role::Source);
        test_support::drain_channels();

        let device = addr(5);
        ctx.handle_event(
            None,
            device,
            TransportHandle::UNKNOWN,
            AvEvent::IncomingConnection,
        );
        assert!(ctx.source.find_peer(device).is_some());

        // The transport reveals the device is really a source endpoint
        ctx.handle_event(
            None,
            device,
            TransportHandle::UNKNOWN,
            AvEvent::OpenCompleted(OpenCompleted {
                status: TransportStatus::Success,
                endpoint_role: Role::Source,
                edr: 0,
            }),
        );
        assert!(ctx.source.find_peer(device).is_none());
        let migrated = ctx.sink.find_peer(device).unwrap();
        assert_eq!(migrated.endpoint_role(), Role::Source);
        assert_eq!(migrated.state(), StreamState::Opened);
    }

    #[test]
    fn test_set_active_peer_request_always_resolves() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = sink_ctx();
        let peer = addr(6);
        ctx.handle_event(
            Some(Role::Source),
            peer,
            TransportHandle::UNKNOWN,
            AvEvent::IncomingConnection,
        );
        ctx.handle_event(
            Some(Role::Source),
            peer,
            TransportHandle::UNKNOWN,
            AvEvent::OpenCompleted(OpenCompleted {
                status: TransportStatus::Success,
                endpoint_role: Role::Source,
                edr: 0,
            }),
        );
        assert_eq!(ctx.sink.active_peer(), peer);
        test_support::drain_channels();

        // Re-electing the already-active peer is a no-op that still resolves
        // its completion, every time
        ctx.process_request(HomeRequest::SetActivePeer {
            role: Role::Sink,
            address: peer,
        });
        ctx.process_request(HomeRequest::SetActivePeer {
            role: Role::Sink,
            address: peer,
        });
        assert_eq!(
            crate::RESPONSE_CHANNEL.try_receive().unwrap(),
            HomeResponse::ActivePeerSet(Ok(()))
        );
        assert_eq!(
            crate::RESPONSE_CHANNEL.try_receive().unwrap(),
            HomeResponse::ActivePeerSet(Ok(()))
        );
    }

    #[test]
    fn test_cleanup_releases_active_peer_and_drains_registry() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = sink_ctx();
        let peer = addr(7);
        ctx.handle_event(
            Some(Role::Source),
            peer,
            TransportHandle::UNKNOWN,
            AvEvent::IncomingConnection,
        );
        ctx.handle_event(
            Some(Role::Source),
            peer,
            TransportHandle::UNKNOWN,
            AvEvent::OpenCompleted(OpenCompleted {
                status: TransportStatus::Success,
                endpoint_role: Role::Source,
                edr: 0,
            }),
        );
        assert_eq!(ctx.sink.active_peer(), peer);
        test_support::drain_channels();

        ctx.process_request(HomeRequest::Cleanup { role: Role::Sink });
        assert!(!ctx.sink.enabled());
        assert!(!ctx.sink.has_peers());
        assert!(ctx.sink.active_peer().is_empty());
        // The registered stream endpoints were released
        assert!(
            std::iter::from_fn(|| crate::TRANSPORT_CHANNEL.try_receive().ok()).any(|request| {
                matches!(request, crate::transport::TransportRequest::Deregister { .. })
            })
        );
    }

    #[test]
    fn test_stream_suspend_without_streams_acks_pipeline() {
        let _guard = test_support::serialize();
        test_support::drain_channels();

        let mut ctx = AvContext::default();
        ctx.init_role(Role::Source, AvInitOptions::default());
        test_support::drain_channels();

        ctx.stream_suspend(false, None);
        let command = crate::AUDIO_CHANNEL.try_receive().unwrap();
        assert_eq!(command.role, Role::Source);
        assert_eq!(command.kind, AudioCommandKind::OnStopped);
    }
}
