//! Role Registries
//!
//! One [`PeerRegistry`] exists per local profile role. A registry owns every
//! [`Peer`] for its role in a bounded table, tracks the single *active* peer
//! bound to the shared audio pipeline, enforces the admission limit, and
//! keeps the peer-id ↔ transport-handle bookkeeping.
//!
//! Cross-registry concerns (coexist-mode admission, peer migration once the
//! transport reports a device's real role, active-peer hand-off) are
//! coordinated by [`AvContext`], never by a registry or a peer on its own.

use crate::audio::{self, AudioCommandKind};
use crate::constants::MAX_PEERS_PER_ROLE;
use crate::peer::{Peer, PeerFlags, StreamState};
use crate::transport::{self, TransportHandle, TransportRequest};
use crate::{AvContext, AvError, AvInitOptions, PeerAddress, Role};
use embassy_time::Instant;
use heapless::{FnvIndexMap, Vec};

/// All peers of one local profile role
#[derive(Debug)]
pub(crate) struct PeerRegistry {
    role: Role,
    peers: FnvIndexMap<PeerAddress, Peer, MAX_PEERS_PER_ROLE>,
    active_peer: PeerAddress,
    max_connected: usize,
    handle_by_peer_id: FnvIndexMap<u8, TransportHandle, MAX_PEERS_PER_ROLE>,
    enabled: bool,
    invalid_peer_check: bool,
}

impl PeerRegistry {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            peers: FnvIndexMap::new(),
            active_peer: PeerAddress::EMPTY,
            max_connected: crate::constants::DEFAULT_MAX_CONNECTED_PEERS,
            handle_by_peer_id: FnvIndexMap::new(),
            enabled: false,
            invalid_peer_check: false,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn max_connected(&self) -> usize {
        self.max_connected
    }

    pub(crate) fn set_max_connected(&mut self, max_connected: usize) {
        self.max_connected = max_connected;
    }

    /// Role-ambiguous admission is deferred until the transport reports the
    /// real endpoint role at open time
    pub(crate) fn invalid_peer_check(&self) -> bool {
        self.invalid_peer_check
    }

    pub(crate) fn set_invalid_peer_check(&mut self, pending: bool) {
        self.invalid_peer_check = pending;
    }

    pub(crate) fn active_peer(&self) -> PeerAddress {
        self.active_peer
    }

    pub(crate) fn set_active_address(&mut self, address: PeerAddress) {
        self.active_peer = address;
    }

    pub(crate) fn is_active(&self, address: PeerAddress) -> bool {
        !address.is_empty() && self.active_peer == address
    }

    pub(crate) fn find_peer(&self, address: PeerAddress) -> Option<&Peer> {
        self.peers.get(&address)
    }

    pub(crate) fn find_peer_mut(&mut self, address: PeerAddress) -> Option<&mut Peer> {
        self.peers.get_mut(&address)
    }

    pub(crate) fn address_by_handle(&self, handle: TransportHandle) -> Option<PeerAddress> {
        self.peers
            .values()
            .find(|peer| peer.handle() == handle)
            .map(Peer::address)
    }

    pub(crate) fn is_peer_id_used(&self, peer_id: u8) -> bool {
        self.peers.values().any(|peer| peer.peer_id() == peer_id)
    }

    pub(crate) fn handle_for_peer_id(&self, peer_id: u8) -> Option<TransportHandle> {
        self.handle_by_peer_id.get(&peer_id).copied()
    }

    pub(crate) fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peers currently in the process of connecting or connected
    pub(crate) fn admission_count(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| {
                matches!(
                    peer.state(),
                    StreamState::Opening | StreamState::Opened | StreamState::Started
                )
            })
            .count()
    }

    /// Whether `address` is itself among the connecting/connected peers and
    /// therefore already accounted for by admission control
    pub(crate) fn is_accounted(&self, address: PeerAddress) -> bool {
        self.find_peer(address).is_some_and(|peer| {
            matches!(
                peer.state(),
                StreamState::Opening | StreamState::Opened | StreamState::Started
            )
        })
    }

    pub(crate) fn insert_peer(&mut self, peer: Peer) -> Result<(), AvError> {
        let address = peer.address();
        match self.peers.insert(address, peer) {
            Ok(_) => Ok(()),
            Err(_) => {
                defmt::error!(
                    "[REGISTRY] {} peer table full, cannot insert {}",
                    self.role,
                    address
                );
                Err(AvError::PoolExhausted)
            }
        }
    }

    pub(crate) fn pop_peer(&mut self, address: PeerAddress) -> Option<Peer> {
        let peer = self.peers.remove(&address);
        if let Some(peer) = &peer {
            defmt::info!(
                "[REGISTRY] {} pop peer {} state {}",
                self.role,
                address,
                peer.state()
            );
        }
        peer
    }

    /// Remove and free every peer that has returned to Idle after having
    /// left it. A peer that was just created cannot be deleted yet.
    pub(crate) fn delete_idle_peers(&mut self) {
        let deletable: Vec<PeerAddress, MAX_PEERS_PER_ROLE> = self
            .peers
            .values()
            .filter(|peer| peer.can_be_deleted())
            .map(Peer::address)
            .collect();
        for address in deletable {
            defmt::info!("[REGISTRY] {} deleting idle peer {}", self.role, address);
            self.peers.remove(&address);
        }
    }

    pub(crate) fn cleanup_all_peers(&mut self) {
        self.peers.clear();
    }

    /// Register one stream endpoint per peer id with the transport; the
    /// transport answers each with a `Registered` event
    pub(crate) fn register_all_handles(&self) {
        for peer_id in 0..MAX_PEERS_PER_ROLE as u8 {
            transport::request(TransportRequest::Register {
                endpoint_role: self.role.opposite(),
                peer_id,
            });
        }
    }

    pub(crate) fn deregister_all_handles(&mut self) {
        for handle in self.handle_by_peer_id.values() {
            transport::request(TransportRequest::Deregister { handle: *handle });
        }
        self.handle_by_peer_id.clear();
    }

    /// Record a handle assignment from the transport and correct the
    /// affected peer's stale handle if it already exists
    pub(crate) fn handle_registered(&mut self, peer_id: u8, handle: TransportHandle) {
        self.handle_by_peer_id.insert(peer_id, handle).ok();

        if let Some(peer) = self
            .peers
            .values_mut()
            .find(|peer| peer.peer_id() == peer_id)
        {
            if peer.handle() != handle {
                if peer.handle().is_unknown() {
                    defmt::debug!(
                        "[REGISTRY] {} assign peer {} handle {} peer_id {}",
                        self.role,
                        peer.address(),
                        handle,
                        peer_id
                    );
                } else {
                    defmt::warn!(
                        "[REGISTRY] {} correct peer {} handle {} -> {} peer_id {}",
                        self.role,
                        peer.address(),
                        peer.handle(),
                        handle,
                        peer_id
                    );
                }
                peer.set_handle(handle);
            }
        }
    }

    /// Earliest armed open-fallback deadline among this registry's peers
    pub(crate) fn earliest_fallback_deadline(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter_map(Peer::open_fallback_deadline)
            .min()
    }

    /// Disarm and return every peer whose open-fallback deadline expired
    pub(crate) fn take_expired_fallbacks(&mut self, now: Instant) -> Vec<PeerAddress, MAX_PEERS_PER_ROLE> {
        let mut expired = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.open_fallback_deadline().is_some_and(|at| at <= now) {
                peer.cancel_open_fallback();
                expired.push(peer.address()).ok();
            }
        }
        expired
    }
}

impl AvContext {
    pub(crate) fn peer(&self, role: Role, address: PeerAddress) -> Option<&Peer> {
        self.registry(role).find_peer(address)
    }

    pub(crate) fn peer_mut(&mut self, role: Role, address: PeerAddress) -> Option<&mut Peer> {
        self.registry_mut(role).find_peer_mut(address)
    }

    pub(crate) fn peer_state(&self, role: Role, address: PeerAddress) -> Option<StreamState> {
        self.peer(role, address).map(Peer::state)
    }

    pub(crate) fn is_active_peer(&self, role: Role, address: PeerAddress) -> bool {
        self.registry(role).is_active(address)
    }

    /// Find a peer in either registry, source side first
    pub(crate) fn find_peer_any(&self, address: PeerAddress) -> Option<&Peer> {
        self.source
            .find_peer(address)
            .or_else(|| self.sink.find_peer(address))
    }

    /// The active peer of either role, source side first
    pub(crate) fn find_active_peer(&self) -> Option<&Peer> {
        let source_active = self.source.active_peer();
        if !source_active.is_empty() {
            return self.source.find_peer(source_active);
        }
        let sink_active = self.sink.active_peer();
        if !sink_active.is_empty() {
            return self.sink.find_peer(sink_active);
        }
        None
    }

    /// Whether the shared stream is started and free of pending suspend/stop
    /// actions; non-active peers may only touch the shared pipeline when
    /// this is false
    pub(crate) fn stream_started_ready(&self) -> bool {
        let Some(peer) = self.find_active_peer() else {
            defmt::warn!("[REGISTRY] no active peer found");
            return false;
        };
        if peer.check_flags(
            PeerFlags::LOCAL_SUSPEND_PENDING | PeerFlags::REMOTE_SUSPEND | PeerFlags::PENDING_STOP,
        ) {
            return false;
        }
        peer.is_streaming()
    }

    /// Check whether a connection to `address` is allowed for `role`. An
    /// already connecting/connected peer is accounted for; otherwise the
    /// derived admission count is compared against the limit. In coexist
    /// mode the two roles are mutually exclusive per device: a role admits
    /// no new peer while the other role's registry is populated.
    pub(crate) fn allowed_to_connect(&self, role: Role, address: PeerAddress) -> bool {
        let registry = self.registry(role);

        if self.coexist && registry.invalid_peer_check() {
            defmt::info!(
                "[REGISTRY] {} role of {} still unresolved, admission deferred to open",
                role,
                address
            );
            return true;
        }

        let coexist_both = self.coexist && self.both_enabled();
        if !coexist_both && registry.is_accounted(address) {
            return true;
        }

        let connected = registry.admission_count()
            - usize::from(coexist_both && registry.is_accounted(address));
        if coexist_both {
            connected < registry.max_connected() && !self.registry(role.opposite()).has_peers()
        } else {
            connected < registry.max_connected()
        }
    }

    /// Return the existing peer for (role, address) or create one with a
    /// free peer id and a resolved transport handle. Returns `false` when no
    /// peer could be created (exhausted id pool, unresolvable handle, full
    /// table).
    pub(crate) fn ensure_peer(
        &mut self,
        role: Role,
        address: PeerAddress,
        handle: TransportHandle,
    ) -> bool {
        if self.registry(role).find_peer(address).is_some() {
            return true;
        }

        let check_both = self.both_enabled();
        let peer_id = (0..MAX_PEERS_PER_ROLE as u8).find(|id| {
            if check_both {
                !self.source.is_peer_id_used(*id) && !self.sink.is_peer_id_used(*id)
            } else {
                !self.registry(role).is_peer_id_used(*id)
            }
        });
        let Some(peer_id) = peer_id else {
            defmt::error!(
                "[REGISTRY] {} cannot create peer {}: cannot allocate unique peer id",
                role,
                address
            );
            return false;
        };

        let handle = if handle.is_unknown() {
            match self.registry(role).handle_for_peer_id(peer_id) {
                Some(handle) if !handle.is_unknown() => handle,
                _ => {
                    defmt::error!(
                        "[REGISTRY] {} cannot create peer {}: no handle for peer id {}",
                        role,
                        address,
                        peer_id
                    );
                    return false;
                }
            }
        } else {
            handle
        };

        defmt::info!(
            "[REGISTRY] {} create peer {} handle {} peer_id {}",
            role,
            address,
            handle,
            peer_id
        );
        let peer = Peer::new(address, role.opposite(), handle, peer_id);
        self.registry_mut(role).insert_peer(peer).is_ok()
    }

    /// Atomically move a peer between the two registries once the transport
    /// reveals its real endpoint role
    pub(crate) fn move_peer(&mut self, address: PeerAddress, from: Role, to: Role) -> bool {
        let Some(mut peer) = self.registry_mut(from).pop_peer(address) else {
            defmt::error!("[REGISTRY] cannot migrate {}: not in {} registry", address, from);
            return false;
        };
        peer.set_endpoint_role(to.opposite());
        if self.registry_mut(to).insert_peer(peer).is_err() {
            defmt::error!("[REGISTRY] {} registry full, migration of {} failed", to, address);
            return false;
        }
        defmt::info!("[REGISTRY] migrated peer {} from {} to {}", address, from, to);
        true
    }

    /// Set (or clear, with `PeerAddress::EMPTY`) the active peer of `role`.
    ///
    /// Setting the same peer again is a no-op success. Clearing tears down
    /// the shared audio session before releasing the slot. Electing a new
    /// peer requires it to be connected and updates the slot only after the
    /// session hand-off has been requested from the pipeline.
    pub(crate) fn set_active_peer(&mut self, role: Role, address: PeerAddress) -> Result<(), AvError> {
        defmt::info!("[REGISTRY] {} set active peer {}", role, address);

        if self.registry(role).active_peer() == address {
            return Ok(()); // Nothing has changed
        }

        if address.is_empty() {
            let previous = self.registry(role).active_peer();
            audio::command(role, AudioCommandKind::EndSession { address: previous });
            audio::command(role, AudioCommandKind::Shutdown);
            self.registry_mut(role).set_active_address(PeerAddress::EMPTY);
            return Ok(());
        }

        if self.coexist {
            self.delete_active_peer(role.opposite());
        }

        if !self
            .registry(role)
            .find_peer(address)
            .is_some_and(Peer::is_connected)
        {
            defmt::error!(
                "[REGISTRY] error setting {} as active {} peer",
                address,
                role
            );
            return Err(AvError::PeerNotConnected);
        }

        let previous = self.registry(role).active_peer();
        audio::command(role, AudioCommandKind::RestartSession { previous, address });
        self.registry_mut(role).set_active_address(address);
        Ok(())
    }

    /// Release `role`'s active peer and shut its session down
    pub(crate) fn delete_active_peer(&mut self, role: Role) {
        let active = self.registry(role).active_peer();
        if active.is_empty() {
            return;
        }
        audio::command(role, AudioCommandKind::EndSession { address: active });
        audio::command(role, AudioCommandKind::Shutdown);
        self.registry_mut(role).set_active_address(PeerAddress::EMPTY);
    }

    /// Forward updated codec preferences to the encoder, restarting the
    /// session first when they concern the active peer
    pub(crate) fn update_codec_config(
        &mut self,
        address: PeerAddress,
        preferences: crate::codec::CodecPreferences,
    ) -> Result<(), AvError> {
        if !self.source.enabled() {
            return Err(AvError::NotEnabled);
        }
        if address.is_empty() {
            return Err(AvError::InvalidParameter);
        }
        if self.source.active_peer() == address {
            audio::command(Role::Source, AudioCommandKind::EndSession { address });
        }
        // Track whether the client now prefers the mandatory codec
        if let Some(peer) = self.source.find_peer_mut(address) {
            let mandatory = preferences
                .iter()
                .max_by_key(|preference| preference.priority)
                .is_some_and(|preference| preference.codec == crate::codec::CodecId::Sbc);
            peer.set_mandatory_codec_preferred(mandatory);
        }
        audio::command(
            Role::Source,
            AudioCommandKind::UpdateEncoderConfig {
                address,
                preferences,
            },
        );
        Ok(())
    }

    /// Enable or disable silence mode for a connected source-role peer
    pub(crate) fn set_silence_peer(
        &mut self,
        address: PeerAddress,
        silence: bool,
    ) -> Result<(), AvError> {
        if address.is_empty() {
            return Err(AvError::InvalidParameter);
        }
        let Some(peer) = self.source.find_peer_mut(address) else {
            defmt::warn!("[REGISTRY] silence: peer {} not found", address);
            return Err(AvError::PeerNotFound);
        };
        if !peer.is_connected() {
            defmt::warn!("[REGISTRY] silence: peer {} not connected", address);
            return Err(AvError::PeerNotConnected);
        }
        peer.set_silence(silence);
        Ok(())
    }

    /// Whether a connected source-role peer is in silence mode
    pub(crate) fn is_peer_silenced(&self, address: PeerAddress) -> Result<bool, AvError> {
        if address.is_empty() {
            return Err(AvError::InvalidParameter);
        }
        let Some(peer) = self.source.find_peer(address) else {
            return Err(AvError::PeerNotFound);
        };
        if !peer.is_connected() {
            return Err(AvError::PeerNotConnected);
        }
        Ok(peer.is_silenced())
    }

    /// Clear the remote-suspend marker of the active peer so the pipeline
    /// may restart the stream
    pub(crate) fn clear_remote_suspend(&mut self) {
        let address = self
            .find_active_peer()
            .map(|peer| (peer.local_role(), peer.address()));
        let Some((role, address)) = address else {
            defmt::warn!("[REGISTRY] no active peer found");
            return;
        };
        if let Some(peer) = self.peer_mut(role, address) {
            peer.clear_flags(PeerFlags::REMOTE_SUSPEND);
        }
    }

    /// Enable one profile role: reset its peer table, record the admission
    /// limit and register all stream endpoints with the transport. Enabling
    /// an already-enabled role is a no-op success.
    pub(crate) fn init_role(&mut self, role: Role, options: AvInitOptions) {
        defmt::info!(
            "[REGISTRY] init {} max_connected_peers={}",
            role,
            options.max_connected_peers
        );
        if self.registry(role).enabled() {
            return;
        }
        let registry = self.registry_mut(role);
        registry.cleanup_all_peers();
        registry.set_max_connected(options.max_connected_peers);
        registry.set_enabled(true);
        registry.register_all_handles();
    }

    /// Disable one profile role: release the active peer, deregister the
    /// stream endpoints and drain all peers
    pub(crate) fn cleanup_role(&mut self, role: Role) {
        defmt::info!("[REGISTRY] cleanup {}", role);
        if !self.registry(role).enabled() {
            return;
        }
        self.registry_mut(role).set_enabled(false);
        let _ = self.set_active_peer(role, PeerAddress::EMPTY);
        let registry = self.registry_mut(role);
        registry.deregister_all_handles();
        registry.cleanup_all_peers();
    }

    /// Earliest armed open-fallback deadline across both registries
    pub(crate) fn earliest_open_fallback_deadline(&self) -> Option<Instant> {
        match (
            self.source.earliest_fallback_deadline(),
            self.sink.earliest_fallback_deadline(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
