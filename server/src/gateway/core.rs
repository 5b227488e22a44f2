//! Gateway command dispatch and per-peer stream state.
//!
//! [`GatewayCore`] owns every table the gateway needs: the per-handle
//! receive buffers with their parse-error quotas, the game server registry,
//! the game routing table and the pending-create map. The network side
//! feeds it [`GwEvent`]s and it pushes encoded replies into each peer's
//! outbound queue.

use std::collections::HashMap;

use bytes::BytesMut;
use log::{debug, info, warn};
use protocol::gateway::{self, GwFrame, JoinShape};
use protocol::FrameError;
use tokio::sync::mpsc;

use super::registry::{GsRegistry, Handle, RegistryError};

/// A stream peer may accumulate at most this many unparsed bytes.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;
/// Framing errors tolerated per peer before eviction.
pub const MAX_PARSE_ERRORS: u8 = 3;

/// Events produced by the connection tasks.
#[derive(Debug)]
pub enum GwEvent {
    Connected {
        handle: Handle,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    },
    Data {
        handle: Handle,
        bytes: Vec<u8>,
    },
    Closed {
        handle: Handle,
    },
}

struct StreamPeer {
    buffer: BytesMut,
    parse_errors: u8,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// The gateway's state machine, free of any socket I/O.
pub struct GatewayCore {
    peers: HashMap<Handle, StreamPeer>,
    registry: GsRegistry,
}

impl GatewayCore {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            registry: GsRegistry::new(),
        }
    }

    pub fn registry(&self) -> &GsRegistry {
        &self.registry
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn handle_event(&mut self, event: GwEvent) {
        match event {
            GwEvent::Connected { handle, tx } => {
                debug!("peer {} connected", handle);
                self.peers.insert(
                    handle,
                    StreamPeer {
                        buffer: BytesMut::new(),
                        parse_errors: 0,
                        tx,
                    },
                );
            }
            GwEvent::Data { handle, bytes } => self.on_data(handle, &bytes),
            GwEvent::Closed { handle } => {
                debug!("peer {} closed", handle);
                self.drop_peer(handle);
            }
        }
    }

    fn on_data(&mut self, handle: Handle, bytes: &[u8]) {
        let overflow = match self.peers.get_mut(&handle) {
            None => return,
            Some(peer) => {
                if peer.buffer.len() + bytes.len() > MAX_BUFFER_SIZE {
                    true
                } else {
                    peer.buffer.extend_from_slice(bytes);
                    false
                }
            }
        };
        if overflow {
            warn!("peer {} exceeded the receive buffer cap, evicting", handle);
            self.drop_peer(handle);
            return;
        }

        // One frame per decode call; the sender's role can change mid-buffer
        // (a GS registration may be followed by its first OCCUPANCY), so the
        // role is re-derived before every frame.
        loop {
            let decoded = {
                let Some(peer) = self.peers.get_mut(&handle) else {
                    return;
                };
                let shape = if self.registry.is_game_server(handle) {
                    JoinShape::Reply
                } else {
                    JoinShape::Request
                };
                gateway::decode(&mut peer.buffer, shape)
            };

            match decoded {
                Ok(frame) => self.dispatch(handle, frame),
                Err(FrameError::Incomplete(_)) => return,
                Err(e) => {
                    self.on_parse_error(handle, e);
                    return;
                }
            }
        }
    }

    fn on_parse_error(&mut self, handle: Handle, error: FrameError) {
        let Some(peer) = self.peers.get_mut(&handle) else {
            return;
        };
        peer.parse_errors += 1;
        warn!(
            "framing error from peer {} ({}/{}): {}",
            handle, peer.parse_errors, MAX_PARSE_ERRORS, error
        );
        // Discard the malformed bytes so the counter reflects distinct
        // offenses rather than one bad prefix re-read forever.
        peer.buffer.clear();
        if peer.parse_errors >= MAX_PARSE_ERRORS {
            warn!("peer {} sent too many malformed frames, evicting", handle);
            self.drop_peer(handle);
        }
    }

    fn dispatch(&mut self, handle: Handle, frame: GwFrame) {
        match frame {
            GwFrame::JoinRequest { game_id } => self.on_join_request(handle, game_id),
            GwFrame::JoinReply { game_id, addr } => self.on_join_reply(handle, game_id, addr),
            GwFrame::Create { game_type } => self.on_create(handle, game_type),
            GwFrame::GameEnd { game_id } => self.on_game_end(handle, game_id),
            GwFrame::Register { addr } => self.on_register(handle, addr),
            GwFrame::Occupancy { count } => self.on_occupancy(handle, count),
            GwFrame::GameIds { ids } => self.on_game_ids(handle, &ids),
            // Replies only the gateway itself emits; receiving one is a
            // protocol violation.
            GwFrame::JoinKo | GwFrame::CreateKo | GwFrame::RegisterOk | GwFrame::RegisterKo => {
                self.protocol_error(handle, "received a gateway-only reply frame");
            }
        }
    }

    fn on_join_request(&mut self, handle: Handle, game_id: u32) {
        match self.registry.route(game_id) {
            Some(addr) => {
                debug!("peer {} joins game {} on {}", handle, game_id, addr);
                self.send(handle, &GwFrame::JoinReply { game_id, addr });
            }
            None => {
                debug!("peer {} asked for unknown game {}", handle, game_id);
                self.send(handle, &GwFrame::JoinKo);
            }
        }
    }

    /// A registered GS answered a forwarded CREATE with the game it spawned.
    /// The reply is correlated with the originating client through the
    /// pending-create slot, the new game is routed, and the 27-byte JOIN is
    /// relayed to the client.
    fn on_join_reply(&mut self, handle: Handle, game_id: u32, addr: protocol::WireAddr) {
        let Some(pending) = self.registry.take_pending(handle) else {
            self.protocol_error(handle, "JOIN reply without a pending CREATE");
            return;
        };
        if let Err(e) = self.registry.record_game(handle, game_id) {
            self.protocol_error(handle, &e.to_string());
            return;
        }
        info!(
            "game {} created on {} for client {}",
            game_id, addr, pending.client
        );
        self.send(pending.client, &GwFrame::JoinReply { game_id, addr });
    }

    fn on_create(&mut self, handle: Handle, game_type: u8) {
        let Some((key, gs_handle)) = self.registry.pick_least_loaded() else {
            debug!("CREATE from peer {} with no game server available", handle);
            self.send(handle, &GwFrame::CreateKo);
            return;
        };
        debug!(
            "forwarding CREATE (type {}) from peer {} to game server {}",
            game_type, handle, key
        );
        self.send(gs_handle, &GwFrame::Create { game_type });
        self.registry.set_pending(gs_handle, handle, game_type);
    }

    fn on_game_end(&mut self, handle: Handle, game_id: u32) {
        match self.registry.game_end(handle, game_id) {
            Ok(()) => info!("game {} ended", game_id),
            Err(RegistryError::NotOwner(_)) => {
                self.protocol_error(handle, "GAME_END for a game owned by another server");
            }
            Err(RegistryError::UnknownHandle(_)) => {
                self.protocol_error(handle, "GAME_END from an unregistered peer");
            }
        }
    }

    fn on_register(&mut self, handle: Handle, addr: protocol::WireAddr) {
        if self.registry.register(addr, handle) {
            self.send(handle, &GwFrame::RegisterOk);
        } else {
            info!("rejected duplicate registration of {} by peer {}", addr, handle);
            self.send(handle, &GwFrame::RegisterKo);
        }
    }

    fn on_occupancy(&mut self, handle: Handle, count: u8) {
        if let Err(e) = self.registry.record_occupancy(handle, count) {
            self.protocol_error(handle, &e.to_string());
        }
    }

    fn on_game_ids(&mut self, handle: Handle, ids: &[u32]) {
        if let Err(e) = self.registry.record_games(handle, ids) {
            self.protocol_error(handle, &e.to_string());
        }
    }

    fn protocol_error(&mut self, handle: Handle, reason: &str) {
        warn!("protocol violation by peer {}: {}, evicting", handle, reason);
        self.drop_peer(handle);
    }

    fn send(&mut self, handle: Handle, frame: &GwFrame) {
        if let Some(peer) = self.peers.get(&handle) {
            // A failed send means the writer task is gone; the Closed event
            // will reclaim the peer shortly.
            let _ = peer.tx.send(frame.encode());
        }
    }

    /// Reclaims everything keyed by the handle. Dropping the outbound sender
    /// tears the connection down on the network side.
    fn drop_peer(&mut self, handle: Handle) {
        self.peers.remove(&handle);
        self.registry.remove_handle(handle);
    }
}

impl Default for GatewayCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::WireAddr;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(core: &mut GatewayCore, handle: Handle) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        core.handle_event(GwEvent::Connected { handle, tx });
        rx
    }

    fn feed(core: &mut GatewayCore, handle: Handle, bytes: Vec<u8>) {
        core.handle_event(GwEvent::Data { handle, bytes });
    }

    fn gs_addr(port: u16) -> WireAddr {
        WireAddr::from_socket_addr(format!("127.0.0.1:{port}").parse().unwrap())
    }

    fn register_gs(core: &mut GatewayCore, handle: Handle, port: u16) -> UnboundedReceiver<Vec<u8>> {
        let mut rx = connect(core, handle);
        feed(core, handle, GwFrame::Register { addr: gs_addr(port) }.encode());
        assert_eq!(rx.try_recv().unwrap(), GwFrame::RegisterOk.encode());
        rx
    }

    #[test]
    fn registration_ok_then_ko_from_other_handle() {
        let mut core = GatewayCore::new();
        let _gs_rx = register_gs(&mut core, 1, 8080);

        // Identical frame from a different handle: GS_KO.
        let mut other_rx = connect(&mut core, 2);
        feed(&mut core, 2, GwFrame::Register { addr: gs_addr(8080) }.encode());
        assert_eq!(
            other_rx.try_recv().unwrap(),
            vec![0x42, 0x57, 0x01, 0x00, 0x16]
        );
    }

    #[test]
    fn create_routes_to_least_loaded_and_relays_join() {
        let mut core = GatewayCore::new();
        let mut busy_rx = register_gs(&mut core, 1, 8080);
        let mut idle_rx = register_gs(&mut core, 2, 8081);
        feed(&mut core, 1, GwFrame::Occupancy { count: 2 }.encode());
        feed(&mut core, 2, GwFrame::Occupancy { count: 0 }.encode());

        let mut client_rx = connect(&mut core, 10);
        feed(&mut core, 10, GwFrame::Create { game_type: 1 }.encode());

        // The idle server gets the 6-byte CREATE, the busy one nothing.
        assert_eq!(
            idle_rx.try_recv().unwrap(),
            vec![0x42, 0x57, 0x01, 0x00, 0x03, 0x01]
        );
        assert!(busy_rx.try_recv().is_err());

        // The GS answers with a JOIN-shaped reply; the client receives the
        // same 27-byte JOIN and the game is routed.
        let reply = GwFrame::JoinReply { game_id: 0x42, addr: gs_addr(8081) };
        feed(&mut core, 2, reply.encode());
        let relayed = client_rx.try_recv().unwrap();
        assert_eq!(relayed.len(), 27);
        assert_eq!(relayed, reply.encode());
        assert_eq!(core.registry().route(0x42), Some(gs_addr(8081)));
    }

    #[test]
    fn create_without_servers_answers_create_ko() {
        let mut core = GatewayCore::new();
        let mut client_rx = connect(&mut core, 10);
        feed(&mut core, 10, GwFrame::Create { game_type: 1 }.encode());
        assert_eq!(client_rx.try_recv().unwrap(), GwFrame::CreateKo.encode());
    }

    #[test]
    fn join_request_routes_known_game_and_rejects_unknown() {
        let mut core = GatewayCore::new();
        let _gs_rx = register_gs(&mut core, 1, 8080);
        feed(&mut core, 1, GwFrame::GameIds { ids: vec![42] }.encode());

        let mut client_rx = connect(&mut core, 10);
        feed(&mut core, 10, GwFrame::JoinRequest { game_id: 42 }.encode());
        assert_eq!(
            client_rx.try_recv().unwrap(),
            GwFrame::JoinReply { game_id: 42, addr: gs_addr(8080) }.encode()
        );

        feed(&mut core, 10, GwFrame::JoinRequest { game_id: 7 }.encode());
        assert_eq!(client_rx.try_recv().unwrap(), GwFrame::JoinKo.encode());
    }

    #[test]
    fn game_end_from_non_owner_keeps_route_and_evicts() {
        let mut core = GatewayCore::new();
        let _a_rx = register_gs(&mut core, 1, 8080);
        let _b_rx = register_gs(&mut core, 2, 8081);
        feed(&mut core, 1, GwFrame::GameIds { ids: vec![42] }.encode());

        feed(&mut core, 2, GwFrame::GameEnd { game_id: 42 }.encode());
        assert_eq!(core.registry().route(42), Some(gs_addr(8080)));
        assert!(!core.registry().is_game_server(2));
    }

    #[test]
    fn occupancy_from_unregistered_peer_is_a_violation() {
        let mut core = GatewayCore::new();
        let _rx = connect(&mut core, 10);
        feed(&mut core, 10, GwFrame::Occupancy { count: 1 }.encode());
        assert_eq!(core.peer_count(), 0);
    }

    #[test]
    fn parse_error_quota_evicts_after_three_strikes() {
        let mut core = GatewayCore::new();
        let _rx = connect(&mut core, 10);

        for strike in 1..=MAX_PARSE_ERRORS {
            feed(&mut core, 10, vec![0xde, 0xad, 0xbe, 0xef, 0x00]);
            if strike < MAX_PARSE_ERRORS {
                assert_eq!(core.peer_count(), 1, "strike {strike} should not evict");
            }
        }
        assert_eq!(core.peer_count(), 0);
    }

    #[test]
    fn partial_frames_stay_buffered_without_penalty() {
        let mut core = GatewayCore::new();
        let mut rx = connect(&mut core, 10);

        let bytes = GwFrame::JoinRequest { game_id: 42 }.encode();
        feed(&mut core, 10, bytes[..4].to_vec());
        assert!(rx.try_recv().is_err());
        feed(&mut core, 10, bytes[4..].to_vec());
        assert_eq!(rx.try_recv().unwrap(), GwFrame::JoinKo.encode());
    }

    #[test]
    fn buffer_overflow_is_fatal_for_the_peer() {
        let mut core = GatewayCore::new();
        let _rx = connect(&mut core, 10);
        // An endless partial frame: a valid header prefix then padding that
        // never completes a GID frame of maximal declared length.
        feed(&mut core, 10, vec![0x42, 0x57, 0x01, 0x00, 0x18, 0xff]);
        feed(&mut core, 10, vec![0u8; MAX_BUFFER_SIZE]);
        assert_eq!(core.peer_count(), 0);
    }

    #[test]
    fn gs_disconnect_drops_owned_routes() {
        let mut core = GatewayCore::new();
        let _gs_rx = register_gs(&mut core, 1, 8080);
        feed(&mut core, 1, GwFrame::GameIds { ids: vec![42, 43] }.encode());

        core.handle_event(GwEvent::Closed { handle: 1 });
        assert_eq!(core.registry().route(42), None);
        assert_eq!(core.registry().route(43), None);

        let mut client_rx = connect(&mut core, 10);
        feed(&mut core, 10, GwFrame::JoinRequest { game_id: 42 }.encode());
        assert_eq!(client_rx.try_recv().unwrap(), GwFrame::JoinKo.encode());
    }

    #[test]
    fn newer_create_replaces_pending_slot() {
        let mut core = GatewayCore::new();
        let mut gs_rx = register_gs(&mut core, 1, 8080);

        let mut first_rx = connect(&mut core, 10);
        let mut second_rx = connect(&mut core, 11);
        feed(&mut core, 10, GwFrame::Create { game_type: 1 }.encode());
        feed(&mut core, 11, GwFrame::Create { game_type: 1 }.encode());
        assert!(gs_rx.try_recv().is_ok());
        assert!(gs_rx.try_recv().is_ok());

        feed(
            &mut core,
            1,
            GwFrame::JoinReply { game_id: 5, addr: gs_addr(8080) }.encode(),
        );
        // Only the latest client is answered; the displaced one sees nothing.
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_ok());
    }
}
