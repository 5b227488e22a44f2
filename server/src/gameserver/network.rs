//! Game server runtime: the UDP socket, the gateway stream link, and the
//! event loop tying reliability, authentication, sessions and games
//! together.
//!
//! One task owns all state. Reader tasks turn socket traffic into
//! [`ServerMessage`]s; a sender task drains the outbound datagram queue; a
//! writer task drains the gateway stream queue. Per datagram the order is
//! always: decode, reliability bookkeeping, auth gate, command handler,
//! enqueue outbound.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use log::{debug, error, info, warn};
use protocol::gameserver::{cmd, flags, Channel, Frame, Packet, MAX_FRAGMENT_BODY};
use protocol::gateway::{self, GwFrame, JoinShape};
use protocol::{seq_newer, FrameError, WireAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::interval;

use super::auth::{AuthEngine, AUTH_TIMEOUT};
use super::fragment::{split_message, Reassembler};
use super::game::GameTable;
use super::reliability::retransmit_timeout;
use super::session::{AuthState, SessionTable};

/// Simulation and snapshot cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(50);
/// Retransmit / ACK-flush sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);
/// Cadence of the slow housekeeping pass (pings, reapers, occupancy).
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
/// The server pings each authenticated peer at most this often.
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Messages funneled into the main loop by the reader tasks.
#[derive(Debug)]
pub enum ServerMessage {
    Datagram { bytes: Vec<u8>, addr: SocketAddr },
    Gateway(GwFrame),
    GatewayClosed,
}

/// The game server role.
pub struct GameServer {
    local_addr: SocketAddr,
    external: WireAddr,
    msg_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    gateway_tx: mpsc::UnboundedSender<Vec<u8>>,
    sessions: SessionTable,
    games: GameTable,
    auth: AuthEngine,
    reassembler: Reassembler<u32>,
}

impl GameServer {
    /// Binds the datagram socket and dials the gateway.
    pub async fn new(
        udp_addr: &str,
        gateway_addr: &str,
        external: SocketAddr,
        secret: Vec<u8>,
    ) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(udp_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("game server listening on {}", local_addr);

        let stream = TcpStream::connect(gateway_addr).await?;
        info!("connected to gateway at {}", gateway_addr);

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (gateway_tx, gateway_rx) = mpsc::unbounded_channel();

        tokio::spawn(udp_receiver(Arc::clone(&socket), msg_tx.clone()));
        tokio::spawn(udp_sender(socket, out_rx));

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(gateway_reader(read_half, msg_tx));
        tokio::spawn(gateway_writer(write_half, gateway_rx));

        Ok(Self {
            local_addr,
            external: WireAddr::from_socket_addr(external),
            msg_rx,
            out_tx,
            gateway_tx,
            sessions: SessionTable::new(),
            games: GameTable::new(),
            auth: AuthEngine::new(secret),
            reassembler: Reassembler::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers with the gateway, then serves until the process stops.
    pub async fn run(mut self) {
        self.send_gateway(&GwFrame::Register { addr: self.external });

        let mut tick = interval(TICK_INTERVAL);
        let mut sweep = interval(SWEEP_INTERVAL);
        let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                message = self.msg_rx.recv() => {
                    match message {
                        Some(ServerMessage::Datagram { bytes, addr }) => {
                            self.on_datagram(&bytes, addr);
                        }
                        Some(ServerMessage::Gateway(frame)) => self.on_gateway_frame(frame),
                        Some(ServerMessage::GatewayClosed) => {
                            warn!("gateway link lost, continuing to serve running games");
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;
                    self.on_tick(dt);
                }
                _ = sweep.tick() => self.on_sweep(Instant::now()),
                _ = housekeeping.tick() => self.on_housekeeping(Instant::now()),
            }
        }
    }

    // ---- inbound datagram path -------------------------------------------

    fn on_datagram(&mut self, bytes: &[u8], addr: SocketAddr) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                // Datagrams are lossy by design; a lying peer only wastes
                // its own packets.
                debug!("dropping datagram from {}: {}", addr, e);
                return;
            }
        };
        let now = Instant::now();

        if let Frame::Join { client_id, nonce, version } = packet.frame {
            self.on_join(addr, &packet, client_id, nonce, version, now);
            return;
        }

        let Some(client_id) = self.identify(packet.client_id, addr) else {
            debug!("datagram from unknown peer {} dropped", addr);
            return;
        };

        // An arrival about to age unconveyed entries out of the SACK window
        // forces the explicit ACK out first.
        let needs_flush = self
            .sessions
            .get(client_id)
            .is_some_and(|s| s.ack_window.would_shift_out(packet.seq, &s.pending_ack));
        if needs_flush {
            self.flush_acks(client_id);
        }

        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        session.touch(now);
        session.send.ack_window(packet.ack_base, packet.ack_bits);
        let fresh = session.ack_window.record(packet.seq);

        let deliverable: Vec<Frame> = match packet.channel {
            Channel::UnreliableUnordered => vec![packet.frame],
            Channel::UnreliableOrdered => {
                if session.uo_last.map_or(true, |last| seq_newer(packet.seq, last)) {
                    session.uo_last = Some(packet.seq);
                    vec![packet.frame]
                } else {
                    Vec::new()
                }
            }
            Channel::ReliableUnordered => {
                if fresh {
                    session.pending_ack.push(packet.seq);
                    vec![packet.frame]
                } else {
                    Vec::new()
                }
            }
            Channel::ReliableOrdered => {
                if fresh {
                    session.pending_ack.push(packet.seq);
                    session.ro_queue.accept(packet.seq, packet.frame)
                } else {
                    Vec::new()
                }
            }
        };

        for frame in deliverable {
            self.handle_frame(client_id, frame, now);
        }
    }

    /// Resolves a datagram to a session. The header client id wins so that
    /// an authenticated peer survives an address change; pre-auth peers
    /// must keep the address they joined from.
    fn identify(&mut self, header_id: u32, addr: SocketAddr) -> Option<u32> {
        if let Some(session) = self.sessions.get(header_id) {
            if session.addr == addr {
                return Some(header_id);
            }
            if session.is_authenticated() {
                self.sessions.rebind(header_id, addr);
                return Some(header_id);
            }
            return None;
        }
        self.sessions.id_by_addr(addr)
    }

    fn handle_frame(&mut self, client_id: u32, frame: Frame, now: Instant) {
        let authenticated = self
            .sessions
            .get(client_id)
            .is_some_and(|s| s.is_authenticated());
        let command = frame.command();
        if !authenticated && !matches!(command, cmd::JOIN | cmd::AUTH | cmd::PING) {
            // Invariant: everything else requires an authenticated peer.
            debug!("dropping command {} from unauthenticated client {}", command, client_id);
            return;
        }

        match frame {
            Frame::Auth { nonce, cookie } => self.on_auth(client_id, nonce, &cookie, now),
            Frame::Ping => self.send_frame(client_id, Frame::Pong, Channel::UnreliableUnordered),
            Frame::Pong => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    if let Some(rtt) = session.metrics.on_pong(now) {
                        debug!(
                            "client {} rtt {:?} (avg {:?})",
                            client_id, rtt, session.metrics.avg_rtt
                        );
                    }
                }
            }
            Frame::Input(events) => {
                let game_id = self.sessions.get(client_id).and_then(|s| s.game);
                if let Some(game) = game_id.and_then(|id| self.games.get_mut(id)) {
                    for event in events {
                        game.apply_input(client_id, event.kind, event.value);
                    }
                }
            }
            Frame::Resync => self.send_snapshot_to(client_id),
            Frame::Chat { text } => self.on_chat(client_id, text),
            Frame::Ack { seqs } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    for seq in seqs {
                        session.send.ack(seq);
                    }
                }
            }
            Frame::Fragment { base_seq, total, offset, data } => {
                let message =
                    self.reassembler
                        .insert(client_id, base_seq, total, offset, &data, now);
                if let Some(message) = message {
                    self.on_reassembled(client_id, &message, now);
                }
            }
            // A second JOIN reaching this path means the peer is already
            // tracked; the challenge was re-issued on the JOIN fast path.
            Frame::Join { .. } => {}
            // Frames only the server emits; an authenticated peer sending
            // them is violating the protocol.
            Frame::Snapshot { .. } | Frame::Challenge { .. } | Frame::AuthOk { .. }
            | Frame::Kick { .. } => {
                warn!("client {} sent a server-only command {}", client_id, command);
                self.evict_session(client_id, "protocol violation");
            }
        }
    }

    /// A completed reassembly holds an inner frame: command byte, then its
    /// body. It re-enters the normal dispatch (and the auth gate).
    fn on_reassembled(&mut self, client_id: u32, message: &[u8], now: Instant) {
        let Some((&command, body)) = message.split_first() else {
            return;
        };
        match Frame::decode_body(command, body) {
            Ok(Frame::Fragment { .. }) => {
                debug!("client {} nested a fragment inside a fragment", client_id);
            }
            Ok(inner) => self.handle_frame(client_id, inner, now),
            Err(e) => debug!("reassembled message from {} is malformed: {}", client_id, e),
        }
    }

    // ---- auth ------------------------------------------------------------

    fn on_join(
        &mut self,
        addr: SocketAddr,
        packet: &Packet,
        client_id: u32,
        nonce: u8,
        version: u8,
        now: Instant,
    ) {
        if version != protocol::VERSION {
            debug!("JOIN from {} with unsupported version {}", addr, version);
            return;
        }
        if client_id == 0 || packet.client_id != client_id {
            debug!("JOIN from {} with inconsistent client id", addr);
            return;
        }
        match self.sessions.get(client_id) {
            Some(existing) if existing.addr != addr => {
                debug!("JOIN for client {} from foreign address {}", client_id, addr);
                return;
            }
            Some(existing) if existing.is_authenticated() => {
                debug!("JOIN from already-authenticated client {}", client_id);
                return;
            }
            // A retry while still challenged gets a fresh challenge below.
            Some(_) => {}
            None => {
                if !self.sessions.insert(client_id, addr, now) {
                    return;
                }
            }
        }

        let ip = WireAddr::from_socket_addr(addr).ip;
        let (timestamp, cookie) = self.auth.challenge(&ip, nonce, unix_now());

        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        session.auth = AuthState::Challenged;
        session.challenged_at = Some(now);
        session.send.ack_window(packet.ack_base, packet.ack_bits);
        session.ack_window.record(packet.seq);

        info!("JOIN from client {} at {} (nonce {})", client_id, addr, nonce);
        self.send_frame(
            client_id,
            Frame::Challenge { timestamp, cookie },
            Channel::ReliableOrdered,
        );
    }

    fn on_auth(&mut self, client_id: u32, nonce: u8, cookie: &[u8; 32], now: Instant) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        // Only the Challenged state may transition; anything else drops the
        // frame silently.
        if session.auth != AuthState::Challenged {
            debug!("AUTH from client {} in state {:?}", client_id, session.auth);
            return;
        }
        let addr = session.addr;
        let ip = WireAddr::from_socket_addr(addr).ip;

        if !self.auth.note_attempt(ip, client_id, now) {
            return;
        }
        let Some(timestamp) = self.auth.verify(&ip, nonce, cookie, unix_now()) else {
            debug!("invalid cookie from client {}", client_id);
            return;
        };

        let key = self.auth.derive_session_key(timestamp);
        let mut key_prefix = [0u8; 8];
        key_prefix.copy_from_slice(&key[..8]);

        let game_id = self.pick_game_for(client_id);
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.auth = AuthState::Authenticated;
            session.challenged_at = None;
            session.session_key = Some(key);
            session.game = game_id;
        }
        if let Some(game) = game_id.and_then(|id| self.games.get_mut(id)) {
            game.add_player(client_id);
        }

        info!("client {} authenticated", client_id);
        self.send_frame(
            client_id,
            Frame::AuthOk { client_id, key_prefix },
            Channel::ReliableOrdered,
        );
    }

    /// Joining clients land in the emptiest running game. The UDP JOIN
    /// carries no game id; the gateway already steered the client to this
    /// server for the game it asked for.
    fn pick_game_for(&mut self, _client_id: u32) -> Option<u32> {
        self.games
            .ids()
            .into_iter()
            .min_by_key(|id| {
                self.sessions
                    .members_of(*id)
                    .len()
            })
    }

    // ---- command handlers ------------------------------------------------

    fn on_chat(&mut self, client_id: u32, text: String) {
        let Some(game_id) = self.sessions.get(client_id).and_then(|s| s.game) else {
            return;
        };
        debug!("chat in game {} from {}: {}", game_id, client_id, text);
        for member in self.sessions.members_of(game_id) {
            if member != client_id {
                self.send_frame(
                    member,
                    Frame::Chat { text: text.clone() },
                    Channel::ReliableOrdered,
                );
            }
        }
    }

    fn send_snapshot_to(&mut self, client_id: u32) {
        let Some(game_id) = self.sessions.get(client_id).and_then(|s| s.game) else {
            return;
        };
        let Some(game) = self.games.get_mut(game_id) else {
            return;
        };
        let (snapshot_seq, state) = game.take_snapshot();
        self.send_frame(
            client_id,
            Frame::Snapshot { snapshot_seq, state },
            Channel::ReliableOrdered,
        );
    }

    // ---- gateway link ----------------------------------------------------

    fn on_gateway_frame(&mut self, frame: GwFrame) {
        match frame {
            GwFrame::RegisterOk => {
                info!("registered with the gateway");
                // First load report moves us from Registered to Active.
                self.send_gateway(&GwFrame::Occupancy {
                    count: self.games.occupancy(),
                });
            }
            GwFrame::RegisterKo => warn!("gateway refused our registration"),
            GwFrame::Create { game_type } => {
                let game_id = self.games.create(game_type);
                self.send_gateway(&GwFrame::JoinReply {
                    game_id,
                    addr: self.external,
                });
                self.send_gateway(&GwFrame::GameIds { ids: vec![game_id] });
                self.send_gateway(&GwFrame::Occupancy {
                    count: self.games.occupancy(),
                });
            }
            other => warn!("unexpected frame from gateway: {:?}", other),
        }
    }

    fn send_gateway(&self, frame: &GwFrame) {
        if self.gateway_tx.send(frame.encode()).is_err() {
            debug!("gateway writer is gone, frame dropped");
        }
    }

    // ---- timed tasks -----------------------------------------------------

    fn on_tick(&mut self, dt: f32) {
        let mut snapshots = Vec::new();
        for game in self.games.iter_mut() {
            if game.player_count() == 0 {
                continue;
            }
            game.update(dt);
            let (snapshot_seq, state) = game.take_snapshot();
            snapshots.push((game.id, snapshot_seq, state));
        }
        for (game_id, snapshot_seq, state) in snapshots {
            for member in self.sessions.members_of(game_id) {
                self.send_frame(
                    member,
                    Frame::Snapshot {
                        snapshot_seq,
                        state: state.clone(),
                    },
                    Channel::ReliableOrdered,
                );
            }
        }
    }

    fn on_sweep(&mut self, now: Instant) {
        // Retransmissions, and give-up detection.
        let mut resend = Vec::new();
        let mut dead = Vec::new();
        let mut ack_flushes = Vec::new();
        for session in self.sessions.iter_mut() {
            let outcome = session.send.sweep(now);
            if outcome.dead {
                dead.push(session.client_id);
                continue;
            }
            for bytes in outcome.resend {
                resend.push((bytes, session.addr));
            }
            // Dedicated ACK when outbound has been silent for one
            // retransmit interval while acks are owed.
            if !session.pending_ack.is_empty()
                && now.duration_since(session.last_outbound)
                    >= retransmit_timeout(session.metrics.avg_rtt)
            {
                ack_flushes.push(session.client_id);
            }
        }
        for (bytes, addr) in resend {
            let _ = self.out_tx.send((bytes, addr));
        }
        for client_id in ack_flushes {
            self.flush_acks(client_id);
        }
        for client_id in dead {
            warn!("client {} unreachable after retransmit limit", client_id);
            self.evict_session(client_id, "unreachable");
        }
    }

    fn on_housekeeping(&mut self, now: Instant) {
        // Server-initiated pings, at most one per second per peer.
        let mut to_ping = Vec::new();
        for session in self.sessions.iter() {
            if session.is_authenticated() {
                let due = match session.metrics.last_ping {
                    None => true,
                    Some(at) => now.duration_since(at) >= PING_INTERVAL,
                };
                if due {
                    to_ping.push(session.client_id);
                }
            }
        }
        for client_id in to_ping {
            if let Some(session) = self.sessions.get_mut(client_id) {
                session.metrics.last_ping = Some(now);
            }
            self.send_frame(client_id, Frame::Ping, Channel::UnreliableUnordered);
        }

        // Reapers.
        self.auth.sweep(now);
        self.reassembler.sweep(now);
        for client_id in self.sessions.expired_challenges(now, AUTH_TIMEOUT) {
            debug!("challenge for client {} expired", client_id);
            self.remove_session(client_id);
        }
        for client_id in self.sessions.timed_out(now) {
            info!("client {} timed out", client_id);
            self.evict_session(client_id, "timeout");
        }

        // Load report towards the gateway.
        self.send_gateway(&GwFrame::Occupancy {
            count: self.games.occupancy(),
        });
    }

    // ---- outbound --------------------------------------------------------

    /// Builds and sends one frame to a client, fragmenting transparently
    /// when the message cannot fit a single datagram. Reliable frames are
    /// remembered for retransmission.
    fn send_frame(&mut self, client_id: u32, frame: Frame, channel: Channel) {
        let now = Instant::now();
        let mut body = BytesMut::new();
        frame.encode_body(&mut body);
        if 1 + body.len() > MAX_FRAGMENT_BODY {
            self.send_fragmented(client_id, frame.command(), &body, now);
            return;
        }

        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let seq = session.send.next_seq();
        let packet = Packet {
            flags: frame_flags(&frame, channel),
            seq,
            ack_base: session.ack_window.ack_base(),
            ack_bits: session.ack_window.ack_bits(),
            channel,
            client_id,
            frame,
        };
        let bytes = packet.encode();
        if channel.is_reliable() {
            let rto = retransmit_timeout(session.metrics.avg_rtt);
            session.send.track(seq, bytes.clone(), rto, now);
        }
        session.pending_ack.clear();
        session.last_outbound = now;
        let addr = session.addr;
        let _ = self.out_tx.send((bytes, addr));
    }

    fn send_fragmented(&mut self, client_id: u32, command: u8, body: &[u8], now: Instant) {
        let mut message = Vec::with_capacity(1 + body.len());
        message.push(command);
        message.extend_from_slice(body);
        let Some(chunks) = split_message(&message) else {
            return;
        };
        let total = message.len() as u32;

        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let addr = session.addr;
        let rto = retransmit_timeout(session.metrics.avg_rtt);
        let mut base_seq = None;
        for (offset, chunk) in chunks {
            let seq = session.send.next_seq();
            let base = *base_seq.get_or_insert(seq);
            let packet = Packet {
                flags: flags::RELIABLE | flags::FRAGMENT,
                seq,
                ack_base: session.ack_window.ack_base(),
                ack_bits: session.ack_window.ack_bits(),
                channel: Channel::ReliableOrdered,
                client_id,
                frame: Frame::Fragment {
                    base_seq: base,
                    total,
                    offset,
                    data: chunk.to_vec(),
                },
            };
            let bytes = packet.encode();
            session.send.track(seq, bytes.clone(), rto, now);
            let _ = self.out_tx.send((bytes, addr));
        }
        session.pending_ack.clear();
        session.last_outbound = now;
    }

    fn flush_acks(&mut self, client_id: u32) {
        let seqs = match self.sessions.get_mut(client_id) {
            Some(session) if !session.pending_ack.is_empty() => {
                std::mem::take(&mut session.pending_ack)
            }
            _ => return,
        };
        self.send_frame(client_id, Frame::Ack { seqs }, Channel::UnreliableUnordered);
    }

    // ---- session teardown ------------------------------------------------

    /// Best-effort KICK, then full state reclamation.
    fn evict_session(&mut self, client_id: u32, reason: &str) {
        self.send_frame(
            client_id,
            Frame::Kick { reason: reason.to_owned() },
            Channel::UnreliableUnordered,
        );
        self.remove_session(client_id);
    }

    fn remove_session(&mut self, client_id: u32) {
        let Some(session) = self.sessions.remove(client_id) else {
            return;
        };
        self.reassembler.remove_peer(&client_id);
        if let Some(game_id) = session.game {
            if let Some(game) = self.games.get_mut(game_id) {
                game.remove_player(client_id);
                if game.player_count() == 0 {
                    self.end_game(game_id);
                }
            }
        }
    }

    /// The last player left: the game is over, tell the gateway.
    fn end_game(&mut self, game_id: u32) {
        if self.games.remove(game_id).is_some() {
            info!("game {} ended", game_id);
            self.send_gateway(&GwFrame::GameEnd { game_id });
            self.send_gateway(&GwFrame::Occupancy {
                count: self.games.occupancy(),
            });
        }
    }
}

fn frame_flags(frame: &Frame, channel: Channel) -> u8 {
    let mut value = if channel.is_reliable() {
        flags::RELIABLE
    } else {
        flags::CONN
    };
    match frame {
        Frame::Ping | Frame::Pong => value |= flags::PING,
        Frame::Fragment { .. } => value |= flags::FRAGMENT,
        Frame::Kick { .. } => value |= flags::CLOSE,
        _ => {}
    }
    value
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

// ---- background tasks ----------------------------------------------------

async fn udp_receiver(socket: Arc<UdpSocket>, msg_tx: mpsc::UnboundedSender<ServerMessage>) {
    let mut buffer = [0u8; 2048];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, addr)) => {
                let message = ServerMessage::Datagram {
                    bytes: buffer[..len].to_vec(),
                    addr,
                };
                if msg_tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("udp receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn udp_sender(
    socket: Arc<UdpSocket>,
    mut out_rx: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
) {
    while let Some((bytes, addr)) = out_rx.recv().await {
        if let Err(e) = socket.send_to(&bytes, addr).await {
            warn!("failed to send datagram to {}: {}", addr, e);
        }
    }
}

async fn gateway_reader(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    msg_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let mut buffer = BytesMut::new();
    let mut chunk = [0u8; 1024];
    'read: loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                loop {
                    // The gateway never sends JOIN frames to a game server,
                    // so the request shape is fine here.
                    match gateway::decode(&mut buffer, JoinShape::Request) {
                        Ok(frame) => {
                            if msg_tx.send(ServerMessage::Gateway(frame)).is_err() {
                                return;
                            }
                        }
                        Err(FrameError::Incomplete(_)) => break,
                        Err(e) => {
                            error!("malformed frame from gateway: {}", e);
                            break 'read;
                        }
                    }
                }
            }
            Err(e) => {
                error!("gateway read error: {}", e);
                break;
            }
        }
    }
    let _ = msg_tx.send(ServerMessage::GatewayClosed);
}

async fn gateway_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut gateway_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = gateway_rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            error!("gateway write error: {}", e);
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
