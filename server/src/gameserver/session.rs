//! Per-client datagram session state and the session table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info};
use protocol::gameserver::Frame;

use super::reliability::{AckWindow, OrderedQueue, SendReliability};

/// A session with no traffic for this long is reclaimed.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication progress of a datagram peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    None,
    Challenged,
    Authenticated,
}

/// Round-trip statistics fed by PING/PONG exchanges.
#[derive(Debug)]
pub struct LatencyMetrics {
    pub min_rtt: Duration,
    pub max_rtt: Duration,
    pub avg_rtt: Duration,
    pub samples: u32,
    pub last_ping: Option<Instant>,
}

impl LatencyMetrics {
    pub fn new() -> Self {
        Self {
            min_rtt: Duration::MAX,
            max_rtt: Duration::ZERO,
            avg_rtt: Duration::ZERO,
            samples: 0,
            last_ping: None,
        }
    }

    /// Updates min/max and the running average from a completed round trip.
    pub fn on_pong(&mut self, now: Instant) -> Option<Duration> {
        let sent = self.last_ping.take()?;
        let rtt = now.duration_since(sent);
        self.min_rtt = self.min_rtt.min(rtt);
        self.max_rtt = self.max_rtt.max(rtt);
        let total = self.avg_rtt * self.samples + rtt;
        self.samples += 1;
        self.avg_rtt = total / self.samples;
        Some(rtt)
    }
}

impl Default for LatencyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the server tracks about one datagram peer.
pub struct ClientSession {
    pub client_id: u32,
    pub addr: SocketAddr,
    pub auth: AuthState,
    /// When the CHALLENGE was issued; drives the challenge reaper.
    pub challenged_at: Option<Instant>,
    /// Derived at authentication; the first 8 octets are echoed in AUTH_OK.
    pub session_key: Option<[u8; 32]>,
    pub send: SendReliability,
    pub ack_window: AckWindow,
    /// Last sequence delivered on the unreliable-ordered channel.
    pub uo_last: Option<u32>,
    /// Reordering queue of the reliable-ordered channel.
    pub ro_queue: OrderedQueue<Frame>,
    /// Reliable sequences received but not yet conveyed in any outbound
    /// header; flushed as a dedicated ACK frame when needed.
    pub pending_ack: Vec<u32>,
    pub last_outbound: Instant,
    pub metrics: LatencyMetrics,
    pub game: Option<u32>,
    pub last_seen: Instant,
}

impl ClientSession {
    pub fn new(client_id: u32, addr: SocketAddr, now: Instant) -> Self {
        Self {
            client_id,
            addr,
            auth: AuthState::None,
            challenged_at: None,
            session_key: None,
            send: SendReliability::new(),
            ack_window: AckWindow::new(),
            uo_last: None,
            ro_queue: OrderedQueue::new(),
            pending_ack: Vec::new(),
            last_outbound: now,
            metrics: LatencyMetrics::new(),
            game: None,
            last_seen: now,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth == AuthState::Authenticated
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) > SESSION_TIMEOUT
    }
}

/// All live sessions, addressable by client id and by socket address.
pub struct SessionTable {
    by_id: HashMap<u32, ClientSession>,
    by_addr: HashMap<SocketAddr, u32>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
        }
    }

    /// Creates a session for a JOINing peer. Refuses ids already bound to a
    /// different live address.
    pub fn insert(&mut self, client_id: u32, addr: SocketAddr, now: Instant) -> bool {
        if let Some(existing) = self.by_id.get(&client_id) {
            if existing.addr != addr {
                debug!(
                    "client id {} already bound to {}, refusing {}",
                    client_id, existing.addr, addr
                );
                return false;
            }
        }
        self.by_addr.insert(addr, client_id);
        self.by_id
            .insert(client_id, ClientSession::new(client_id, addr, now));
        true
    }

    pub fn get(&self, client_id: u32) -> Option<&ClientSession> {
        self.by_id.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: u32) -> Option<&mut ClientSession> {
        self.by_id.get_mut(&client_id)
    }

    pub fn id_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.by_addr.get(&addr).copied()
    }

    /// Re-points an authenticated session at a new address (NAT rebind).
    /// The carried client id keeps the session alive across the move.
    pub fn rebind(&mut self, client_id: u32, addr: SocketAddr) {
        if let Some(session) = self.by_id.get_mut(&client_id) {
            if session.addr != addr && session.is_authenticated() {
                info!("client {} moved from {} to {}", client_id, session.addr, addr);
                self.by_addr.remove(&session.addr);
                session.addr = addr;
                self.by_addr.insert(addr, client_id);
            }
        }
    }

    pub fn remove(&mut self, client_id: u32) -> Option<ClientSession> {
        let session = self.by_id.remove(&client_id)?;
        self.by_addr.remove(&session.addr);
        Some(session)
    }

    /// Ids of sessions with no traffic inside the timeout.
    pub fn timed_out(&self, now: Instant) -> Vec<u32> {
        self.by_id
            .values()
            .filter(|session| session.is_timed_out(now))
            .map(|session| session.client_id)
            .collect()
    }

    /// Ids of sessions stuck in `Challenged` past the auth timeout.
    pub fn expired_challenges(&self, now: Instant, timeout: Duration) -> Vec<u32> {
        self.by_id
            .values()
            .filter(|session| {
                session.auth == AuthState::Challenged
                    && session
                        .challenged_at
                        .is_some_and(|at| now.duration_since(at) > timeout)
            })
            .map(|session| session.client_id)
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.by_id.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.by_id.values()
    }

    /// Authenticated members of one game.
    pub fn members_of(&self, game_id: u32) -> Vec<u32> {
        self.by_id
            .values()
            .filter(|session| session.is_authenticated() && session.game == Some(game_id))
            .map(|session| session.client_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn insert_and_lookup_both_ways() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        assert!(table.insert(7, addr(5000), now));
        assert_eq!(table.id_by_addr(addr(5000)), Some(7));
        assert_eq!(table.get(7).unwrap().addr, addr(5000));
    }

    #[test]
    fn id_bound_elsewhere_is_refused() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        table.insert(7, addr(5000), now);
        assert!(!table.insert(7, addr(5001), now));
        // Re-JOIN from the same address is allowed.
        assert!(table.insert(7, addr(5000), now));
    }

    #[test]
    fn rebind_moves_only_authenticated_sessions() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        table.insert(7, addr(5000), now);

        table.rebind(7, addr(6000));
        assert_eq!(table.get(7).unwrap().addr, addr(5000));

        table.get_mut(7).unwrap().auth = AuthState::Authenticated;
        table.rebind(7, addr(6000));
        assert_eq!(table.get(7).unwrap().addr, addr(6000));
        assert_eq!(table.id_by_addr(addr(6000)), Some(7));
        assert_eq!(table.id_by_addr(addr(5000)), None);
    }

    #[test]
    fn timeout_detection() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        table.insert(7, addr(5000), now);
        assert!(table.timed_out(now).is_empty());

        let later = now + SESSION_TIMEOUT + Duration::from_secs(1);
        assert_eq!(table.timed_out(later), vec![7]);

        table.get_mut(7).unwrap().touch(later);
        assert!(table.timed_out(later).is_empty());
    }

    #[test]
    fn challenge_reaper_sees_only_stale_challenges() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        let timeout = Duration::from_secs(5);

        table.insert(7, addr(5000), now);
        let session = table.get_mut(7).unwrap();
        session.auth = AuthState::Challenged;
        session.challenged_at = Some(now);

        assert!(table.expired_challenges(now + Duration::from_secs(4), timeout).is_empty());
        assert_eq!(
            table.expired_challenges(now + Duration::from_secs(6), timeout),
            vec![7]
        );

        table.get_mut(7).unwrap().auth = AuthState::Authenticated;
        assert!(table.expired_challenges(now + Duration::from_secs(6), timeout).is_empty());
    }

    #[test]
    fn members_counts_only_authenticated_in_game() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        table.insert(1, addr(5000), now);
        table.insert(2, addr(5001), now);
        table.insert(3, addr(5002), now);

        for id in [1, 2] {
            let session = table.get_mut(id).unwrap();
            session.auth = AuthState::Authenticated;
            session.game = Some(42);
        }
        table.get_mut(3).unwrap().game = Some(42);

        let mut members = table.members_of(42);
        members.sort_unstable();
        assert_eq!(members, vec![1, 2]);
    }

    #[test]
    fn latency_metrics_running_average() {
        let mut metrics = LatencyMetrics::new();
        let start = Instant::now();

        metrics.last_ping = Some(start);
        assert_eq!(
            metrics.on_pong(start + Duration::from_millis(100)),
            Some(Duration::from_millis(100))
        );
        metrics.last_ping = Some(start);
        let _ = metrics.on_pong(start + Duration::from_millis(300));

        assert_eq!(metrics.samples, 2);
        assert_eq!(metrics.min_rtt, Duration::from_millis(100));
        assert_eq!(metrics.max_rtt, Duration::from_millis(300));
        assert_eq!(metrics.avg_rtt, Duration::from_millis(200));

        // A PONG with no outstanding PING is ignored.
        assert_eq!(metrics.on_pong(start + Duration::from_secs(1)), None);
    }

    #[test]
    fn remove_clears_both_indexes() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        table.insert(7, addr(5000), now);
        let session = table.remove(7).unwrap();
        assert_eq!(session.client_id, 7);
        assert!(table.is_empty());
        assert_eq!(table.id_by_addr(addr(5000)), None);
    }
}
