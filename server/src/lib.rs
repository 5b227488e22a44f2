//! # R-Type Server
//!
//! Server-side half of the multiplayer arcade shooter: a **gateway** that
//! brokers a fleet of game servers to clients over a framed stream
//! transport, and a **game server** that hosts live sessions over a
//! datagram transport with its own reliability, ordering, fragmentation
//! and authentication layers. Both roles run in the same process and
//! cooperate over a real stream connection, so a fleet can just as well
//! span machines.
//!
//! The wire formats live in the `protocol` crate; this crate owns the
//! state machines:
//!
//! - [`gateway`]: per-peer stream buffers and parse-error quotas, the game
//!   server registry with its occupancy cache, game routing, pending
//!   CREATE correlation, and the command dispatcher.
//! - [`gameserver`]: per-client sessions with sequence/SACK bookkeeping,
//!   the four delivery channels, retransmission with backoff, fragment
//!   reassembly, stateless-cookie authentication and snapshot
//!   broadcasting.

pub mod gateway;
pub mod gameserver;
