//! Game server role: datagram sessions, reliability, authentication and
//! the games themselves.

pub mod auth;
pub mod fragment;
pub mod game;
pub mod network;
pub mod reliability;
pub mod session;

pub use network::GameServer;
