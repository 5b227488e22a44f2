//! Game server registry, game routing and pending CREATE tracking.
//!
//! The registry is the gateway's authoritative view of the fleet: which
//! game servers exist, how loaded they are, which games they host, and
//! which CREATE requests are still waiting for a reply.

use std::collections::HashMap;

use log::{debug, info};
use protocol::WireAddr;

/// Opaque identifier for a stream connection, assigned at accept time.
pub type Handle = u64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handle {0} is not a registered game server")]
    UnknownHandle(Handle),
    #[error("game {0} is not owned by this game server")]
    NotOwner(u32),
}

/// One registered game server.
#[derive(Debug)]
struct GsRecord {
    handle: Handle,
    occupancy: u8,
    /// False until the first OCCUPANCY report arrives.
    active: bool,
    /// Registration order, used as the load-balancing tie breaker.
    order: u64,
}

/// An in-flight CREATE forwarded to a game server. One slot per GS handle;
/// a newer CREATE replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCreate {
    pub client: Handle,
    pub game_type: u8,
}

/// Registry of game servers plus the game id routing table.
#[derive(Debug, Default)]
pub struct GsRegistry {
    servers: HashMap<WireAddr, GsRecord>,
    by_handle: HashMap<Handle, WireAddr>,
    routes: HashMap<u32, WireAddr>,
    pending: HashMap<Handle, PendingCreate>,
    next_order: u64,
}

impl GsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a game server endpoint under a stream handle.
    ///
    /// Fails when the endpoint is already claimed by a different handle.
    /// Re-registration from the same handle resets the occupancy to zero.
    pub fn register(&mut self, key: WireAddr, handle: Handle) -> bool {
        if let Some(record) = self.servers.get(&key) {
            if record.handle != handle {
                return false;
            }
        }
        let order = self.next_order;
        self.next_order += 1;
        self.servers.insert(
            key,
            GsRecord {
                handle,
                occupancy: 0,
                active: false,
                order,
            },
        );
        self.by_handle.insert(handle, key);
        info!("game server {} registered on handle {}", key, handle);
        true
    }

    pub fn is_game_server(&self, handle: Handle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    pub fn key_for_handle(&self, handle: Handle) -> Option<WireAddr> {
        self.by_handle.get(&handle).copied()
    }

    /// Updates the occupancy cache from an OCCUPANCY report. The first
    /// report also moves the server from `Registered` to `Active`.
    pub fn record_occupancy(&mut self, handle: Handle, count: u8) -> Result<(), RegistryError> {
        let key = self
            .by_handle
            .get(&handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        let record = self
            .servers
            .get_mut(key)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        record.occupancy = count;
        record.active = true;
        Ok(())
    }

    /// Bulk-routes game ids to the server behind `handle`. Ids previously
    /// routed elsewhere are overwritten, latest wins.
    pub fn record_games(&mut self, handle: Handle, ids: &[u32]) -> Result<(), RegistryError> {
        let key = *self
            .by_handle
            .get(&handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        for id in ids {
            self.routes.insert(*id, key);
        }
        Ok(())
    }

    /// Routes a single game id to the server behind `handle`.
    pub fn record_game(&mut self, handle: Handle, id: u32) -> Result<(), RegistryError> {
        self.record_games(handle, &[id])
    }

    pub fn route(&self, game_id: u32) -> Option<WireAddr> {
        self.routes.get(&game_id).copied()
    }

    /// Removes a routing entry after a GAME_END, verifying that the sender
    /// actually owns the game. An entry for an unknown game is a no-op.
    pub fn game_end(&mut self, handle: Handle, game_id: u32) -> Result<(), RegistryError> {
        let key = self
            .by_handle
            .get(&handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        match self.routes.get(&game_id) {
            Some(owner) if owner == key => {
                self.routes.remove(&game_id);
                Ok(())
            }
            Some(_) => Err(RegistryError::NotOwner(game_id)),
            None => Ok(()),
        }
    }

    /// Picks the least-occupied game server; ties go to the earliest
    /// registration. Returns its key and stream handle.
    pub fn pick_least_loaded(&self) -> Option<(WireAddr, Handle)> {
        let (key, record) = self
            .servers
            .iter()
            .min_by_key(|(_, record)| (record.occupancy, record.order))?;
        if !record.active {
            debug!("dispatching to {} before its first occupancy report", key);
        }
        Some((*key, record.handle))
    }

    pub fn set_pending(&mut self, gs: Handle, client: Handle, game_type: u8) {
        self.pending.insert(gs, PendingCreate { client, game_type });
    }

    pub fn take_pending(&mut self, gs: Handle) -> Option<PendingCreate> {
        self.pending.remove(&gs)
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Tears down everything keyed by a vanished handle: the GS record, the
    /// routing entries it owned, its pending-create slot, and any pending
    /// create whose originating client was this handle.
    pub fn remove_handle(&mut self, handle: Handle) {
        if let Some(key) = self.by_handle.remove(&handle) {
            self.servers.remove(&key);
            let before = self.routes.len();
            self.routes.retain(|_, owner| *owner != key);
            let dropped = before - self.routes.len();
            if dropped > 0 {
                info!(
                    "game server {} gone, dropped {} orphaned game route(s)",
                    key, dropped
                );
            }
        }
        self.pending.remove(&handle);
        self.pending.retain(|_, entry| entry.client != handle);
    }
}
