//! Authoritative per-game simulation state.
//!
//! The simulation itself is deliberately small: ships with a position and a
//! velocity, driven by decoded INPUT events and a fixed-timestep update.
//! Its only protocol-visible product is the snapshot payload, a
//! bincode-encoded entity list the broadcaster treats as opaque bytes.

use std::collections::HashMap;

use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Horizontal scroll speed applied by forward thrust (units/second).
pub const SHIP_SPEED: f32 = 200.0;
/// Playfield width.
pub const WORLD_WIDTH: f32 = 800.0;
/// Playfield height.
pub const WORLD_HEIGHT: f32 = 600.0;

/// Input event types carried in INPUT payloads.
pub mod input {
    pub const FORWARD: u8 = 1;
    pub const UP: u8 = 2;
    pub const DOWN: u8 = 3;
    pub const FIRE: u8 = 4;
}

/// One ship as serialized into the snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipState {
    pub client_id: u32,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub firing: bool,
}

impl ShipState {
    fn new(client_id: u32, slot: usize) -> Self {
        // Stack spawn rows so ships do not overlap.
        Self {
            client_id,
            x: 50.0,
            y: 100.0 + (slot as f32 * 80.0) % (WORLD_HEIGHT - 200.0),
            vx: 0.0,
            vy: 0.0,
            firing: false,
        }
    }
}

/// One running game instance.
pub struct Game {
    pub id: u32,
    pub game_type: u8,
    ships: HashMap<u32, ShipState>,
    snapshot_seq: u32,
    spawned: usize,
}

impl Game {
    pub fn new(id: u32, game_type: u8) -> Self {
        Self {
            id,
            game_type,
            ships: HashMap::new(),
            snapshot_seq: 0,
            spawned: 0,
        }
    }

    pub fn add_player(&mut self, client_id: u32) {
        let ship = ShipState::new(client_id, self.spawned);
        self.spawned += 1;
        info!("game {}: player {} spawned at ({}, {})", self.id, client_id, ship.x, ship.y);
        self.ships.insert(client_id, ship);
    }

    pub fn remove_player(&mut self, client_id: u32) {
        if self.ships.remove(&client_id).is_some() {
            info!("game {}: player {} left", self.id, client_id);
        }
    }

    pub fn player_count(&self) -> usize {
        self.ships.len()
    }

    /// Applies one decoded input event to the owning ship. Unknown event
    /// types are logged and skipped; they never fail the frame.
    pub fn apply_input(&mut self, client_id: u32, kind: u8, value: u8) {
        let Some(ship) = self.ships.get_mut(&client_id) else {
            return;
        };
        let engaged = value != 0;
        match kind {
            input::FORWARD => ship.vx = if engaged { SHIP_SPEED } else { 0.0 },
            input::UP => ship.vy = if engaged { -SHIP_SPEED } else { 0.0 },
            input::DOWN => ship.vy = if engaged { SHIP_SPEED } else { 0.0 },
            input::FIRE => ship.firing = engaged,
            other => debug!("game {}: unknown input type {} from {}", self.id, other, client_id),
        }
    }

    /// Advances every ship by one fixed timestep and clamps to the field.
    pub fn update(&mut self, dt: f32) {
        for ship in self.ships.values_mut() {
            ship.x = (ship.x + ship.vx * dt).clamp(0.0, WORLD_WIDTH);
            ship.y = (ship.y + ship.vy * dt).clamp(0.0, WORLD_HEIGHT);
        }
    }

    /// Produces the next snapshot: its sequence number and the opaque
    /// payload the broadcaster ships out.
    pub fn take_snapshot(&mut self) -> (u32, Vec<u8>) {
        self.snapshot_seq = self.snapshot_seq.wrapping_add(1);
        let mut ships: Vec<&ShipState> = self.ships.values().collect();
        ships.sort_by_key(|ship| ship.client_id);
        let payload = bincode::serialize(&ships).unwrap_or_default();
        (self.snapshot_seq, payload)
    }
}

/// The set of games this server hosts.
pub struct GameTable {
    games: HashMap<u32, Game>,
}

impl GameTable {
    pub fn new() -> Self {
        Self {
            games: HashMap::new(),
        }
    }

    /// Allocates a fresh game with a random, unused id.
    pub fn create(&mut self, game_type: u8) -> u32 {
        let mut rng = rand::thread_rng();
        let mut id: u32 = rng.gen();
        while id == 0 || self.games.contains_key(&id) {
            id = rng.gen();
        }
        self.games.insert(id, Game::new(id, game_type));
        info!("created game {} (type {})", id, game_type);
        id
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Game> {
        self.games.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Game> {
        self.games.remove(&id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.games.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Game> {
        self.games.values_mut()
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    /// Occupancy as reported to the gateway: the hosted game count, pinned
    /// to the 8-bit wire field.
    pub fn occupancy(&self) -> u8 {
        self.games.len().min(u8::MAX as usize) as u8
    }
}

impl Default for GameTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn forward_input_moves_the_ship() {
        let mut game = Game::new(1, 1);
        game.add_player(7);
        game.apply_input(7, input::FORWARD, 1);

        let dt = 1.0 / 60.0;
        game.update(dt);

        let (_, payload) = game.take_snapshot();
        let ships: Vec<ShipState> = bincode::deserialize(&payload).unwrap();
        assert_eq!(ships.len(), 1);
        assert_approx_eq!(ships[0].x, 50.0 + SHIP_SPEED * dt, 0.001);
    }

    #[test]
    fn releasing_input_stops_movement() {
        let mut game = Game::new(1, 1);
        game.add_player(7);
        game.apply_input(7, input::UP, 1);
        game.update(0.1);
        game.apply_input(7, input::UP, 0);

        let (_, before) = game.take_snapshot();
        game.update(0.1);
        let (_, after) = game.take_snapshot();

        let before: Vec<ShipState> = bincode::deserialize(&before).unwrap();
        let after: Vec<ShipState> = bincode::deserialize(&after).unwrap();
        assert_approx_eq!(before[0].y, after[0].y, 0.001);
    }

    #[test]
    fn ships_stay_inside_the_field() {
        let mut game = Game::new(1, 1);
        game.add_player(7);
        game.apply_input(7, input::UP, 1);
        // Long enough to slam into the top edge.
        for _ in 0..600 {
            game.update(0.1);
        }
        let (_, payload) = game.take_snapshot();
        let ships: Vec<ShipState> = bincode::deserialize(&payload).unwrap();
        assert_approx_eq!(ships[0].y, 0.0, 0.001);
    }

    #[test]
    fn unknown_input_is_ignored() {
        let mut game = Game::new(1, 1);
        game.add_player(7);
        game.apply_input(7, 0xee, 1);
        game.update(0.1);
        let (_, payload) = game.take_snapshot();
        let ships: Vec<ShipState> = bincode::deserialize(&payload).unwrap();
        assert_approx_eq!(ships[0].x, 50.0, 0.001);
    }

    #[test]
    fn snapshot_sequence_increments() {
        let mut game = Game::new(1, 1);
        let (first, _) = game.take_snapshot();
        let (second, _) = game.take_snapshot();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn snapshot_payload_is_stable_for_equal_state() {
        let mut game = Game::new(1, 1);
        game.add_player(2);
        game.add_player(1);
        let (_, a) = game.take_snapshot();
        let (_, b) = game.take_snapshot();
        // Ships are sorted by client id, so identical state encodes
        // identically regardless of map iteration order.
        assert_eq!(a, b);
    }

    #[test]
    fn game_table_allocates_unique_ids_and_reports_occupancy() {
        let mut table = GameTable::new();
        let a = table.create(1);
        let b = table.create(1);
        assert_ne!(a, b);
        assert_eq!(table.occupancy(), 2);

        table.remove(a);
        assert_eq!(table.occupancy(), 1);
        assert!(table.get_mut(b).is_some());
    }
}
