//! The shared arena: pawns steering around a plane.
//!
//! Post payloads are an explicit tagged sum discriminated by `kind` and
//! matched exhaustively. All movement is integer milli-cell math, so every
//! participant replays bit-identical states. Unparseable payloads are
//! logged and leave state untouched; a room log must never wedge a client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use parlor_engine::{Post, Simulation};

/// Hard cap on commanded speed, in milli-cells per tick.
pub const MAX_SPEED: i64 = 500;

/// One arena event, as carried in a post's `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArenaEvent {
    /// A player enters at the origin.
    Join {
        /// Player name.
        player: String,
    },
    /// A player sets its velocity.
    Steer {
        /// Player name.
        player: String,
        /// Commanded x velocity in milli-cells/tick.
        dx: i64,
        /// Commanded y velocity in milli-cells/tick.
        dy: i64,
    },
    /// A player leaves.
    Leave {
        /// Player name.
        player: String,
    },
}

/// One player's pawn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pawn {
    /// Position in milli-cells.
    pub x: i64,
    /// Position in milli-cells.
    pub y: i64,
    /// Velocity in milli-cells/tick.
    pub vx: i64,
    /// Velocity in milli-cells/tick.
    pub vy: i64,
}

/// Arena state: pawns keyed by player name. `BTreeMap` keeps iteration
/// order deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaState {
    /// Live pawns.
    pub pawns: BTreeMap<String, Pawn>,
}

/// The arena simulation for one participant.
pub struct ArenaSim {
    /// The local player; `smooth` overlays this pawn's prediction.
    pub player: String,
}

impl Simulation for ArenaSim {
    type State = ArenaState;

    fn init(&self) -> ArenaState {
        ArenaState::default()
    }

    fn on_tick(&self, state: &ArenaState, _tick: u64) -> ArenaState {
        let mut next = state.clone();
        for pawn in next.pawns.values_mut() {
            pawn.x += pawn.vx;
            pawn.y += pawn.vy;
            // Integer friction decaying toward zero.
            pawn.vx = pawn.vx * 15 / 16;
            pawn.vy = pawn.vy * 15 / 16;
        }
        next
    }

    fn on_post(&self, state: &ArenaState, post: &Post) -> ArenaState {
        let event: ArenaEvent = match serde_json::from_value(post.data.clone()) {
            Ok(event) => event,
            Err(err) => {
                debug!(
                    "unparseable arena event at {} index {}: {err}",
                    post.room, post.index
                );
                return state.clone();
            }
        };

        let mut next = state.clone();
        match event {
            ArenaEvent::Join { player } => {
                next.pawns.entry(player).or_default();
            }
            ArenaEvent::Steer { player, dx, dy } => {
                if let Some(pawn) = next.pawns.get_mut(&player) {
                    pawn.vx = dx.clamp(-MAX_SPEED, MAX_SPEED);
                    pawn.vy = dy.clamp(-MAX_SPEED, MAX_SPEED);
                }
            }
            ArenaEvent::Leave { player } => {
                next.pawns.remove(&player);
            }
        }
        next
    }

    fn smooth(&self, remote: &ArenaState, current: &ArenaState) -> ArenaState {
        // Everyone else renders from the settled authoritative past; the
        // local pawn renders from its own prediction.
        let mut blended = remote.clone();
        if let Some(own) = current.pawns.get(&self.player) {
            blended.pawns.insert(self.player.clone(), own.clone());
        }
        blended
    }
}
