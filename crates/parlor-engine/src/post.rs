//! Posts and the official-time rule.
//!
//! A post is one event in a room. The broker assigns `index` (dense,
//! strictly increasing per room) and `server_time`; the originator supplies
//! `client_time`. The tick at which a post takes effect is derived from
//! those two timestamps and the engine's tolerance with pure integer math,
//! so every participant places every post at the same tick.

use serde::{Deserialize, Serialize};

/// Sentinel index carried by a local prediction that has not been echoed
/// back by the broker yet.
pub const LOCAL_INDEX: i64 = -1;

/// One event in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Room this post belongs to.
    pub room: String,
    /// Broker-assigned position in the room log; [`LOCAL_INDEX`] for a
    /// local prediction.
    pub index: i64,
    /// Broker receive time in ms. For a local prediction this is the
    /// estimated server time at the post moment.
    pub server_time: i64,
    /// Originator's estimated server time in ms at the post moment.
    pub client_time: i64,
    /// Opaque unique name; the broker echoes it back unchanged, which is
    /// how a prediction is matched to its authoritative copy.
    pub name: String,
    /// Opaque application payload.
    pub data: serde_json::Value,
}

impl Post {
    /// Builds the optimistic local copy of a post published at `now_ms`
    /// (estimated server time).
    pub fn local(room: &str, name: &str, now_ms: i64, data: serde_json::Value) -> Self {
        Self {
            room: room.to_string(),
            index: LOCAL_INDEX,
            server_time: now_ms,
            client_time: now_ms,
            name: name.to_string(),
            data,
        }
    }

    /// `true` if this post is a local prediction awaiting its echo.
    pub fn is_local(&self) -> bool {
        self.index < 0
    }
}

/// The deterministic time at which a post takes effect.
///
/// The originator's clock is trusted to lead the broker's view by at most
/// `tolerance_ms`; beyond that, server time dominates.
pub fn official_time(client_time: i64, server_time: i64, tolerance_ms: i64) -> i64 {
    let floor = server_time - tolerance_ms;
    if client_time > floor {
        client_time
    } else {
        floor
    }
}

/// Maps a millisecond timestamp to a tick: `floor(ms * rate / 1000)`.
/// Negative timestamps clamp to tick 0.
pub fn time_to_tick(ms: i64, tick_rate: u32) -> u64 {
    if ms <= 0 {
        return 0;
    }
    (ms as u64 * tick_rate as u64) / 1000
}

/// The deterministic tick at which `post` takes effect.
pub fn official_tick(post: &Post, tolerance_ms: i64, tick_rate: u32) -> u64 {
    time_to_tick(
        official_time(post.client_time, post.server_time, tolerance_ms),
        tick_rate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_at(client_time: i64, server_time: i64) -> Post {
        Post {
            room: "r".to_string(),
            index: 0,
            server_time,
            client_time,
            name: "n".to_string(),
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_client_time_wins_within_tolerance() {
        // Client claims 1000, server stamped 1200, tolerance 300:
        // 1000 > 1200 - 300 = 900, so the client's claim holds.
        assert_eq!(official_time(1000, 1200, 300), 1000);
    }

    #[test]
    fn test_server_floor_wins_past_tolerance() {
        // Client claims 500, server stamped 1200, tolerance 300:
        // clamped to 900.
        assert_eq!(official_time(500, 1200, 300), 900);
    }

    #[test]
    fn test_official_time_at_exact_boundary() {
        // client_time == server_time - tolerance is NOT strictly greater,
        // so the floor is used; both sides agree on the same value anyway.
        assert_eq!(official_time(900, 1200, 300), 900);
    }

    #[test]
    fn test_time_to_tick_floors() {
        assert_eq!(time_to_tick(0, 24), 0);
        assert_eq!(time_to_tick(41, 24), 0);
        assert_eq!(time_to_tick(42, 24), 1);
        assert_eq!(time_to_tick(1000, 24), 24);
        assert_eq!(time_to_tick(999, 24), 23);
    }

    #[test]
    fn test_time_to_tick_clamps_negative() {
        assert_eq!(time_to_tick(-50, 24), 0);
    }

    #[test]
    fn test_official_tick_is_stable_across_participants() {
        // Any two engines applying the rule to identical posts must land
        // on the same tick regardless of their own clocks.
        let p = post_at(10_500, 10_900);
        assert_eq!(official_tick(&p, 300, 24), official_tick(&p.clone(), 300, 24));
        // 10_900 - 300 = 10_600 > 10_500, so official time is 10_600.
        assert_eq!(official_tick(&p, 300, 24), time_to_tick(10_600, 24));
    }

    #[test]
    fn test_local_post_shape() {
        let lp = Post::local("lobby", "abc123", 5_000, serde_json::json!({"k": "v"}));
        assert!(lp.is_local());
        assert_eq!(lp.index, LOCAL_INDEX);
        assert_eq!(lp.server_time, 5_000);
        assert_eq!(lp.client_time, 5_000);
        // A local post's official tick never clamps: client == server.
        assert_eq!(official_tick(&lp, 300, 24), time_to_tick(5_000, 24));
    }

    #[test]
    fn test_post_json_field_names() {
        let p = post_at(1, 2);
        let v = serde_json::to_value(&p).unwrap();
        for key in ["room", "index", "server_time", "client_time", "name", "data"] {
            assert!(v.get(key).is_some(), "missing field {key}");
        }
    }
}
