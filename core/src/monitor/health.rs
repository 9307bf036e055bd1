// Stream health classification
//
// A stream's health is a pure function of its declared cadence and the age
// of its newest observation. Nothing here touches the network.

use serde::{Deserialize, Serialize};

/// Age limits for streams with no declared cadence
pub const IRREGULAR_STALE_AFTER_SECS: u64 = 24 * 60 * 60;
pub const IRREGULAR_DEAD_AFTER_SECS: u64 = 5 * 24 * 60 * 60;

/// Multiples of the cadence at which a stream turns stale, then dead
pub const STALE_CADENCE_FACTOR: u64 = 2;
pub const DEAD_CADENCE_FACTOR: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamHealth {
    /// No observation timestamp seen yet
    Unknown,
    Active,
    Stale,
    Dead,
}

impl StreamHealth {
    pub fn is_live(self) -> bool {
        self == StreamHealth::Active
    }
}

/// Health of a stream whose newest observation is from `last_observation_at`.
///
/// Timestamps from the future count as age zero.
pub fn classify(cadence_seconds: Option<u64>, last_observation_at: Option<u64>, now: u64) -> StreamHealth {
    let Some(last) = last_observation_at else {
        return StreamHealth::Unknown;
    };
    let age = now.saturating_sub(last);

    let (stale_after, dead_after) = match cadence_seconds {
        Some(cadence) if cadence > 0 => (
            cadence.saturating_mul(STALE_CADENCE_FACTOR),
            cadence.saturating_mul(DEAD_CADENCE_FACTOR),
        ),
        _ => (IRREGULAR_STALE_AFTER_SECS, IRREGULAR_DEAD_AFTER_SECS),
    };

    if age < stale_after {
        StreamHealth::Active
    } else if age < dead_after {
        StreamHealth::Stale
    } else {
        StreamHealth::Dead
    }
}
