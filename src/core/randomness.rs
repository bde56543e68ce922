//! Randomness request record - the durable two-phase shape of an oracle call.
//!
//! Modeled as an explicit Requested/Fulfilled record rather than a blocking
//! call plus callback, so the waiting period survives process restarts.

use serde::{Deserialize, Serialize};

use super::event::RandomValue;
use super::identity::{RaffleId, RandomnessRequestId};
use super::time::WallClock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomnessStatus {
    Requested,
    Fulfilled,
    Failed,
}

/// At most one request exists per raffle; re-requests replace a `Failed`
/// record only through the operator override path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequest {
    pub raffle: RaffleId,
    pub request_id: RandomnessRequestId,
    pub status: RandomnessStatus,
    pub random_value: Option<RandomValue>,
    pub requested_at: WallClock,
}

impl RandomnessRequest {
    pub fn new(raffle: RaffleId, request_id: RandomnessRequestId, at: WallClock) -> Self {
        Self {
            raffle,
            request_id,
            status: RandomnessStatus::Requested,
            random_value: None,
            requested_at: at,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.status == RandomnessStatus::Requested
    }
}
