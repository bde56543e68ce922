//! Chain event types consumed by the reconciler.
//!
//! Payloads from the chain source are modeled as a closed tagged-variant
//! enum so handling stays exhaustive - never as untyped maps.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::{EventId, RaffleId, RandomnessRequestId, UserId};

/// 32-byte verifiable random value returned by the oracle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RandomValue(pub [u8; 32]);

impl RandomValue {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for RandomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RandomValue(")?;
        for b in self.0.iter().take(4) {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// One confirmed on-chain fact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ChainEvent {
    /// A purchase transaction confirmed on chain.
    PurchaseConfirmed {
        raffle: RaffleId,
        buyer: UserId,
        box_numbers: Vec<u32>,
    },
    /// The chain observed the raffle reach its last box.
    RaffleFilled { raffle: RaffleId },
    /// The oracle's fulfillment transaction landed on chain.
    RandomnessFulfilled {
        raffle: RaffleId,
        request_id: RandomnessRequestId,
        random_value: RandomValue,
    },
    /// The raffle was cancelled on chain.
    RaffleCancelled { raffle: RaffleId, reason: String },
}

impl ChainEvent {
    pub fn raffle(&self) -> &RaffleId {
        match self {
            ChainEvent::PurchaseConfirmed { raffle, .. } => raffle,
            ChainEvent::RaffleFilled { raffle } => raffle,
            ChainEvent::RandomnessFulfilled { raffle, .. } => raffle,
            ChainEvent::RaffleCancelled { raffle, .. } => raffle,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::PurchaseConfirmed { .. } => "purchase_confirmed",
            ChainEvent::RaffleFilled { .. } => "raffle_filled",
            ChainEvent::RandomnessFulfilled { .. } => "randomness_fulfilled",
            ChainEvent::RaffleCancelled { .. } => "raffle_cancelled",
        }
    }
}

/// A chain event plus its position in the source stream and on-chain identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedEvent {
    /// Strictly increasing per source; the reconciler's cursor unit.
    pub seq: u64,
    /// Transaction + log index; the idempotency key for application.
    pub event_id: EventId,
    pub event: ChainEvent,
}
