//! Raffle, box, and purchase domain types.
//!
//! `Raffle` is the per-raffle header; box ownership lives in the ledger's
//! per-raffle table keyed by box number. All money amounts are minor units.

use serde::{Deserialize, Serialize};

use super::error::InvalidRaffleSpec;
use super::identity::{RaffleId, ReservationId, TxRef, UserId};
use super::time::WallClock;

/// Raffle lifecycle status. `Completed` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaffleStatus {
    Active,
    Full,
    Completed,
    Cancelled,
}

impl RaffleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RaffleStatus::Completed | RaffleStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RaffleStatus::Active => "active",
            RaffleStatus::Full => "full",
            RaffleStatus::Completed => "completed",
            RaffleStatus::Cancelled => "cancelled",
        }
    }
}

/// Winner-selection policy knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RafflePolicy {
    /// When true a participant holding multiple boxes can win more than one
    /// winner slot; when false each participant wins at most once.
    pub allow_repeat_wins: bool,
}

/// Parameters for creating a raffle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaffleSpec {
    pub item_ref: String,
    pub total_boxes: u32,
    pub box_price: u64,
    pub total_winners: u32,
    #[serde(default)]
    pub policy: RafflePolicy,
}

impl RaffleSpec {
    pub fn validate(&self) -> Result<(), InvalidRaffleSpec> {
        if self.total_boxes == 0 {
            return Err(InvalidRaffleSpec {
                reason: "total_boxes must be at least 1".into(),
            });
        }
        if self.total_winners == 0 {
            return Err(InvalidRaffleSpec {
                reason: "total_winners must be at least 1".into(),
            });
        }
        if self.total_winners > self.total_boxes {
            return Err(InvalidRaffleSpec {
                reason: "total_winners cannot exceed total_boxes".into(),
            });
        }
        if self.box_price == 0 {
            return Err(InvalidRaffleSpec {
                reason: "box_price must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Per-raffle header row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raffle {
    pub id: RaffleId,
    pub item_ref: String,
    pub total_boxes: u32,
    pub box_price: u64,
    pub total_winners: u32,
    pub policy: RafflePolicy,
    pub status: RaffleStatus,
    /// Monotonic, `<= total_boxes`; only moves with a box `Reserved -> Sold`
    /// transition, never independently.
    pub boxes_sold: u32,
    pub created_at: WallClock,
    pub ended_at: Option<WallClock>,
}

impl Raffle {
    pub fn new(id: RaffleId, spec: RaffleSpec, created_at: WallClock) -> Self {
        Self {
            id,
            item_ref: spec.item_ref,
            total_boxes: spec.total_boxes,
            box_price: spec.box_price,
            total_winners: spec.total_winners,
            policy: spec.policy,
            status: RaffleStatus::Active,
            boxes_sold: 0,
            created_at,
            ended_at: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.boxes_sold == self.total_boxes
    }
}

/// Status of a single box within a raffle.
///
/// `Reserved` is a short-lived lock serializing the purchase critical
/// section; availability queries report it as taken but it is never
/// externally observable as sold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BoxStatus {
    Available,
    Reserved {
        reservation: ReservationId,
        buyer: UserId,
        expires_at: WallClock,
    },
    Sold {
        owner: UserId,
        tx_ref: TxRef,
    },
}

impl BoxStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, BoxStatus::Available)
    }

    pub fn is_sold(&self) -> bool {
        matches!(self, BoxStatus::Sold { .. })
    }
}

/// Committed purchase record - immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub raffle: RaffleId,
    pub user: UserId,
    pub box_numbers: Vec<u32>,
    pub tx_ref: TxRef,
    pub at: WallClock,
}

/// A derived winner row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    pub raffle: RaffleId,
    pub winner_index: u32,
    pub participant: UserId,
    pub derived_at: WallClock,
}
