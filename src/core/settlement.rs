//! Settlement rows: credits, refunds, and winner fulfillment obligations.
//!
//! Money movements are two-phase (`Owed` then `Issued`) so a crash between
//! deciding to pay and paying resumes without paying twice.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::{RaffleId, TxRef, UserId};
use super::time::WallClock;

/// Idempotency key for a money movement: one box, one participant, one raffle.
///
/// Replayed completion or cancellation events map to the same key and are
/// therefore absorbed instead of double-paying.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SettlementKey {
    pub raffle: RaffleId,
    pub user: UserId,
    pub box_number: u32,
}

impl fmt::Debug for SettlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SettlementKey({}/{}/{})",
            self.raffle, self.user, self.box_number
        )
    }
}

impl fmt::Display for SettlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.raffle, self.user, self.box_number)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleKind {
    /// Non-winner compensation after completion, equal to the box price.
    Credit,
    /// Purchase reversal after cancellation.
    Refund,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum SettlementPhase {
    /// Decided and durable, not yet acknowledged by the payment subsystem.
    Owed,
    /// Acknowledged; never re-dispatched.
    Issued { at: WallClock },
    /// Retry budget exhausted; needs an operator.
    Escalated { reason: String },
}

/// One owed/issued money movement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub key: SettlementKey,
    pub kind: SettleKind,
    pub amount: u64,
    /// Original payment to reverse; present for refunds.
    pub tx_ref: Option<TxRef>,
    pub phase: SettlementPhase,
}

impl SettlementRecord {
    pub fn is_owed(&self) -> bool {
        matches!(self.phase, SettlementPhase::Owed)
    }

    pub fn is_issued(&self) -> bool {
        matches!(self.phase, SettlementPhase::Issued { .. })
    }
}

/// A winner's item-shipment trigger. No money moves here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentObligation {
    pub raffle: RaffleId,
    pub winner_index: u32,
    pub participant: UserId,
    pub recorded_at: WallClock,
}

/// Query view of an issued credit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditGrant {
    pub user: UserId,
    pub amount: u64,
    pub source_raffle: RaffleId,
    pub key: SettlementKey,
    pub issued_at: WallClock,
}
