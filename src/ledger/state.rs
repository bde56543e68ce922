//! Deterministic `LedgerOp` application into per-raffle canonical state.
//!
//! Both the live commit path and journal replay go through `RaffleState::apply`,
//! so acknowledged state and recovered state cannot drift apart. Application is
//! idempotent for chain-originated operations: an op carrying an already-seen
//! `EventId` is absorbed without effect.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::core::{
    BoxStatus, EventId, FulfillmentObligation, Purchase, Raffle, RaffleStatus, RandomnessRequest,
    RandomnessStatus, ReservationId, SettlementKey, SettlementPhase, SettlementRecord, Winner,
};

use super::journal::LedgerOp;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("box {box_number} is not available")]
    BoxNotAvailable { box_number: u32 },
    #[error("box {box_number} is out of range 1..={total_boxes}")]
    BoxOutOfRange { box_number: u32, total_boxes: u32 },
    #[error("operation for wrong raffle (state holds {held}, op names {named})")]
    WrongRaffle { held: String, named: String },
    #[error("randomness request mismatch")]
    RequestMismatch,
}

/// Canonical state of one raffle: header, box table, purchases, randomness,
/// winners, and settlement rows. Guarded by one mutex in the ledger - the
/// per-raffle serialization boundary.
#[derive(Clone, Debug)]
pub struct RaffleState {
    pub raffle: Raffle,
    pub boxes: BTreeMap<u32, BoxStatus>,
    pub purchases: Vec<Purchase>,
    pub randomness: Option<RandomnessRequest>,
    pub winners: Vec<Winner>,
    pub settlement: BTreeMap<SettlementKey, SettlementRecord>,
    pub obligations: Vec<FulfillmentObligation>,
    /// On-chain identities already applied; the replay-protection set.
    pub applied_events: BTreeSet<EventId>,
}

impl RaffleState {
    pub fn new(raffle: Raffle) -> Self {
        let boxes = (1..=raffle.total_boxes)
            .map(|n| (n, BoxStatus::Available))
            .collect();
        Self {
            raffle,
            boxes,
            purchases: Vec::new(),
            randomness: None,
            winners: Vec::new(),
            settlement: BTreeMap::new(),
            obligations: Vec::new(),
            applied_events: BTreeSet::new(),
        }
    }

    /// Sold boxes in ascending box-number order as `(box_number, owner)`.
    pub fn sold_boxes(&self) -> Vec<(u32, crate::core::UserId)> {
        self.boxes
            .iter()
            .filter_map(|(n, status)| match status {
                BoxStatus::Sold { owner, .. } => Some((*n, owner.clone())),
                _ => None,
            })
            .collect()
    }

    /// Box numbers currently `Available`. Reserved boxes are reported as
    /// taken even after their TTL until the sweep releases them.
    pub fn available_boxes(&self) -> Vec<u32> {
        self.boxes
            .iter()
            .filter_map(|(n, status)| status.is_available().then_some(*n))
            .collect()
    }

    fn seen(&self, event_id: &Option<EventId>) -> bool {
        event_id
            .as_ref()
            .map(|id| self.applied_events.contains(id))
            .unwrap_or(false)
    }

    fn record_seen(&mut self, event_id: &Option<EventId>) {
        if let Some(id) = event_id {
            self.applied_events.insert(id.clone());
        }
    }

    /// Apply one committed or replayed operation.
    ///
    /// Guards make redundant applications no-ops (status transitions, seen
    /// event ids, present settlement keys); genuinely inconsistent ops fail.
    pub fn apply(&mut self, op: &LedgerOp) -> Result<(), ApplyError> {
        if let Some(named) = op.raffle() {
            if named != &self.raffle.id {
                return Err(ApplyError::WrongRaffle {
                    held: self.raffle.id.to_string(),
                    named: named.to_string(),
                });
            }
        }

        match op {
            // Handled by the ledger's raffle table, not per-raffle state.
            LedgerOp::RaffleCreated { .. } | LedgerOp::CursorAdvanced { .. } => Ok(()),

            LedgerOp::BoxesReserved {
                reservation,
                buyer,
                box_numbers,
                expires_at,
                ..
            } => {
                for n in box_numbers {
                    match self.boxes.get(n) {
                        Some(BoxStatus::Available) => {}
                        Some(_) => {
                            return Err(ApplyError::BoxNotAvailable { box_number: *n });
                        }
                        None => {
                            return Err(ApplyError::BoxOutOfRange {
                                box_number: *n,
                                total_boxes: self.raffle.total_boxes,
                            });
                        }
                    }
                }
                for n in box_numbers {
                    self.boxes.insert(
                        *n,
                        BoxStatus::Reserved {
                            reservation: *reservation,
                            buyer: buyer.clone(),
                            expires_at: *expires_at,
                        },
                    );
                }
                Ok(())
            }

            LedgerOp::ReservationReleased { reservation, .. } => {
                for status in self.boxes.values_mut() {
                    if matches!(status, BoxStatus::Reserved { reservation: r, .. } if r == reservation)
                    {
                        *status = BoxStatus::Available;
                    }
                }
                Ok(())
            }

            LedgerOp::PurchaseCommitted {
                purchase, event_id, ..
            } => {
                if self.seen(event_id) {
                    return Ok(());
                }
                let mut newly_sold = 0u32;
                for n in &purchase.box_numbers {
                    match self.boxes.get(n) {
                        Some(BoxStatus::Sold { owner, .. }) if owner == &purchase.user => {}
                        Some(BoxStatus::Sold { .. }) => {
                            return Err(ApplyError::BoxNotAvailable { box_number: *n });
                        }
                        Some(_) => newly_sold += 1,
                        None => {
                            return Err(ApplyError::BoxOutOfRange {
                                box_number: *n,
                                total_boxes: self.raffle.total_boxes,
                            });
                        }
                    }
                }
                for n in &purchase.box_numbers {
                    if !self.boxes.get(n).map(BoxStatus::is_sold).unwrap_or(false) {
                        self.boxes.insert(
                            *n,
                            BoxStatus::Sold {
                                owner: purchase.user.clone(),
                                tx_ref: purchase.tx_ref.clone(),
                            },
                        );
                    }
                }
                if newly_sold > 0 {
                    // boxes_sold moves only together with box transitions.
                    self.raffle.boxes_sold += newly_sold;
                    self.purchases.push(purchase.clone());
                }
                self.record_seen(event_id);
                Ok(())
            }

            LedgerOp::RaffleFilled { event_id, .. } => {
                if self.seen(event_id) {
                    return Ok(());
                }
                // Active -> Full is the only legal edge; anything else is a
                // stale replay and absorbed.
                if self.raffle.status == RaffleStatus::Active && self.raffle.is_full() {
                    self.raffle.status = RaffleStatus::Full;
                }
                self.record_seen(event_id);
                Ok(())
            }

            LedgerOp::RandomnessRequested { request } => {
                self.randomness = Some(request.clone());
                Ok(())
            }

            LedgerOp::RandomnessFailed { .. } => {
                if let Some(request) = self.randomness.as_mut() {
                    if request.is_outstanding() {
                        request.status = RandomnessStatus::Failed;
                    }
                }
                Ok(())
            }

            LedgerOp::RandomnessFulfilled {
                request_id,
                random_value,
                winners,
                at,
                event_id,
                ..
            } => {
                if self.seen(event_id) {
                    return Ok(());
                }
                let request = match self.randomness.as_mut() {
                    Some(request) if request.request_id == *request_id => request,
                    _ => return Err(ApplyError::RequestMismatch),
                };
                if request.status == RandomnessStatus::Fulfilled {
                    // Duplicate fulfillment: same winners already derived.
                    self.record_seen(event_id);
                    return Ok(());
                }
                request.status = RandomnessStatus::Fulfilled;
                request.random_value = Some(*random_value);
                self.winners = winners.clone();
                if self.raffle.status == RaffleStatus::Full {
                    self.raffle.status = RaffleStatus::Completed;
                    self.raffle.ended_at = Some(*at);
                }
                self.record_seen(event_id);
                Ok(())
            }

            LedgerOp::RaffleCancelled { at, event_id, .. } => {
                if self.seen(event_id) {
                    return Ok(());
                }
                // Legal edges: Active -> Cancelled, and Full -> Cancelled
                // once the randomness request has failed. Anything else is a
                // stale replay and absorbed.
                let randomness_failed = self
                    .randomness
                    .as_ref()
                    .is_some_and(|r| r.status == RandomnessStatus::Failed);
                if self.raffle.status == RaffleStatus::Active
                    || (self.raffle.status == RaffleStatus::Full && randomness_failed)
                {
                    self.raffle.status = RaffleStatus::Cancelled;
                    self.raffle.ended_at = Some(*at);
                }
                self.record_seen(event_id);
                Ok(())
            }

            LedgerOp::SettlementOwed { record } => {
                // Insert-if-absent: replayed completion events map to the
                // same key and are absorbed.
                self.settlement
                    .entry(record.key.clone())
                    .or_insert_with(|| record.clone());
                Ok(())
            }

            LedgerOp::SettlementIssued { key, at, .. } => {
                if let Some(record) = self.settlement.get_mut(key) {
                    if record.is_owed() {
                        record.phase = SettlementPhase::Issued { at: *at };
                    }
                }
                Ok(())
            }

            LedgerOp::SettlementEscalated { key, reason, .. } => {
                if let Some(record) = self.settlement.get_mut(key) {
                    if record.is_owed() {
                        record.phase = SettlementPhase::Escalated {
                            reason: reason.clone(),
                        };
                    }
                }
                Ok(())
            }

            // Overwriting ownership is naturally idempotent; event_id is
            // carried for audit, not dedup, so the purchase op that follows
            // for the same event still applies to the untouched boxes.
            LedgerOp::BoxOwnerCorrected {
                box_number,
                owner,
                tx_ref,
                ..
            } => match self.boxes.get_mut(box_number) {
                Some(status) => {
                    let was_sold = status.is_sold();
                    *status = BoxStatus::Sold {
                        owner: owner.clone(),
                        tx_ref: tx_ref.clone(),
                    };
                    if !was_sold {
                        self.raffle.boxes_sold += 1;
                    }
                    Ok(())
                }
                None => Err(ApplyError::BoxOutOfRange {
                    box_number: *box_number,
                    total_boxes: self.raffle.total_boxes,
                }),
            },

            LedgerOp::WinnerObligationRecorded { obligation } => {
                if !self
                    .obligations
                    .iter()
                    .any(|o| o.winner_index == obligation.winner_index)
                {
                    self.obligations.push(obligation.clone());
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RaffleId, RafflePolicy, RaffleSpec, TxRef, UserId, WallClock};

    fn raffle(total_boxes: u32) -> Raffle {
        Raffle::new(
            RaffleId::parse("rf-t1").unwrap(),
            RaffleSpec {
                item_ref: "item".into(),
                total_boxes,
                box_price: 5,
                total_winners: 1,
                policy: RafflePolicy::default(),
            },
            WallClock(0),
        )
    }

    fn purchase_op(state: &RaffleState, user: &str, boxes: Vec<u32>, tx: &str) -> LedgerOp {
        LedgerOp::PurchaseCommitted {
            purchase: Purchase {
                raffle: state.raffle.id.clone(),
                user: UserId::new(user).unwrap(),
                box_numbers: boxes,
                tx_ref: TxRef::new(tx).unwrap(),
                at: WallClock(1),
            },
            reservation: None,
            event_id: Some(EventId::new(TxRef::new(tx).unwrap(), 0)),
        }
    }

    #[test]
    fn purchase_applies_once_per_event_id() {
        let mut state = RaffleState::new(raffle(3));
        let op = purchase_op(&state, "alice", vec![1, 2], "tx1");
        state.apply(&op).unwrap();
        assert_eq!(state.raffle.boxes_sold, 2);
        assert_eq!(state.purchases.len(), 1);

        // Redelivery of the same on-chain fact is absorbed.
        state.apply(&op).unwrap();
        assert_eq!(state.raffle.boxes_sold, 2);
        assert_eq!(state.purchases.len(), 1);
    }

    #[test]
    fn sold_box_for_other_owner_is_rejected() {
        let mut state = RaffleState::new(raffle(3));
        state
            .apply(&purchase_op(&state.clone(), "alice", vec![1], "tx1"))
            .unwrap();
        let err = state
            .apply(&purchase_op(&state.clone(), "bob", vec![1], "tx2"))
            .unwrap_err();
        assert!(matches!(err, ApplyError::BoxNotAvailable { box_number: 1 }));
    }

    #[test]
    fn fill_only_moves_active_and_full() {
        let mut state = RaffleState::new(raffle(1));
        let fill = LedgerOp::RaffleFilled {
            raffle: state.raffle.id.clone(),
            at: WallClock(2),
            event_id: None,
        };
        // Not full yet: absorbed, still Active.
        state.apply(&fill).unwrap();
        assert_eq!(state.raffle.status, RaffleStatus::Active);

        state
            .apply(&purchase_op(&state.clone(), "alice", vec![1], "tx1"))
            .unwrap();
        state.apply(&fill).unwrap();
        assert_eq!(state.raffle.status, RaffleStatus::Full);

        // Repeat fill from Full is a no-op, not an error.
        state.apply(&fill).unwrap();
        assert_eq!(state.raffle.status, RaffleStatus::Full);
    }

    #[test]
    fn cancel_from_full_needs_a_failed_request() {
        let mut state = RaffleState::new(raffle(1));
        state
            .apply(&purchase_op(&state.clone(), "alice", vec![1], "tx1"))
            .unwrap();
        state
            .apply(&LedgerOp::RaffleFilled {
                raffle: state.raffle.id.clone(),
                at: WallClock(2),
                event_id: None,
            })
            .unwrap();
        state
            .apply(&LedgerOp::RandomnessRequested {
                request: RandomnessRequest::new(
                    state.raffle.id.clone(),
                    crate::core::RandomnessRequestId::new(uuid::Uuid::from_u128(9)),
                    WallClock(3),
                ),
            })
            .unwrap();
        let cancel = LedgerOp::RaffleCancelled {
            raffle: state.raffle.id.clone(),
            reason: "oracle dead".into(),
            at: WallClock(5),
            event_id: None,
        };

        // Outstanding request: absorbed, still Full.
        state.apply(&cancel).unwrap();
        assert_eq!(state.raffle.status, RaffleStatus::Full);

        state
            .apply(&LedgerOp::RandomnessFailed {
                raffle: state.raffle.id.clone(),
                at: WallClock(4),
            })
            .unwrap();
        state.apply(&cancel).unwrap();
        assert_eq!(state.raffle.status, RaffleStatus::Cancelled);
    }

    #[test]
    fn settlement_owed_is_insert_if_absent() {
        let mut state = RaffleState::new(raffle(2));
        let key = SettlementKey {
            raffle: state.raffle.id.clone(),
            user: UserId::new("alice").unwrap(),
            box_number: 1,
        };
        let record = SettlementRecord {
            key: key.clone(),
            kind: crate::core::SettleKind::Credit,
            amount: 5,
            tx_ref: None,
            phase: SettlementPhase::Owed,
        };
        state
            .apply(&LedgerOp::SettlementOwed {
                record: record.clone(),
            })
            .unwrap();
        state
            .apply(&LedgerOp::SettlementIssued {
                raffle: state.raffle.id.clone(),
                key: key.clone(),
                at: WallClock(9),
            })
            .unwrap();
        // Replayed owed op must not reset the issued phase.
        state.apply(&LedgerOp::SettlementOwed { record }).unwrap();
        assert!(state.settlement.get(&key).unwrap().is_issued());
    }
}
