//! Allocation engine: the per-raffle purchase state machine.
//!
//! All mutating operations for one raffle run under that raffle's mutex, so
//! two concurrent requests for the same box cannot both succeed; the loser
//! gets `BoxUnavailable` and re-picks against fresh availability. Operations
//! for different raffles proceed fully in parallel.

use std::collections::BTreeSet;
use std::sync::Arc;

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::{
    BoxStatus, Purchase, Raffle, RaffleId, RaffleSpec, RaffleStatus, RandomnessStatus,
    ReservationId, TxRef, UserId, WallClock,
};
use crate::error::{Effect, Transience};
use crate::ledger::{Ledger, LedgerError, LedgerOp, ReleaseReason};
use crate::randomness::RandomnessCoordinator;
use crate::settlement::SettlementDispatcher;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocationError {
    #[error("unknown raffle {0}")]
    UnknownRaffle(RaffleId),
    #[error("raffle {raffle} is {status} and not accepting purchases")]
    RaffleNotActive {
        raffle: RaffleId,
        status: &'static str,
    },
    #[error("no boxes requested")]
    EmptyRequest,
    #[error("box {box_number} requested twice")]
    DuplicateBoxRequested { box_number: u32 },
    #[error("box {box_number} is out of range 1..={total_boxes}")]
    InvalidBoxRange { box_number: u32, total_boxes: u32 },
    #[error("box {box_number} is unavailable")]
    BoxUnavailable { box_number: u32 },
    #[error("unknown reservation {0}")]
    UnknownReservation(ReservationId),
    #[error("reservation {0} expired")]
    ReservationExpired(ReservationId),
    #[error("raffle {raffle} cannot be cancelled: {reason}")]
    CancelRefused { raffle: RaffleId, reason: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Core(#[from] crate::core::CoreError),
}

impl AllocationError {
    pub fn transience(&self) -> Transience {
        match self {
            // Contention and validation both need different inputs, not a
            // retry of the same call.
            AllocationError::Ledger(e) => e.transience(),
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            AllocationError::Ledger(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

/// A successful, transient hold on a set of boxes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub raffle: RaffleId,
    pub buyer: UserId,
    pub box_numbers: Vec<u32>,
    pub expires_at: WallClock,
}

/// Outbound intent handed to the chain client after a successful reservation.
/// The reconciler later observes the confirmed on-chain result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntendedTx {
    pub raffle: RaffleId,
    pub reservation: ReservationId,
    pub buyer: UserId,
    pub box_numbers: Vec<u32>,
    pub amount: u64,
}

pub struct AllocationEngine {
    ledger: Arc<Ledger>,
    config: EngineConfig,
    coordinator: Arc<RandomnessCoordinator>,
    settlement: Arc<SettlementDispatcher>,
    chain_tx: Sender<IntendedTx>,
}

impl AllocationEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        config: EngineConfig,
        coordinator: Arc<RandomnessCoordinator>,
        settlement: Arc<SettlementDispatcher>,
        chain_tx: Sender<IntendedTx>,
    ) -> Self {
        Self {
            ledger,
            config,
            coordinator,
            settlement,
            chain_tx,
        }
    }

    /// Create a raffle with a freshly minted id.
    pub fn create_raffle(
        &self,
        spec: RaffleSpec,
        now: WallClock,
    ) -> Result<RaffleId, AllocationError> {
        spec.validate().map_err(crate::core::CoreError::from)?;
        let id = mint_raffle_id();
        let raffle = Raffle::new(id.clone(), spec, now);
        self.ledger.create_raffle(raffle, now)?;
        tracing::info!(raffle = %id, "raffle created");
        Ok(id)
    }

    /// Reserve a set of boxes for a buyer: all of them or none.
    ///
    /// On success the intended purchase transaction is emitted to the chain
    /// client; the reservation must be confirmed within the TTL or it
    /// self-expires back to `Available`.
    pub fn reserve_boxes(
        &self,
        raffle: &RaffleId,
        box_numbers: &[u32],
        buyer: &UserId,
        now: WallClock,
    ) -> Result<Reservation, AllocationError> {
        if box_numbers.is_empty() {
            return Err(AllocationError::EmptyRequest);
        }
        let mut seen = BTreeSet::new();
        for n in box_numbers {
            if !seen.insert(*n) {
                return Err(AllocationError::DuplicateBoxRequested { box_number: *n });
            }
        }

        let entry = self
            .ledger
            .entry(raffle)
            .map_err(|_| AllocationError::UnknownRaffle(raffle.clone()))?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        if state.raffle.status != RaffleStatus::Active {
            return Err(AllocationError::RaffleNotActive {
                raffle: raffle.clone(),
                status: state.raffle.status.as_str(),
            });
        }
        for n in box_numbers {
            match state.boxes.get(n) {
                Some(BoxStatus::Available) => {}
                Some(_) => return Err(AllocationError::BoxUnavailable { box_number: *n }),
                None => {
                    return Err(AllocationError::InvalidBoxRange {
                        box_number: *n,
                        total_boxes: state.raffle.total_boxes,
                    });
                }
            }
        }

        let reservation = Reservation {
            id: ReservationId::mint(),
            raffle: raffle.clone(),
            buyer: buyer.clone(),
            box_numbers: box_numbers.to_vec(),
            expires_at: now.plus_ms(self.config.reservation_ttl_ms),
        };
        let amount = state.raffle.box_price * box_numbers.len() as u64;
        self.ledger.commit(
            &mut state,
            LedgerOp::BoxesReserved {
                raffle: raffle.clone(),
                reservation: reservation.id,
                buyer: buyer.clone(),
                box_numbers: reservation.box_numbers.clone(),
                expires_at: reservation.expires_at,
            },
        )?;
        drop(state);

        tracing::debug!(
            raffle = %raffle,
            reservation = %reservation.id,
            boxes = ?reservation.box_numbers,
            "boxes reserved"
        );
        // The chain client may be gone during shutdown; the reservation then
        // simply expires.
        let _ = self.chain_tx.send(IntendedTx {
            raffle: raffle.clone(),
            reservation: reservation.id,
            buyer: buyer.clone(),
            box_numbers: reservation.box_numbers.clone(),
            amount,
        });
        Ok(reservation)
    }

    /// Confirm a reservation with payment proof: boxes go `Reserved -> Sold`
    /// and `boxes_sold` moves with them. Filling the raffle fires exactly one
    /// randomness request.
    pub fn confirm_purchase(
        &self,
        reservation: ReservationId,
        tx_ref: TxRef,
        now: WallClock,
    ) -> Result<Purchase, AllocationError> {
        let raffle = self
            .ledger
            .raffle_for_reservation(&reservation)
            .ok_or(AllocationError::UnknownReservation(reservation))?;
        let entry = self.ledger.entry(&raffle)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        let mut box_numbers = Vec::new();
        let mut buyer = None;
        let mut expires_at = None;
        for (n, status) in &state.boxes {
            if let BoxStatus::Reserved {
                reservation: r,
                buyer: b,
                expires_at: e,
            } = status
            {
                if *r == reservation {
                    box_numbers.push(*n);
                    buyer = Some(b.clone());
                    expires_at = Some(*e);
                }
            }
        }
        let (buyer, expires_at) = match (buyer, expires_at) {
            (Some(b), Some(e)) => (b, e),
            _ => return Err(AllocationError::UnknownReservation(reservation)),
        };

        // The raffle may have been cancelled between reserve and confirm;
        // a closed raffle accepts no sales.
        if state.raffle.status != RaffleStatus::Active {
            self.ledger.commit(
                &mut state,
                LedgerOp::ReservationReleased {
                    raffle: raffle.clone(),
                    reservation,
                    reason: ReleaseReason::RaffleClosed,
                },
            )?;
            return Err(AllocationError::RaffleNotActive {
                raffle: raffle.clone(),
                status: state.raffle.status.as_str(),
            });
        }

        if expires_at < now {
            self.ledger.commit(
                &mut state,
                LedgerOp::ReservationReleased {
                    raffle: raffle.clone(),
                    reservation,
                    reason: ReleaseReason::Expired,
                },
            )?;
            return Err(AllocationError::ReservationExpired(reservation));
        }

        let purchase = Purchase {
            raffle: raffle.clone(),
            user: buyer,
            box_numbers,
            tx_ref,
            at: now,
        };
        self.ledger.commit(
            &mut state,
            LedgerOp::PurchaseCommitted {
                purchase: purchase.clone(),
                reservation: Some(reservation),
                event_id: None,
            },
        )?;

        let mut filled = false;
        if state.raffle.status == RaffleStatus::Active && state.raffle.is_full() {
            self.ledger.commit(
                &mut state,
                LedgerOp::RaffleFilled {
                    raffle: raffle.clone(),
                    at: now,
                    event_id: None,
                },
            )?;
            filled = state.raffle.status == RaffleStatus::Full;
        }
        drop(state);

        tracing::info!(
            raffle = %raffle,
            user = %purchase.user,
            boxes = ?purchase.box_numbers,
            filled,
            "purchase confirmed"
        );
        if filled {
            // The status guard above makes this fire exactly once per fill;
            // the coordinator is idempotent anyway.
            if let Err(err) = self.coordinator.request_randomness(&raffle, now) {
                tracing::warn!(raffle = %raffle, error = %err, "randomness request failed");
            }
        }
        Ok(purchase)
    }

    /// Sweep expired reservations back to `Available` across all raffles.
    pub fn release_expired(&self, now: WallClock) -> Result<usize, AllocationError> {
        let mut released = 0;
        for raffle in self.ledger.raffle_ids() {
            let entry = self.ledger.entry(&raffle)?;
            let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
            let expired: BTreeSet<ReservationId> = state
                .boxes
                .values()
                .filter_map(|status| match status {
                    BoxStatus::Reserved {
                        reservation,
                        expires_at,
                        ..
                    } if *expires_at < now => Some(*reservation),
                    _ => None,
                })
                .collect();
            for reservation in expired {
                self.ledger.commit(
                    &mut state,
                    LedgerOp::ReservationReleased {
                        raffle: raffle.clone(),
                        reservation,
                        reason: ReleaseReason::Expired,
                    },
                )?;
                tracing::debug!(raffle = %raffle, reservation = %reservation, "reservation expired");
                released += 1;
            }
        }
        Ok(released)
    }

    /// Cancel a raffle; every sold box becomes a refund. Permitted while
    /// `Active` with no randomness request issued, and from `Full` once the
    /// request has `Failed` (the operator's way out of a dead oracle).
    pub fn cancel_raffle(
        &self,
        raffle: &RaffleId,
        reason: &str,
        now: WallClock,
    ) -> Result<(), AllocationError> {
        let entry = self
            .ledger
            .entry(raffle)
            .map_err(|_| AllocationError::UnknownRaffle(raffle.clone()))?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        match state.raffle.status {
            RaffleStatus::Active => {
                if state.randomness.is_some() {
                    return Err(AllocationError::CancelRefused {
                        raffle: raffle.clone(),
                        reason: "randomness already requested".into(),
                    });
                }
            }
            RaffleStatus::Full => {
                let failed = state
                    .randomness
                    .as_ref()
                    .is_some_and(|r| r.status == RandomnessStatus::Failed);
                if !failed {
                    return Err(AllocationError::CancelRefused {
                        raffle: raffle.clone(),
                        reason: "randomness outstanding or fulfilled".into(),
                    });
                }
            }
            _ => {
                return Err(AllocationError::RaffleNotActive {
                    raffle: raffle.clone(),
                    status: state.raffle.status.as_str(),
                });
            }
        }

        self.ledger.commit(
            &mut state,
            LedgerOp::RaffleCancelled {
                raffle: raffle.clone(),
                reason: reason.to_string(),
                at: now,
                event_id: None,
            },
        )?;
        drop(state);

        tracing::info!(raffle = %raffle, reason, "raffle cancelled");
        if let Err(err) = self.settlement.on_cancelled(raffle, now) {
            tracing::warn!(raffle = %raffle, error = %err, "cancellation settlement failed");
        }
        Ok(())
    }

    /// Currently available box numbers; a consistent snapshot under the same
    /// lock writers hold.
    pub fn availability(&self, raffle: &RaffleId) -> Result<Vec<u32>, AllocationError> {
        self.ledger
            .available_boxes(raffle)
            .map_err(AllocationError::from)
    }
}

fn mint_raffle_id() -> RaffleId {
    let suffix = Uuid::new_v4().simple().to_string();
    RaffleId::parse(&format!("rf-{suffix}")).expect("minted raffle id is valid")
}
