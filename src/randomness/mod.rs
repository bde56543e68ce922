//! Randomness coordinator: oracle request lifecycle and winner derivation.
//!
//! One durable two-phase record per raffle (`Requested` then `Fulfilled` or
//! `Failed`); fulfillment may arrive arbitrarily late, including across
//! process restarts. Winner derivation is deterministic in the random value,
//! so replaying a fulfillment reproduces the identical winner set.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::RandomnessConfig;
use crate::core::{
    RaffleId, RaffleStatus, RandomValue, RandomnessRequest, RandomnessRequestId, RandomnessStatus,
    UserId, WallClock, Winner,
};
use crate::error::{Effect, Transience};
use crate::ledger::{Ledger, LedgerError, LedgerOp, RaffleState};
use crate::settlement::SettlementDispatcher;

/// Outbound call to the external verifiable-randomness oracle. The real
/// oracle is an excluded collaborator; implementations just deliver the
/// correlation id.
pub trait OracleClient: Send + Sync {
    fn request_randomness(
        &self,
        raffle: &RaffleId,
        request_id: RandomnessRequestId,
    ) -> Result<(), OracleError>;
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RandomnessError {
    #[error("unknown randomness request {0}")]
    UnknownRequest(RandomnessRequestId),
    #[error("request {0} is stale (superseded or no longer outstanding)")]
    StaleRequest(RandomnessRequestId),
    #[error("raffle {raffle} is {status}; fulfillment only accepted while full")]
    RaffleNotFull {
        raffle: RaffleId,
        status: &'static str,
    },
    #[error("raffle {0} randomness previously failed; operator override required")]
    NeedsOperator(RaffleId),
    #[error("raffle {0} has no participants to draw from")]
    NoParticipants(RaffleId),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl RandomnessError {
    pub fn transience(&self) -> Transience {
        match self {
            RandomnessError::Oracle(_) => Transience::Retryable,
            RandomnessError::Ledger(e) => e.transience(),
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            RandomnessError::Oracle(_) => Effect::Unknown,
            RandomnessError::Ledger(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

pub struct RandomnessCoordinator {
    ledger: Arc<Ledger>,
    config: RandomnessConfig,
    oracle: Box<dyn OracleClient>,
    settlement: Arc<SettlementDispatcher>,
}

impl RandomnessCoordinator {
    pub fn new(
        ledger: Arc<Ledger>,
        config: RandomnessConfig,
        oracle: Box<dyn OracleClient>,
        settlement: Arc<SettlementDispatcher>,
    ) -> Self {
        Self {
            ledger,
            config,
            oracle,
            settlement,
        }
    }

    /// Issue the oracle request for a filled raffle. Idempotent by raffle:
    /// an existing outstanding or fulfilled request makes this a no-op. A
    /// `Failed` request refuses re-requests without the operator path, to
    /// avoid unbounded retry storms against the oracle.
    pub fn request_randomness(
        &self,
        raffle: &RaffleId,
        now: WallClock,
    ) -> Result<(), RandomnessError> {
        let entry = self.ledger.entry(raffle)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        match state.randomness.as_ref().map(|r| r.status) {
            Some(RandomnessStatus::Requested) | Some(RandomnessStatus::Fulfilled) => {
                return Ok(());
            }
            Some(RandomnessStatus::Failed) => {
                return Err(RandomnessError::NeedsOperator(raffle.clone()));
            }
            None => {}
        }

        let request = RandomnessRequest::new(raffle.clone(), RandomnessRequestId::mint(), now);
        let request_id = request.request_id;
        self.ledger
            .commit(&mut state, LedgerOp::RandomnessRequested { request })?;
        drop(state);

        tracing::info!(raffle = %raffle, request = %request_id, "randomness requested");
        self.oracle.request_randomness(raffle, request_id)?;
        Ok(())
    }

    /// Accept an oracle fulfillment. Unknown, stale, or duplicate request ids
    /// are replay-protected: a duplicate returns the already-derived winner
    /// set without re-deriving; stale ids are rejected.
    pub fn on_fulfilled(
        &self,
        request_id: RandomnessRequestId,
        random_value: RandomValue,
        now: WallClock,
    ) -> Result<Vec<Winner>, RandomnessError> {
        let raffle = self
            .ledger
            .raffle_for_request(&request_id)
            .ok_or(RandomnessError::UnknownRequest(request_id))?;
        let entry = self.ledger.entry(&raffle)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        let request = match state.randomness.as_ref() {
            Some(request) if request.request_id == request_id => request,
            // Superseded by an operator re-request.
            _ => return Err(RandomnessError::StaleRequest(request_id)),
        };
        match request.status {
            RandomnessStatus::Fulfilled => {
                // Same request fulfilled twice: same winners, no re-derivation.
                return Ok(state.winners.clone());
            }
            RandomnessStatus::Failed => {
                return Err(RandomnessError::StaleRequest(request_id));
            }
            RandomnessStatus::Requested => {}
        }
        if state.raffle.status != RaffleStatus::Full {
            return Err(RandomnessError::RaffleNotFull {
                raffle: raffle.clone(),
                status: state.raffle.status.as_str(),
            });
        }

        let winners = derive_winners(&state, random_value, now);
        if winners.is_empty() {
            return Err(RandomnessError::NoParticipants(raffle.clone()));
        }
        self.ledger.commit(
            &mut state,
            LedgerOp::RandomnessFulfilled {
                raffle: raffle.clone(),
                request_id,
                random_value,
                winners: winners.clone(),
                at: now,
                event_id: None,
            },
        )?;
        drop(state);

        tracing::info!(
            raffle = %raffle,
            request = %request_id,
            winners = winners.len(),
            "randomness fulfilled, raffle completed"
        );
        if let Err(err) = self.settlement.on_completed(&raffle, now) {
            tracing::warn!(raffle = %raffle, error = %err, "completion settlement failed");
        }
        Ok(winners)
    }

    /// Mark outstanding requests older than the configured window `Failed`.
    /// Returns the raffles that timed out; each needs an operator re-request
    /// or cancellation.
    pub fn check_timeouts(&self, now: WallClock) -> Result<Vec<RaffleId>, RandomnessError> {
        let mut timed_out = Vec::new();
        for raffle in self.ledger.raffle_ids() {
            let entry = self.ledger.entry(&raffle)?;
            let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
            let expired = state.randomness.as_ref().is_some_and(|r| {
                r.is_outstanding() && now.since(r.requested_at) > self.config.fulfillment_timeout_ms
            });
            if expired {
                self.ledger.commit(
                    &mut state,
                    LedgerOp::RandomnessFailed {
                        raffle: raffle.clone(),
                        at: now,
                    },
                )?;
                tracing::warn!(raffle = %raffle, "randomness request timed out");
                timed_out.push(raffle);
            }
        }
        Ok(timed_out)
    }

    /// Operator override: replace a `Failed` request with a fresh one.
    pub fn operator_rerequest(
        &self,
        raffle: &RaffleId,
        now: WallClock,
    ) -> Result<RandomnessRequestId, RandomnessError> {
        let entry = self.ledger.entry(raffle)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        match state.randomness.as_ref().map(|r| r.status) {
            Some(RandomnessStatus::Failed) => {}
            _ => return Err(RandomnessError::NeedsOperator(raffle.clone())),
        }
        if state.raffle.status != RaffleStatus::Full {
            return Err(RandomnessError::RaffleNotFull {
                raffle: raffle.clone(),
                status: state.raffle.status.as_str(),
            });
        }

        let request = RandomnessRequest::new(raffle.clone(), RandomnessRequestId::mint(), now);
        let request_id = request.request_id;
        self.ledger
            .commit(&mut state, LedgerOp::RandomnessRequested { request })?;
        drop(state);

        tracing::info!(raffle = %raffle, request = %request_id, "operator re-requested randomness");
        self.oracle.request_randomness(raffle, request_id)?;
        Ok(request_id)
    }
}

/// Deterministically derive winners from a random value.
///
/// The seed is SHA-256 over the random value and the raffle id, so distinct
/// raffles fulfilled with the same value draw differently. Candidates are the
/// sold-box owners in box-number order: deduplicated by participant unless
/// the raffle policy allows repeat wins, in which case every box is a ticket.
/// The pool is shuffled with a seeded `StdRng` and the first `total_winners`
/// entries win; a pool smaller than `total_winners` yields fewer winners.
pub fn derive_winners(
    state: &RaffleState,
    random_value: RandomValue,
    now: WallClock,
) -> Vec<Winner> {
    let sold = state.sold_boxes();

    let mut candidates: Vec<UserId> = Vec::with_capacity(sold.len());
    if state.raffle.policy.allow_repeat_wins {
        candidates.extend(sold.into_iter().map(|(_, owner)| owner));
    } else {
        for (_, owner) in sold {
            if !candidates.contains(&owner) {
                candidates.push(owner);
            }
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(random_value.as_bytes());
    hasher.update(state.raffle.id.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    let mut rng = StdRng::from_seed(seed);

    candidates.shuffle(&mut rng);
    candidates
        .into_iter()
        .take(state.raffle.total_winners as usize)
        .enumerate()
        .map(|(i, participant)| Winner {
            raffle: state.raffle.id.clone(),
            winner_index: i as u32,
            participant,
            derived_at: now,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Purchase, Raffle, RafflePolicy, RaffleSpec, TxRef};

    fn filled_state(total_boxes: u32, total_winners: u32, allow_repeat_wins: bool) -> RaffleState {
        let raffle = Raffle::new(
            RaffleId::parse("rf-w1").unwrap(),
            RaffleSpec {
                item_ref: "item".into(),
                total_boxes,
                box_price: 5,
                total_winners,
                policy: RafflePolicy { allow_repeat_wins },
            },
            WallClock(0),
        );
        let mut state = RaffleState::new(raffle);
        for n in 1..=total_boxes {
            let user = format!("buyer-{}", (n % 4) + 1);
            state
                .apply(&LedgerOp::PurchaseCommitted {
                    purchase: Purchase {
                        raffle: state.raffle.id.clone(),
                        user: UserId::new(user).unwrap(),
                        box_numbers: vec![n],
                        tx_ref: TxRef::new(format!("tx{n}")).unwrap(),
                        at: WallClock(1),
                    },
                    reservation: None,
                    event_id: None,
                })
                .unwrap();
        }
        state
    }

    #[test]
    fn derivation_is_deterministic() {
        let state = filled_state(8, 2, false);
        let value = RandomValue([7u8; 32]);
        let a = derive_winners(&state, value, WallClock(10));
        let b = derive_winners(&state, value, WallClock(10));
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn winners_are_drawn_from_participants() {
        let state = filled_state(8, 2, false);
        let participants: Vec<UserId> = state
            .sold_boxes()
            .into_iter()
            .map(|(_, owner)| owner)
            .collect();
        for value in [[1u8; 32], [2u8; 32], [200u8; 32]] {
            let winners = derive_winners(&state, RandomValue(value), WallClock(10));
            assert_eq!(winners.len(), 2);
            for w in &winners {
                assert!(participants.contains(&w.participant));
            }
            // Indexes are dense from zero.
            let indexes: Vec<u32> = winners.iter().map(|w| w.winner_index).collect();
            assert_eq!(indexes, vec![0, 1]);
        }
    }

    #[test]
    fn no_repeat_wins_dedupes_participants() {
        // 8 boxes over 4 buyers, 4 winner slots: each buyer at most once.
        let state = filled_state(8, 4, false);
        let winners = derive_winners(&state, RandomValue([9u8; 32]), WallClock(10));
        assert_eq!(winners.len(), 4);
        let mut seen = std::collections::BTreeSet::new();
        for w in &winners {
            assert!(seen.insert(w.participant.clone()), "duplicate winner");
        }
    }

    #[test]
    fn repeat_wins_draws_per_box() {
        let state = filled_state(8, 6, true);
        let winners = derive_winners(&state, RandomValue([9u8; 32]), WallClock(10));
        assert_eq!(winners.len(), 6);
    }

    #[test]
    fn pool_smaller_than_slots_caps_winner_count() {
        // 4 distinct buyers, 4 slots requested via repeat-off and small pool.
        let state = filled_state(4, 4, false);
        let winners = derive_winners(&state, RandomValue([3u8; 32]), WallClock(10));
        assert!(winners.len() <= 4);
    }
}
