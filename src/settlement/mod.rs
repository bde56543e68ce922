//! Settlement dispatcher: credits, refunds, and winner obligations.
//!
//! Decisions are journaled as `Owed` rows first, then dispatched to the
//! payment subsystem and marked `Issued`. The owed/issued split means a
//! crash mid-dispatch resumes without paying anyone twice, and the
//! insert-if-absent keying means replayed completion or cancellation events
//! never double-grant.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

use crate::config::SettlementConfig;
use crate::core::{
    FulfillmentObligation, RaffleId, RaffleStatus, SettleKind, SettlementKey, SettlementRecord,
    SettlementPhase, TxRef, UserId, WallClock,
};
use crate::error::{Effect, Transience};
use crate::ledger::{Ledger, LedgerError, LedgerOp};

/// Outbound payment/credit subsystem - an excluded collaborator.
///
/// Implementations must treat the settlement key as an idempotency key: a
/// second call with the same key must not move money again.
pub trait PaymentGateway: Send + Sync {
    fn grant_credit(
        &self,
        user: &UserId,
        amount: u64,
        key: &SettlementKey,
    ) -> Result<(), GatewayError>;

    fn refund(&self, tx_ref: &TxRef, key: &SettlementKey) -> Result<(), GatewayError>;
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient gateway failure: {0}")]
    Transient(String),
    #[error("permanent gateway failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettleError {
    #[error("raffle {raffle} is {status}; settlement needs a terminal status")]
    NotTerminal {
        raffle: RaffleId,
        status: &'static str,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SettleError {
    pub fn transience(&self) -> Transience {
        match self {
            SettleError::Ledger(e) => e.transience(),
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            SettleError::Ledger(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

pub struct SettlementDispatcher {
    ledger: Arc<Ledger>,
    config: SettlementConfig,
    gateway: Box<dyn PaymentGateway>,
}

impl SettlementDispatcher {
    pub fn new(
        ledger: Arc<Ledger>,
        config: SettlementConfig,
        gateway: Box<dyn PaymentGateway>,
    ) -> Self {
        Self {
            ledger,
            config,
            gateway,
        }
    }

    /// React to a completed raffle: credit every sold box not owned by a
    /// winner, record a fulfillment obligation per winner.
    pub fn on_completed(&self, raffle: &RaffleId, now: WallClock) -> Result<(), SettleError> {
        let entry = self.ledger.entry(raffle)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        if state.raffle.status != RaffleStatus::Completed {
            return Err(SettleError::NotTerminal {
                raffle: raffle.clone(),
                status: state.raffle.status.as_str(),
            });
        }

        let winning: BTreeSet<UserId> = state
            .winners
            .iter()
            .map(|w| w.participant.clone())
            .collect();
        let box_price = state.raffle.box_price;

        for (box_number, owner) in state.sold_boxes() {
            if winning.contains(&owner) {
                continue;
            }
            let key = SettlementKey {
                raffle: raffle.clone(),
                user: owner,
                box_number,
            };
            self.ledger.commit(
                &mut state,
                LedgerOp::SettlementOwed {
                    record: SettlementRecord {
                        key,
                        kind: SettleKind::Credit,
                        amount: box_price,
                        tx_ref: None,
                        phase: SettlementPhase::Owed,
                    },
                },
            )?;
        }

        let winners = state.winners.clone();
        for winner in winners {
            self.ledger.commit(
                &mut state,
                LedgerOp::WinnerObligationRecorded {
                    obligation: FulfillmentObligation {
                        raffle: raffle.clone(),
                        winner_index: winner.winner_index,
                        participant: winner.participant,
                        recorded_at: now,
                    },
                },
            )?;
        }
        drop(state);

        self.dispatch_owed(raffle, now)
    }

    /// React to a cancelled raffle: refund every sold box.
    pub fn on_cancelled(&self, raffle: &RaffleId, now: WallClock) -> Result<(), SettleError> {
        let entry = self.ledger.entry(raffle)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        if state.raffle.status != RaffleStatus::Cancelled {
            return Err(SettleError::NotTerminal {
                raffle: raffle.clone(),
                status: state.raffle.status.as_str(),
            });
        }

        let box_price = state.raffle.box_price;
        let sold: Vec<(u32, UserId, TxRef)> = state
            .boxes
            .iter()
            .filter_map(|(n, status)| match status {
                crate::core::BoxStatus::Sold { owner, tx_ref } => {
                    Some((*n, owner.clone(), tx_ref.clone()))
                }
                _ => None,
            })
            .collect();

        for (box_number, owner, tx_ref) in sold {
            let key = SettlementKey {
                raffle: raffle.clone(),
                user: owner,
                box_number,
            };
            self.ledger.commit(
                &mut state,
                LedgerOp::SettlementOwed {
                    record: SettlementRecord {
                        key,
                        kind: SettleKind::Refund,
                        amount: box_price,
                        tx_ref: Some(tx_ref),
                        phase: SettlementPhase::Owed,
                    },
                },
            )?;
        }
        drop(state);

        self.dispatch_owed(raffle, now)
    }

    /// Re-dispatch anything still owed across all raffles. Called at startup
    /// so a crash between owing and issuing resumes cleanly.
    pub fn dispatch_pending(&self, now: WallClock) -> Result<(), SettleError> {
        for raffle in self.ledger.raffle_ids() {
            self.dispatch_owed(&raffle, now)?;
        }
        Ok(())
    }

    /// Owed records stuck on the escalation list for a raffle.
    pub fn escalations(&self, raffle: &RaffleId) -> Result<Vec<SettlementRecord>, SettleError> {
        let entry = self.ledger.entry(raffle)?;
        let state = entry.lock().unwrap_or_else(|p| p.into_inner());
        Ok(state
            .settlement
            .values()
            .filter(|r| matches!(r.phase, SettlementPhase::Escalated { .. }))
            .cloned()
            .collect())
    }

    /// Dispatch every `Owed` record for one raffle: call the gateway, mark
    /// `Issued` on success, retry transient failures up to the budget, then
    /// escalate. Gateway calls run without the raffle lock held.
    fn dispatch_owed(&self, raffle: &RaffleId, now: WallClock) -> Result<(), SettleError> {
        let owed: Vec<SettlementRecord> = {
            let entry = self.ledger.entry(raffle)?;
            let state = entry.lock().unwrap_or_else(|p| p.into_inner());
            state
                .settlement
                .values()
                .filter(|r| r.is_owed())
                .cloned()
                .collect()
        };

        for record in owed {
            let mut outcome = None;
            for attempt in 1..=self.config.retry_budget {
                let result = match record.kind {
                    SettleKind::Credit => {
                        self.gateway
                            .grant_credit(&record.key.user, record.amount, &record.key)
                    }
                    SettleKind::Refund => match &record.tx_ref {
                        Some(tx_ref) => self.gateway.refund(tx_ref, &record.key),
                        None => Err(GatewayError::Permanent(
                            "refund record missing original tx_ref".into(),
                        )),
                    },
                };
                match result {
                    Ok(()) => {
                        outcome = Some(Ok(()));
                        break;
                    }
                    Err(GatewayError::Transient(reason)) => {
                        tracing::debug!(
                            key = %record.key,
                            attempt,
                            reason,
                            "settlement dispatch retrying"
                        );
                        outcome = Some(Err(reason));
                    }
                    Err(GatewayError::Permanent(reason)) => {
                        outcome = Some(Err(reason));
                        break;
                    }
                }
            }

            let entry = self.ledger.entry(raffle)?;
            let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
            // Re-check: another dispatcher may have issued it meanwhile.
            let still_owed = state
                .settlement
                .get(&record.key)
                .map(SettlementRecord::is_owed)
                .unwrap_or(false);
            if !still_owed {
                continue;
            }
            match outcome {
                Some(Ok(())) => {
                    self.ledger.commit(
                        &mut state,
                        LedgerOp::SettlementIssued {
                            raffle: raffle.clone(),
                            key: record.key.clone(),
                            at: now,
                        },
                    )?;
                    tracing::info!(key = %record.key, kind = ?record.kind, "settlement issued");
                }
                Some(Err(reason)) => {
                    self.ledger.commit(
                        &mut state,
                        LedgerOp::SettlementEscalated {
                            raffle: raffle.clone(),
                            key: record.key.clone(),
                            reason: reason.clone(),
                        },
                    )?;
                    tracing::error!(
                        key = %record.key,
                        reason,
                        "settlement escalated; operator action required"
                    );
                }
                None => {}
            }
        }
        Ok(())
    }
}
