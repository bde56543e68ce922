//! Chain reconciler: replays the canonical on-chain event stream into the
//! ledger so off-chain state never permanently diverges from on-chain truth.
//!
//! Events are consumed in strictly increasing sequence order from a durable
//! cursor; application is idempotent keyed on the event's on-chain identity;
//! a failing apply holds the cursor and retries with exponential backoff and
//! bounded jitter. Where a confirmed event contradicts the local optimistic
//! view, the chain wins and the local view is corrected.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::{BackoffConfig, ReconcilerConfig};
use crate::core::{
    BoxStatus, ChainEvent, EventId, Purchase, RaffleId, RaffleStatus, ReservationId, SourcedEvent,
    UserId, WallClock,
};
use crate::error::{Effect, Transience};
use crate::ledger::{Ledger, LedgerError, LedgerOp, ReleaseReason};
use crate::randomness::{RandomnessCoordinator, RandomnessError};
use crate::settlement::SettlementDispatcher;

/// Ordered feed of confirmed chain events - the excluded blockchain client.
///
/// `fetch` returns events with `seq >= from_seq` in ascending order; the
/// source is at-least-once, so duplicates and re-fetches are expected.
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;
    fn fetch(&self, from_seq: u64, max: usize) -> Result<Vec<SourcedEvent>, SourceError>;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("event source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Randomness(#[from] RandomnessError),
    #[error(transparent)]
    Settle(#[from] crate::settlement::SettleError),
    #[error("chain event {event_id} contradicts local state: {detail}")]
    Integrity { event_id: EventId, detail: String },
}

impl ReconcileError {
    pub fn transience(&self) -> Transience {
        match self {
            ReconcileError::Source(_) => Transience::Retryable,
            ReconcileError::Ledger(e) => e.transience(),
            ReconcileError::Randomness(e) => e.transience(),
            ReconcileError::Settle(e) => e.transience(),
            ReconcileError::Integrity { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        Effect::Unknown
    }
}

/// What one `run_once` pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub applied: usize,
    pub duplicates: usize,
    /// Set when the source returned a sequence past the cursor; the missing
    /// range will be re-fetched next pass.
    pub gap: Option<(u64, u64)>,
}

/// Exponential backoff with bounded jitter.
struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
    current: Duration,
}

impl Backoff {
    fn new(config: BackoffConfig) -> Self {
        let base = Duration::from_millis(config.base_ms);
        Self {
            base,
            max: Duration::from_millis(config.max_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            current: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            delay
        } else {
            delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

pub struct ChainReconciler {
    ledger: Arc<Ledger>,
    config: ReconcilerConfig,
    source: Box<dyn EventSource>,
    coordinator: Arc<RandomnessCoordinator>,
    settlement: Arc<SettlementDispatcher>,
}

/// Shutdown handle for the reconciler thread.
pub struct ReconcilerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

impl ChainReconciler {
    pub fn new(
        ledger: Arc<Ledger>,
        config: ReconcilerConfig,
        source: Box<dyn EventSource>,
        coordinator: Arc<RandomnessCoordinator>,
        settlement: Arc<SettlementDispatcher>,
    ) -> Self {
        Self {
            ledger,
            config,
            source,
            coordinator,
            settlement,
        }
    }

    /// One fetch-and-apply pass from the durable cursor. The cursor advances
    /// past an event only after its application committed, so a crash resumes
    /// at the failed event, never past it.
    pub fn run_once(&self, now: WallClock) -> Result<ReconcileStats, ReconcileError> {
        let mut stats = ReconcileStats::default();
        let source = self.source.name().to_string();
        let mut cursor = self.ledger.cursor(&source);

        let batch = self.source.fetch(cursor, self.config.batch_size)?;
        for event in batch {
            if event.seq < cursor {
                stats.duplicates += 1;
                continue;
            }
            if event.seq > cursor {
                tracing::warn!(
                    source,
                    expected = cursor,
                    got = event.seq,
                    "gap in event stream; holding cursor and re-fetching"
                );
                stats.gap = Some((cursor, event.seq));
                break;
            }
            self.apply_event(&event, now)?;
            cursor = event.seq + 1;
            self.ledger.advance_cursor(&source, cursor)?;
            stats.applied += 1;
        }
        Ok(stats)
    }

    /// Run until shutdown on a dedicated thread, backing off on transient
    /// failure and holding the cursor at the failed position.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let join = thread::spawn(move || {
            let mut backoff = Backoff::new(self.config.backoff);
            while !flag.load(Ordering::Relaxed) {
                match self.run_once(WallClock::now()) {
                    Ok(stats) => {
                        backoff.reset();
                        if stats.applied < self.config.batch_size {
                            thread::sleep(self.config.poll_interval());
                        }
                    }
                    Err(err) if err.transience().is_retryable() => {
                        let delay = backoff.next_delay();
                        tracing::warn!(error = %err, ?delay, "reconcile pass failed; backing off");
                        thread::sleep(delay);
                    }
                    Err(err) => {
                        // Permanent: surfaced for operators, cursor held.
                        tracing::error!(error = %err, "reconcile pass failed permanently");
                        thread::sleep(self.config.poll_interval());
                    }
                }
            }
        });
        ReconcilerHandle { shutdown, join }
    }

    fn apply_event(&self, event: &SourcedEvent, now: WallClock) -> Result<(), ReconcileError> {
        tracing::debug!(
            seq = event.seq,
            event_id = %event.event_id,
            kind = event.event.kind(),
            "applying chain event"
        );
        match &event.event {
            ChainEvent::PurchaseConfirmed {
                raffle,
                buyer,
                box_numbers,
            } => self.apply_purchase(raffle, buyer, box_numbers, event, now),

            ChainEvent::RaffleFilled { raffle } => {
                let entry = self.ledger.entry(raffle)?;
                let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
                self.ledger.commit(
                    &mut state,
                    LedgerOp::RaffleFilled {
                        raffle: raffle.clone(),
                        at: now,
                        event_id: Some(event.event_id.clone()),
                    },
                )?;
                let full = state.raffle.status == RaffleStatus::Full;
                drop(state);
                if full {
                    // Idempotent: a request issued by the local fill trigger
                    // makes this a no-op.
                    match self.coordinator.request_randomness(raffle, now) {
                        Ok(()) | Err(RandomnessError::NeedsOperator(_)) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }

            ChainEvent::RandomnessFulfilled {
                request_id,
                random_value,
                ..
            } => match self.coordinator.on_fulfilled(*request_id, *random_value, now) {
                Ok(_) => Ok(()),
                // Superseded request: the chain fact is stale relative to an
                // operator re-request; absorbed, not a wedge.
                Err(RandomnessError::StaleRequest(id)) => {
                    tracing::warn!(request = %id, "stale fulfillment from chain; skipped");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            },

            ChainEvent::RaffleCancelled { raffle, .. } => {
                let entry = self.ledger.entry(raffle)?;
                let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
                self.ledger.commit(
                    &mut state,
                    LedgerOp::RaffleCancelled {
                        raffle: raffle.clone(),
                        reason: "cancelled on chain".into(),
                        at: now,
                        event_id: Some(event.event_id.clone()),
                    },
                )?;
                let cancelled = state.raffle.status == RaffleStatus::Cancelled;
                drop(state);
                if cancelled {
                    self.settlement.on_cancelled(raffle, now)?;
                }
                Ok(())
            }
        }
    }

    /// Apply a confirmed purchase, correcting any divergent local view first:
    /// a box the engine still holds `Reserved` is released (the reservation
    /// is void - the chain confirmed someone else), and a box locally `Sold`
    /// to a different owner is overwritten in the chain's favor.
    fn apply_purchase(
        &self,
        raffle: &RaffleId,
        buyer: &UserId,
        box_numbers: &[u32],
        event: &SourcedEvent,
        now: WallClock,
    ) -> Result<(), ReconcileError> {
        let entry = self.ledger.entry(raffle)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());

        if state.applied_events.contains(&event.event_id) {
            return Ok(());
        }

        let tx_ref = event.event_id.tx_ref.clone();

        // Pass 1: divergence corrections.
        let mut void_reservations: BTreeSet<ReservationId> = BTreeSet::new();
        let mut corrections: Vec<u32> = Vec::new();
        for n in box_numbers {
            match state.boxes.get(n) {
                Some(BoxStatus::Reserved {
                    reservation, buyer: holder, ..
                }) if holder != buyer => {
                    void_reservations.insert(*reservation);
                }
                Some(BoxStatus::Reserved { reservation, .. }) => {
                    // Same buyer: their own unconfirmed reservation; the
                    // chain confirmation supersedes it.
                    void_reservations.insert(*reservation);
                }
                Some(BoxStatus::Sold { owner, .. }) if owner != buyer => {
                    corrections.push(*n);
                }
                Some(_) => {}
                None => {
                    return Err(ReconcileError::Integrity {
                        event_id: event.event_id.clone(),
                        detail: format!("box {n} out of range for {raffle}"),
                    });
                }
            }
        }
        for reservation in void_reservations {
            tracing::warn!(
                raffle = %raffle,
                reservation = %reservation,
                event_id = %event.event_id,
                "chain contradicts local reservation; releasing"
            );
            self.ledger.commit(
                &mut state,
                LedgerOp::ReservationReleased {
                    raffle: raffle.clone(),
                    reservation,
                    reason: ReleaseReason::Divergence,
                },
            )?;
        }
        for n in corrections {
            tracing::warn!(
                raffle = %raffle,
                box_number = n,
                event_id = %event.event_id,
                "chain contradicts local box owner; correcting"
            );
            self.ledger.commit(
                &mut state,
                LedgerOp::BoxOwnerCorrected {
                    raffle: raffle.clone(),
                    box_number: n,
                    owner: buyer.clone(),
                    tx_ref: tx_ref.clone(),
                    event_id: event.event_id.clone(),
                },
            )?;
        }

        // Pass 2: the purchase itself, idempotent by event id.
        self.ledger.commit(
            &mut state,
            LedgerOp::PurchaseCommitted {
                purchase: Purchase {
                    raffle: raffle.clone(),
                    user: buyer.clone(),
                    box_numbers: box_numbers.to_vec(),
                    tx_ref,
                    at: now,
                },
                reservation: None,
                event_id: Some(event.event_id.clone()),
            },
        )?;
        Ok(())
    }
}
