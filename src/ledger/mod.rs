//! Ledger store: the single shared mutable resource across components.
//!
//! Holds one mutex-guarded `RaffleState` per raffle (the per-raffle
//! serialization boundary), global lookup indexes for reservations and
//! randomness requests, durable chain-event cursors, and the append-only
//! journal. Every mutation goes through `commit`, which applies the op and
//! journals it before returning, so `open` can rebuild identical state.

pub mod journal;
mod state;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use thiserror::Error;

use crate::core::{
    CreditGrant, Raffle, RaffleId, RandomnessRequestId, ReservationId, SettleKind,
    SettlementPhase, UserId, WallClock, Winner,
};

pub use journal::{Journal, JournalError, JournalRecord, LedgerOp, ReleaseReason};
pub use state::{ApplyError, RaffleState};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("unknown raffle {0}")]
    UnknownRaffle(RaffleId),
    #[error("raffle {0} already exists")]
    DuplicateRaffle(RaffleId),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl LedgerError {
    pub fn transience(&self) -> crate::error::Transience {
        match self {
            LedgerError::Journal(_) => crate::error::Transience::Retryable,
            _ => crate::error::Transience::Permanent,
        }
    }
}

/// Recover a guard from a poisoned mutex; state behind these locks is only
/// mutated through `commit`, which keeps it consistent even if a panicking
/// reader held the lock.
fn lock_state(entry: &Mutex<RaffleState>) -> MutexGuard<'_, RaffleState> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Ledger {
    dir: PathBuf,
    raffles: RwLock<HashMap<RaffleId, Arc<Mutex<RaffleState>>>>,
    /// reservation -> raffle, for confirm/expire lookups.
    reservations: Mutex<HashMap<ReservationId, RaffleId>>,
    /// randomness request -> raffle, for oracle callbacks.
    requests: Mutex<HashMap<RandomnessRequestId, RaffleId>>,
    /// source name -> next sequence to apply.
    cursors: Mutex<BTreeMap<String, u64>>,
    journal: Mutex<Journal>,
}

impl Ledger {
    /// Open the store at `dir`, replaying the journal to rebuild state.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        let records = journal::read_all(&dir)?;
        let journal = Journal::open_append(&dir)?;
        let ledger = Self {
            dir,
            raffles: RwLock::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            cursors: Mutex::new(BTreeMap::new()),
            journal: Mutex::new(journal),
        };
        for record in records {
            ledger.replay(record.op)?;
        }
        Ok(ledger)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn replay(&self, op: LedgerOp) -> Result<(), LedgerError> {
        match &op {
            LedgerOp::RaffleCreated { raffle } => {
                self.insert_raffle(raffle.clone())?;
            }
            LedgerOp::CursorAdvanced { source, next_seq } => {
                self.cursors
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(source.clone(), *next_seq);
            }
            _ => {
                let raffle = op
                    .raffle()
                    .expect("raffle-scoped op without raffle id")
                    .clone();
                let entry = self.entry(&raffle)?;
                let mut state = lock_state(&entry);
                state.apply(&op)?;
                drop(state);
                self.index(&op);
            }
        }
        Ok(())
    }

    fn insert_raffle(&self, raffle: Raffle) -> Result<(), LedgerError> {
        let mut raffles = self.raffles.write().unwrap_or_else(|p| p.into_inner());
        if raffles.contains_key(&raffle.id) {
            return Err(LedgerError::DuplicateRaffle(raffle.id));
        }
        let id = raffle.id.clone();
        raffles.insert(id, Arc::new(Mutex::new(RaffleState::new(raffle))));
        Ok(())
    }

    /// Keep the cross-raffle lookup indexes in step with a committed op.
    fn index(&self, op: &LedgerOp) {
        match op {
            LedgerOp::BoxesReserved {
                raffle,
                reservation,
                ..
            } => {
                self.reservations
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(*reservation, raffle.clone());
            }
            LedgerOp::ReservationReleased { reservation, .. } => {
                self.reservations
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(reservation);
            }
            LedgerOp::PurchaseCommitted {
                reservation: Some(reservation),
                ..
            } => {
                self.reservations
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(reservation);
            }
            LedgerOp::RandomnessRequested { request } => {
                self.requests
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(request.request_id, request.raffle.clone());
            }
            LedgerOp::CursorAdvanced { source, next_seq } => {
                self.cursors
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(source.clone(), *next_seq);
            }
            _ => {}
        }
    }

    /// Create a raffle: journals the creation and makes the entry visible.
    pub fn create_raffle(&self, raffle: Raffle, now: WallClock) -> Result<(), LedgerError> {
        self.insert_raffle(raffle.clone())?;
        self.append(now, LedgerOp::RaffleCreated { raffle })
    }

    /// The serialization handle for one raffle. Callers lock it for the whole
    /// critical section and pass the guard to `commit`.
    pub fn entry(&self, id: &RaffleId) -> Result<Arc<Mutex<RaffleState>>, LedgerError> {
        self.raffles
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownRaffle(id.clone()))
    }

    /// Apply an op to an already-locked raffle state and journal it.
    ///
    /// The caller holds the raffle mutex, so the apply and the durable append
    /// are atomic with respect to other writers of this raffle.
    pub fn commit(&self, state: &mut RaffleState, op: LedgerOp) -> Result<(), LedgerError> {
        state.apply(&op)?;
        self.index(&op);
        self.append(WallClock::now(), op)
    }

    fn append(&self, at: WallClock, op: LedgerOp) -> Result<(), LedgerError> {
        self.journal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .append(&JournalRecord { at, op })?;
        Ok(())
    }

    pub fn raffle_for_reservation(&self, id: &ReservationId) -> Option<RaffleId> {
        self.reservations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn raffle_for_request(&self, id: &RandomnessRequestId) -> Option<RaffleId> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Next sequence to apply for an event source; zero for a fresh source.
    pub fn cursor(&self, source: &str) -> u64 {
        self.cursors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(source)
            .copied()
            .unwrap_or(0)
    }

    /// Durably advance an event-source cursor.
    pub fn advance_cursor(&self, source: &str, next_seq: u64) -> Result<(), LedgerError> {
        self.cursors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(source.to_string(), next_seq);
        self.append(
            WallClock::now(),
            LedgerOp::CursorAdvanced {
                source: source.to_string(),
                next_seq,
            },
        )
    }

    pub fn raffle_ids(&self) -> Vec<RaffleId> {
        self.raffles
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    // ---- read-side queries; each observes a consistent snapshot by taking
    // ---- the same per-raffle lock writers hold.

    pub fn raffle(&self, id: &RaffleId) -> Result<Raffle, LedgerError> {
        let entry = self.entry(id)?;
        let state = lock_state(&entry);
        Ok(state.raffle.clone())
    }

    pub fn available_boxes(&self, id: &RaffleId) -> Result<Vec<u32>, LedgerError> {
        let entry = self.entry(id)?;
        let state = lock_state(&entry);
        Ok(state.available_boxes())
    }

    pub fn winners(&self, id: &RaffleId) -> Result<Vec<Winner>, LedgerError> {
        let entry = self.entry(id)?;
        let state = lock_state(&entry);
        Ok(state.winners.clone())
    }

    /// Issued credits for a user across all raffles.
    pub fn credit_grants_for(&self, user: &UserId) -> Vec<CreditGrant> {
        let entries: Vec<_> = {
            let raffles = self.raffles.read().unwrap_or_else(|p| p.into_inner());
            raffles.values().cloned().collect()
        };
        let mut grants = Vec::new();
        for entry in entries {
            let state = lock_state(&entry);
            for record in state.settlement.values() {
                if record.kind != SettleKind::Credit || &record.key.user != user {
                    continue;
                }
                if let SettlementPhase::Issued { at } = record.phase {
                    grants.push(CreditGrant {
                        user: user.clone(),
                        amount: record.amount,
                        source_raffle: record.key.raffle.clone(),
                        key: record.key.clone(),
                        issued_at: at,
                    });
                }
            }
        }
        grants.sort_by(|a, b| a.key.cmp(&b.key));
        grants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RafflePolicy, RaffleSpec};
    use tempfile::TempDir;

    fn spec() -> RaffleSpec {
        RaffleSpec {
            item_ref: "item".into(),
            total_boxes: 3,
            box_price: 5,
            total_winners: 1,
            policy: RafflePolicy::default(),
        }
    }

    #[test]
    fn reopen_rebuilds_raffles_and_cursors() {
        let dir = TempDir::new().unwrap();
        let id = RaffleId::parse("rf-abc").unwrap();
        {
            let ledger = Ledger::open(dir.path()).unwrap();
            ledger
                .create_raffle(Raffle::new(id.clone(), spec(), WallClock(1)), WallClock(1))
                .unwrap();
            ledger.advance_cursor("devnet", 17).unwrap();
        }
        let ledger = Ledger::open(dir.path()).unwrap();
        assert_eq!(ledger.raffle(&id).unwrap().total_boxes, 3);
        assert_eq!(ledger.cursor("devnet"), 17);
        assert_eq!(ledger.cursor("other"), 0);
    }

    #[test]
    fn duplicate_raffle_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        let id = RaffleId::parse("rf-abc").unwrap();
        ledger
            .create_raffle(Raffle::new(id.clone(), spec(), WallClock(1)), WallClock(1))
            .unwrap();
        let err = ledger
            .create_raffle(Raffle::new(id, spec(), WallClock(2)), WallClock(2))
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateRaffle(_)));
    }
}
