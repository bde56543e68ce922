//! Append-only mutation journal.
//!
//! Every committed ledger mutation is one self-describing JSON line. On open
//! the journal is replayed in order to rebuild canonical state, so no
//! acknowledged transition is lost across a crash. Records are small and the
//! store is single-writer, so line-oriented JSON is enough; there is no
//! segment framing here.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    EventId, FulfillmentObligation, Purchase, Raffle, RaffleId, RandomValue, RandomnessRequest,
    RandomnessRequestId, ReservationId, SettlementKey, SettlementRecord, UserId, WallClock,
    Winner,
};

const JOURNAL_FILE: &str = "journal.log";

/// Why a reservation was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// TTL elapsed without confirmation.
    Expired,
    /// A confirmed chain event contradicted the reservation; the chain won.
    Divergence,
    /// The raffle left `Active` before the reservation was confirmed.
    RaffleClosed,
}

/// One durable ledger mutation.
///
/// Application must be deterministic: replaying the journal from empty state
/// reproduces the state that acknowledged these operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum LedgerOp {
    RaffleCreated {
        raffle: Raffle,
    },
    BoxesReserved {
        raffle: RaffleId,
        reservation: ReservationId,
        buyer: UserId,
        box_numbers: Vec<u32>,
        expires_at: WallClock,
    },
    ReservationReleased {
        raffle: RaffleId,
        reservation: ReservationId,
        reason: ReleaseReason,
    },
    PurchaseCommitted {
        purchase: Purchase,
        /// Local reservation consumed by this purchase, absent when the
        /// purchase was first learned from the chain.
        reservation: Option<ReservationId>,
        /// On-chain identity when applied by the reconciler.
        event_id: Option<EventId>,
    },
    RaffleFilled {
        raffle: RaffleId,
        at: WallClock,
        event_id: Option<EventId>,
    },
    RandomnessRequested {
        request: RandomnessRequest,
    },
    RandomnessFailed {
        raffle: RaffleId,
        at: WallClock,
    },
    RandomnessFulfilled {
        raffle: RaffleId,
        request_id: RandomnessRequestId,
        random_value: RandomValue,
        winners: Vec<Winner>,
        at: WallClock,
        event_id: Option<EventId>,
    },
    RaffleCancelled {
        raffle: RaffleId,
        reason: String,
        at: WallClock,
        event_id: Option<EventId>,
    },
    CursorAdvanced {
        source: String,
        next_seq: u64,
    },
    SettlementOwed {
        record: SettlementRecord,
    },
    SettlementIssued {
        raffle: RaffleId,
        key: SettlementKey,
        at: WallClock,
    },
    SettlementEscalated {
        raffle: RaffleId,
        key: SettlementKey,
        reason: String,
    },
    WinnerObligationRecorded {
        obligation: FulfillmentObligation,
    },
    /// Integrity correction: a confirmed chain event named a different owner
    /// than the local view. The chain wins; ownership is overwritten.
    BoxOwnerCorrected {
        raffle: RaffleId,
        box_number: u32,
        owner: UserId,
        tx_ref: crate::core::TxRef,
        event_id: EventId,
    },
}

impl LedgerOp {
    /// Raffle this operation belongs to, if it is raffle-scoped.
    pub fn raffle(&self) -> Option<&RaffleId> {
        match self {
            LedgerOp::RaffleCreated { raffle } => Some(&raffle.id),
            LedgerOp::BoxesReserved { raffle, .. } => Some(raffle),
            LedgerOp::ReservationReleased { raffle, .. } => Some(raffle),
            LedgerOp::PurchaseCommitted { purchase, .. } => Some(&purchase.raffle),
            LedgerOp::RaffleFilled { raffle, .. } => Some(raffle),
            LedgerOp::RandomnessRequested { request } => Some(&request.raffle),
            LedgerOp::RandomnessFailed { raffle, .. } => Some(raffle),
            LedgerOp::RandomnessFulfilled { raffle, .. } => Some(raffle),
            LedgerOp::RaffleCancelled { raffle, .. } => Some(raffle),
            LedgerOp::CursorAdvanced { .. } => None,
            LedgerOp::SettlementOwed { record } => Some(&record.key.raffle),
            LedgerOp::SettlementIssued { raffle, .. } => Some(raffle),
            LedgerOp::SettlementEscalated { raffle, .. } => Some(raffle),
            LedgerOp::WinnerObligationRecorded { obligation } => Some(&obligation.raffle),
            LedgerOp::BoxOwnerCorrected { raffle, .. } => Some(raffle),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Serialized as `recorded_at` so it cannot collide with the `at` field
    /// some flattened `LedgerOp` variants carry.
    #[serde(rename = "recorded_at")]
    pub at: WallClock,
    #[serde(flatten)]
    pub op: LedgerOp,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("record decode failed at {path:?} line {line}: {source}")]
    Decode {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("record encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Append handle over the journal file.
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Open the journal for appending, creating the directory if needed.
    pub fn open_append(dir: &Path) -> Result<Self, JournalError> {
        fs::create_dir_all(dir).map_err(|source| JournalError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self { file, path })
    }

    /// Append one record and sync it to disk before returning.
    pub fn append(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(record).map_err(JournalError::Encode)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.sync_data())
            .map_err(|source| JournalError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Read every record in append order. Missing file means an empty journal.
pub fn read_all(dir: &Path) -> Result<Vec<JournalRecord>, JournalError> {
    let path = dir.join(JOURNAL_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(JournalError::Io {
                path,
                source,
            });
        }
    };
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| JournalError::Io {
            path: path.clone(),
            source,
        })?;
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| JournalError::Decode {
            path: path.clone(),
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let record = JournalRecord {
            at: WallClock(1_700_000_000_000),
            op: LedgerOp::CursorAdvanced {
                source: "devnet".into(),
                next_seq: 42,
            },
        };
        {
            let mut journal = Journal::open_append(dir.path()).unwrap();
            journal.append(&record).unwrap();
        }
        let records = read_all(dir.path()).unwrap();
        assert_eq!(records, vec![record]);
    }

    #[test]
    fn missing_journal_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_all(dir.path()).unwrap().is_empty());
    }
}
