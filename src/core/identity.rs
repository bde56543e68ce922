//! Layer 1: Identity atoms
//!
//! RaffleId: raffle identifier with prefix
//! UserId: buyer/seller/operator self-identification
//! TxRef: on-chain transaction reference

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

/// Alphabet for raffle ID suffixes.
const RAFFLE_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Raffle identifier - "rf-{suffix}" format.
///
/// Suffix is lowercase alphanumeric.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RaffleId(String);

impl RaffleId {
    /// Parse and validate a raffle ID string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let rest = match s.strip_prefix("rf-") {
            Some(rest) => rest,
            None => {
                return Err(InvalidId::Raffle {
                    raw: s.to_string(),
                    reason: "must start with 'rf-'".into(),
                }
                .into());
            }
        };
        if rest.is_empty() {
            return Err(InvalidId::Raffle {
                raw: s.to_string(),
                reason: "missing suffix".into(),
            }
            .into());
        }
        let suffix = rest.to_lowercase();
        for c in suffix.bytes() {
            if !RAFFLE_ALPHABET.contains(&c) {
                return Err(InvalidId::Raffle {
                    raw: s.to_string(),
                    reason: "contains non-alphanumeric character".into(),
                }
                .into());
            }
        }
        Ok(Self(format!("rf-{suffix}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RaffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RaffleId({:?})", self.0)
    }
}

impl fmt::Display for RaffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier - non-empty string.
///
/// Callers name themselves. No validation beyond non-empty.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidId::User {
                raw: s,
                reason: "empty".into(),
            }
            .into())
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({:?})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-chain transaction reference - non-empty, chain-format agnostic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(String);

impl TxRef {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidId::TxRef {
                raw: s,
                reason: "empty".into(),
            }
            .into())
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxRef({:?})", self.0)
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reservation identifier - opaque UUID minted by the allocation engine.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReservationId({})", self.0)
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Randomness request identifier - the correlation id sent to the oracle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RandomnessRequestId(Uuid);

impl RandomnessRequestId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for RandomnessRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RandomnessRequestId({})", self.0)
    }
}

impl fmt::Display for RandomnessRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-chain identity of an event: transaction reference + log index.
///
/// The natural idempotency key for reconciliation - redelivery of the same
/// on-chain fact carries the same `EventId`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub tx_ref: TxRef,
    pub log_index: u32,
}

impl EventId {
    pub fn new(tx_ref: TxRef, log_index: u32) -> Self {
        Self { tx_ref, log_index }
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({}#{})", self.tx_ref, self.log_index)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_ref, self.log_index)
    }
}
