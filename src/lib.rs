#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod randomness;
pub mod reconciler;
pub mod settlement;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    BoxStatus, ChainEvent, CreditGrant, EventId, FulfillmentObligation, Purchase, Raffle,
    RaffleId, RafflePolicy, RaffleSpec, RaffleStatus, RandomValue, RandomnessRequest,
    RandomnessRequestId, RandomnessStatus, ReservationId, SettleKind, SettlementKey,
    SettlementPhase, SettlementRecord, SourcedEvent, TxRef, UserId, WallClock, Winner,
};
