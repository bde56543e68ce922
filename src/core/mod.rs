//! Domain layer: identity atoms, time primitives, raffle/box/purchase types,
//! and the chain event vocabulary. Pure data + validation, no I/O.

mod error;
mod event;
mod identity;
mod raffle;
mod randomness;
mod settlement;
mod time;

pub use error::{CoreError, InvalidId, InvalidRaffleSpec};
pub use event::{ChainEvent, RandomValue, SourcedEvent};
pub use identity::{EventId, RaffleId, RandomnessRequestId, ReservationId, TxRef, UserId};
pub use raffle::{BoxStatus, Purchase, Raffle, RafflePolicy, RaffleSpec, RaffleStatus, Winner};
pub use randomness::{RandomnessRequest, RandomnessStatus};
pub use settlement::{
    CreditGrant, FulfillmentObligation, SettleKind, SettlementKey, SettlementPhase,
    SettlementRecord,
};
pub use time::WallClock;
