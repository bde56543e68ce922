//! Shared test doubles and a wired-up engine harness.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Receiver};
use tempfile::TempDir;

use boxraffle::config::Config;
use boxraffle::engine::{AllocationEngine, IntendedTx};
use boxraffle::ledger::Ledger;
use boxraffle::randomness::{OracleClient, OracleError, RandomnessCoordinator};
use boxraffle::reconciler::{ChainReconciler, EventSource, SourceError};
use boxraffle::settlement::{GatewayError, PaymentGateway, SettlementDispatcher};
use boxraffle::{
    Purchase, RaffleId, RafflePolicy, RaffleSpec, RandomnessRequestId, SettlementKey,
    SourcedEvent, TxRef, UserId, WallClock,
};

/// Records outbound oracle calls instead of reaching a real oracle.
#[derive(Clone, Default)]
pub struct FakeOracle {
    pub requests: Arc<Mutex<Vec<(RaffleId, RandomnessRequestId)>>>,
    pub unavailable: Arc<AtomicBool>,
}

impl FakeOracle {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<(RaffleId, RandomnessRequestId)> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl OracleClient for FakeOracle {
    fn request_randomness(
        &self,
        raffle: &RaffleId,
        request_id: RandomnessRequestId,
    ) -> Result<(), OracleError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(OracleError::Unavailable("fake oracle down".into()));
        }
        self.requests
            .lock()
            .unwrap()
            .push((raffle.clone(), request_id));
        Ok(())
    }
}

/// Records credit/refund calls; can fail the next N calls transiently or
/// flip into permanent failure.
#[derive(Clone, Default)]
pub struct FakeGateway {
    pub credits: Arc<Mutex<Vec<(UserId, u64, SettlementKey)>>>,
    pub refunds: Arc<Mutex<Vec<(TxRef, SettlementKey)>>>,
    pub transient_failures: Arc<AtomicU32>,
    pub permanent: Arc<AtomicBool>,
}

impl FakeGateway {
    fn gate(&self) -> Result<(), GatewayError> {
        if self.permanent.load(Ordering::Relaxed) {
            return Err(GatewayError::Permanent("fake gateway rejected".into()));
        }
        let remaining = self.transient_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::Relaxed);
            return Err(GatewayError::Transient("fake gateway timeout".into()));
        }
        Ok(())
    }

    pub fn credit_count(&self) -> usize {
        self.credits.lock().unwrap().len()
    }

    pub fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }
}

impl PaymentGateway for FakeGateway {
    fn grant_credit(
        &self,
        user: &UserId,
        amount: u64,
        key: &SettlementKey,
    ) -> Result<(), GatewayError> {
        self.gate()?;
        self.credits
            .lock()
            .unwrap()
            .push((user.clone(), amount, key.clone()));
        Ok(())
    }

    fn refund(&self, tx_ref: &TxRef, key: &SettlementKey) -> Result<(), GatewayError> {
        self.gate()?;
        self.refunds
            .lock()
            .unwrap()
            .push((tx_ref.clone(), key.clone()));
        Ok(())
    }
}

/// In-memory ordered event feed.
#[derive(Clone, Default)]
pub struct VecSource {
    pub events: Arc<Mutex<Vec<SourcedEvent>>>,
    pub unavailable: Arc<AtomicBool>,
}

impl VecSource {
    pub fn push(&self, event: SourcedEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl EventSource for VecSource {
    fn name(&self) -> &str {
        "testnet"
    }

    fn fetch(&self, from_seq: u64, max: usize) -> Result<Vec<SourcedEvent>, SourceError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(SourceError::Unavailable("fake source down".into()));
        }
        let events = self.events.lock().unwrap();
        Ok(events
            .iter()
            .filter(|e| e.seq >= from_seq)
            .take(max)
            .cloned()
            .collect())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub ledger: Arc<Ledger>,
    pub engine: Arc<AllocationEngine>,
    pub coordinator: Arc<RandomnessCoordinator>,
    pub settlement: Arc<SettlementDispatcher>,
    pub oracle: FakeOracle,
    pub gateway: FakeGateway,
    pub chain_rx: Receiver<IntendedTx>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let dir = TempDir::new().expect("temp dir");
        Self::build(dir, config)
    }

    /// Reopen over the same directory, simulating a process restart.
    pub fn reopen(self) -> Self {
        let Harness { dir, config, .. } = self;
        Self::build(dir, config)
    }

    fn build(dir: TempDir, config: Config) -> Self {
        let ledger = Arc::new(Ledger::open(dir.path()).expect("open ledger"));
        let oracle = FakeOracle::default();
        let gateway = FakeGateway::default();
        let settlement = Arc::new(SettlementDispatcher::new(
            Arc::clone(&ledger),
            config.settlement,
            Box::new(gateway.clone()),
        ));
        let coordinator = Arc::new(RandomnessCoordinator::new(
            Arc::clone(&ledger),
            config.randomness,
            Box::new(oracle.clone()),
            Arc::clone(&settlement),
        ));
        let (chain_tx, chain_rx) = unbounded();
        let engine = Arc::new(AllocationEngine::new(
            Arc::clone(&ledger),
            config.engine,
            Arc::clone(&coordinator),
            Arc::clone(&settlement),
            chain_tx,
        ));
        Self {
            dir,
            ledger,
            engine,
            coordinator,
            settlement,
            oracle,
            gateway,
            chain_rx,
            config,
        }
    }

    pub fn reconciler(&self, source: VecSource) -> ChainReconciler {
        ChainReconciler::new(
            Arc::clone(&self.ledger),
            self.config.reconciler,
            Box::new(source),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.settlement),
        )
    }

    pub fn dir_path(&self) -> &Path {
        self.dir.path()
    }

    pub fn create_raffle(&self, total_boxes: u32, box_price: u64, total_winners: u32) -> RaffleId {
        self.engine
            .create_raffle(
                RaffleSpec {
                    item_ref: "test-item".into(),
                    total_boxes,
                    box_price,
                    total_winners,
                    policy: RafflePolicy::default(),
                },
                WallClock(1_000),
            )
            .expect("create raffle")
    }

    /// Reserve and confirm one buyer's boxes in a single step.
    pub fn buy(&self, raffle: &RaffleId, user: &str, boxes: &[u32], now: WallClock) -> Purchase {
        let buyer = UserId::new(user).unwrap();
        let reservation = self
            .engine
            .reserve_boxes(raffle, boxes, &buyer, now)
            .expect("reserve");
        self.engine
            .confirm_purchase(
                reservation.id,
                TxRef::new(format!("tx-{user}-{}", boxes[0])).unwrap(),
                now,
            )
            .expect("confirm")
    }
}

pub fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}
