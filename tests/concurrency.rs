//! Concurrent allocation properties.

mod fixtures;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use boxraffle::engine::AllocationError;
use boxraffle::{RaffleStatus, WallClock};

use fixtures::{user, Harness};

#[test]
fn contended_box_has_exactly_one_winner() {
    let h = Harness::new();
    let raffle = h.create_raffle(10, 5, 1);
    let now = WallClock(2_000);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let successes = Arc::new(AtomicUsize::new(0));
    let unavailable = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let engine = Arc::clone(&h.engine);
            let raffle = raffle.clone();
            let barrier = Arc::clone(&barrier);
            let successes = Arc::clone(&successes);
            let unavailable = Arc::clone(&unavailable);
            thread::spawn(move || {
                let buyer = user(&format!("buyer-{i}"));
                barrier.wait();
                match engine.reserve_boxes(&raffle, &[7], &buyer, now) {
                    Ok(_) => {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(AllocationError::BoxUnavailable { box_number: 7 }) => {
                        unavailable.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(successes.load(Ordering::Relaxed), 1);
    assert_eq!(unavailable.load(Ordering::Relaxed), threads - 1);
}

#[test]
fn two_racing_reservations_for_box_seven() {
    // The spec's pairwise shape: no ordering guarantee, one reservation id,
    // one BoxUnavailable.
    for _ in 0..20 {
        let h = Harness::new();
        let raffle = h.create_raffle(10, 5, 1);
        let now = WallClock(2_000);
        let barrier = Arc::new(Barrier::new(2));

        let results: Vec<_> = ["alice", "bob"]
            .map(|name| {
                let engine = Arc::clone(&h.engine);
                let raffle = raffle.clone();
                let barrier = Arc::clone(&barrier);
                let name = name.to_string();
                thread::spawn(move || {
                    barrier.wait();
                    engine.reserve_boxes(&raffle, &[7], &user(&name), now)
                })
            })
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let losses = results
            .iter()
            .filter(|r| matches!(r, Err(AllocationError::BoxUnavailable { box_number: 7 })))
            .count();
        assert_eq!((wins, losses), (1, 1));
    }
}

#[test]
fn concurrent_buyers_never_oversell() {
    let h = Harness::new();
    let total_boxes = 20u32;
    let raffle = h.create_raffle(total_boxes, 5, 1);
    let now = WallClock(2_000);

    // 40 buyers race over 20 boxes, two contenders per box.
    let barrier = Arc::new(Barrier::new(40));
    let handles: Vec<_> = (0..40u32)
        .map(|i| {
            let engine = Arc::clone(&h.engine);
            let raffle = raffle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let buyer = user(&format!("buyer-{i}"));
                let target = (i % total_boxes) + 1;
                barrier.wait();
                if let Ok(reservation) = engine.reserve_boxes(&raffle, &[target], &buyer, now) {
                    engine
                        .confirm_purchase(
                            reservation.id,
                            boxraffle::TxRef::new(format!("tx-{i}")).unwrap(),
                            now,
                        )
                        .expect("confirm own reservation");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let header = h.ledger.raffle(&raffle).unwrap();
    assert_eq!(header.boxes_sold, total_boxes);
    assert_eq!(header.status, RaffleStatus::Full);

    // Every box has exactly one owner and the count matches boxes_sold.
    let entry = h.ledger.entry(&raffle).unwrap();
    let state = entry.lock().unwrap();
    let sold = state.sold_boxes();
    assert_eq!(sold.len() as u32, header.boxes_sold);

    // Exactly one fill, exactly one randomness request.
    assert_eq!(h.oracle.request_count(), 1);
}

#[test]
fn successful_reservation_is_immediately_invisible_to_readers() {
    let h = Harness::new();
    let raffle = h.create_raffle(5, 5, 1);
    let now = WallClock(2_000);

    h.engine
        .reserve_boxes(&raffle, &[4], &user("alice"), now)
        .unwrap();
    // A reader after the writer returned success must not see box 4.
    assert!(!h.engine.availability(&raffle).unwrap().contains(&4));
}

#[test]
fn cross_raffle_operations_do_not_interfere() {
    let h = Harness::new();
    let a = h.create_raffle(4, 5, 1);
    let b = h.create_raffle(4, 7, 1);
    let now = WallClock(2_000);

    let handles: Vec<_> = [(a.clone(), "ann"), (b.clone(), "ben")]
        .map(|(raffle, name)| {
            let h_engine = Arc::clone(&h.engine);
            let name = name.to_string();
            thread::spawn(move || {
                for n in 1..=4u32 {
                    let buyer = user(&format!("{name}-{n}"));
                    let reservation = h_engine.reserve_boxes(&raffle, &[n], &buyer, now).unwrap();
                    h_engine
                        .confirm_purchase(
                            reservation.id,
                            boxraffle::TxRef::new(format!("tx-{name}-{n}")).unwrap(),
                            now,
                        )
                        .unwrap();
                }
            })
        })
        .into_iter()
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(h.ledger.raffle(&a).unwrap().status, RaffleStatus::Full);
    assert_eq!(h.ledger.raffle(&b).unwrap().status, RaffleStatus::Full);
    assert_eq!(h.oracle.request_count(), 2);
}
