// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Deadlock detection tests using parking_lot's built-in deadlock detector.
//!
//! Trust lines are shared by every payment a node runs, so reservations,
//! commits and reads from many threads hit the same per-line locks. These
//! tests drive the real [`TrustLines`] and [`PaymentsManager`] from many
//! threads while the detector watches the lock graph.

use parking_lot::deadlock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use trustnet_payments::{
    GraphPathFinder, MemoryStorage, NodeId, PathId, PaymentConfig, PaymentsManager,
    ReservationDirection, TransactionId, TrustLineAmount, TrustLines,
};

fn node(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

fn amount(value: u32) -> TrustLineAmount {
    TrustLineAmount::from(value)
}

/// Owner 1 with lines to nodes 2..=`contractors` + 1, each with `limit` both ways.
fn make_trust_lines(contractors: u128, limit: u32) -> Arc<TrustLines> {
    let lines = TrustLines::new(node(1));
    for contractor in 2..contractors + 2 {
        lines.open(node(contractor), amount(limit), amount(limit));
    }
    Arc::new(lines)
}

// === Deadlock Detector ===

/// Starts a background thread that checks for deadlocks every 100ms.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

/// Stops the deadlock detector.
fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150)); // Let detector thread exit
}

// === Tests ===

/// Many payments reserving and committing on one trust line.
#[test]
fn no_deadlock_high_contention_single_line() {
    let detector = start_deadlock_detector();
    let lines = make_trust_lines(1, 1_000_000);
    let tx_counter = Arc::new(AtomicU64::new(1));

    const NUM_THREADS: usize = 32;
    const OPS_PER_THREAD: usize = 200;

    let mut handles = Vec::with_capacity(NUM_THREADS);
    for _ in 0..NUM_THREADS {
        let lines = lines.clone();
        let tx_counter = tx_counter.clone();
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD {
                let tx = TransactionId::from_u128(tx_counter.fetch_add(1, Ordering::SeqCst) as u128);
                let direction = if i % 2 == 0 {
                    ReservationDirection::Outgoing
                } else {
                    ReservationDirection::Incoming
                };
                let Ok(reservation) = lines.reserve(&node(2), tx, PathId(0), amount(10), direction) else {
                    continue;
                };
                match i % 3 {
                    0 => {
                        let shrunk = lines.update(&reservation, amount(5)).expect("shrink");
                        lines.commit_reservation(&shrunk).expect("commit");
                    }
                    1 => lines.free(&reservation).expect("free"),
                    _ => {
                        let _ = lines.available_outgoing(&node(2));
                        let _ = lines.total_balance();
                        lines.free_transaction(&tx);
                    }
                }
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    let line = lines.get(&node(2)).expect("line exists");
    assert_eq!(line.reservations_count(), 0);
    println!(
        "High contention test passed: {} threads × {} ops",
        NUM_THREADS, OPS_PER_THREAD
    );
}

/// Payments spanning several lines, while other threads iterate over all of them.
#[test]
fn no_deadlock_iteration_during_mutation() {
    let detector = start_deadlock_detector();
    let lines = make_trust_lines(8, 1_000_000);
    let stop = Arc::new(AtomicBool::new(false));
    let tx_counter = Arc::new(AtomicU64::new(1));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let lines = lines.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut rounds = 0u64;
            while !stop.load(Ordering::SeqCst) {
                let _ = lines.total_available_outgoing();
                let _ = lines.total_available_incoming();
                let _ = lines.iter().map(|line| line.reservations_count()).sum::<usize>();
                rounds += 1;
            }
            rounds
        }));
    }

    let mut writers = Vec::new();
    for worker in 0..8u128 {
        let lines = lines.clone();
        let tx_counter = tx_counter.clone();
        writers.push(thread::spawn(move || {
            for i in 0..300u128 {
                let tx = TransactionId::from_u128(tx_counter.fetch_add(1, Ordering::SeqCst) as u128);
                // Each payment holds two lines, in opposite orders on alternate workers.
                let (first, second) = if worker % 2 == 0 {
                    (2 + i % 8, 2 + (i + 1) % 8)
                } else {
                    (2 + (i + 1) % 8, 2 + i % 8)
                };
                let _ = lines.reserve(&node(first), tx, PathId(0), amount(3), ReservationDirection::Incoming);
                let _ = lines.reserve(&node(second), tx, PathId(0), amount(3), ReservationDirection::Outgoing);
                if i % 4 == 0 {
                    lines.open(node(first), amount(1_000_000), amount(1_000_000));
                }
                lines.free_transaction(&tx);
            }
        }));
    }

    for handle in writers {
        handle.join().expect("Thread panicked");
    }
    stop.store(true, Ordering::SeqCst);
    for handle in readers {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    assert_eq!(lines.iter().map(|line| line.reservations_count()).sum::<usize>(), 0);
    assert_eq!(lines.total_available_outgoing(), amount(8_000_000));
}

/// Payments launched and driven from several threads on one manager.
#[test]
fn no_deadlock_concurrent_manager_calls() {
    let detector = start_deadlock_detector();
    let lines = make_trust_lines(1, 1_000);
    let finder = Arc::new(GraphPathFinder::new(5));
    finder.set_capacity(node(1), node(2), amount(1_000));
    let manager = Arc::new(PaymentsManager::new(
        lines,
        Arc::new(MemoryStorage::new()),
        finder.clone(),
        PaymentConfig::new(),
    ));

    const NUM_THREADS: usize = 8;
    const PAYMENTS_PER_THREAD: usize = 50;

    let mut handles = Vec::with_capacity(NUM_THREADS);
    for _ in 0..NUM_THREADS {
        let manager = manager.clone();
        let finder = finder.clone();
        handles.push(thread::spawn(move || {
            let mut ids = Vec::with_capacity(PAYMENTS_PER_THREAD);
            for i in 0..PAYMENTS_PER_THREAD {
                ids.push(manager.launch_payment(node(2), amount(1)).expect("launched"));
                for (id, resource) in finder.drain_resources() {
                    manager.attach_resource(&id, resource);
                }
                let _ = manager.drain_outgoing();
                manager.tick(Duration::from_millis(i as u64));
            }
            ids
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.join().expect("Thread panicked"));
    }

    // Nobody answers, so every payment times out.
    manager.tick(Duration::from_secs(3_600));
    manager.tick(Duration::from_secs(7_200));

    stop_deadlock_detector(detector);

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), NUM_THREADS * PAYMENTS_PER_THREAD);
    assert!(ids.iter().all(|id| !manager.is_transaction_in_process(id)));
    assert!(ids.iter().all(|id| manager.outcome(id).is_some_and(|o| !o.is_ok())));
    assert_eq!(manager.trust_lines().available_outgoing(&node(2)), amount(1_000));
}
