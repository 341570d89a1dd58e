// Measures how quickly one stage wakes the other through the pipeline handoff.
// Run with: cargo run --release --bin handoff_latency [rounds]

use crossbeam_channel::bounded;
use overlapped_pipeline::{HandoffChannel, Role, Turn};
use std::env;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const DEFAULT_ROUNDS: u64 = 10_000;

#[tokio::main]
async fn main() {
    let rounds = env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<u64>().ok())
        .unwrap_or(DEFAULT_ROUNDS);

    println!("=== Handoff Latency Diagnostic ({} rounds) ===\n", rounds);

    let handoff = test_handoff_channel(rounds);
    let crossbeam = test_crossbeam(rounds);
    test_notify_latency().await;
    test_timer_resolution();

    println!("\n=== Summary ===");
    println!("  HandoffChannel round trip: {:?}", handoff);
    println!("  crossbeam bounded(1) round trip: {:?}", crossbeam);
    if handoff > crossbeam * 4 {
        println!("  ⚠️  HandoffChannel is much slower than a bare channel");
    } else {
        println!("  ✓ HandoffChannel overhead is in line with a bare channel");
    }
}

/// Producer and consumer walk the iteration counters in lockstep.
fn test_handoff_channel(rounds: u64) -> Duration {
    println!("Testing HandoffChannel (slack 1):");

    let channel = Arc::new(HandoffChannel::new());
    let consumer = {
        let channel = channel.clone();
        thread::spawn(move || {
            for i in 0..rounds {
                if channel.await_turn(Role::Consumer, i) == Turn::Aborted {
                    return;
                }
                if channel.signal(Role::Consumer, i).is_err() {
                    return;
                }
            }
        })
    };

    let start = Instant::now();
    for i in 0..rounds {
        if channel.await_turn(Role::Producer, i) == Turn::Aborted {
            break;
        }
        if let Err(e) = channel.signal(Role::Producer, i) {
            eprintln!("  signal failed: {}", e);
            break;
        }
    }
    // Wait for the last drain so both sides are measured.
    let _ = channel.await_turn(Role::Producer, rounds);
    let elapsed = start.elapsed();
    let _ = consumer.join();

    let mean = per_round(elapsed, rounds);
    println!("  Total: {:?}, per round: {:?}", elapsed, mean);
    println!("  Counters: {:?}", channel.counters());
    mean
}

fn test_crossbeam(rounds: u64) -> Duration {
    println!("\nTesting crossbeam bounded(1) ping-pong:");

    let (to_consumer, from_producer) = bounded::<u64>(1);
    let (to_producer, from_consumer) = bounded::<u64>(1);

    let consumer = thread::spawn(move || {
        while let Ok(i) = from_producer.recv() {
            if to_producer.send(i).is_err() {
                break;
            }
        }
    });

    let start = Instant::now();
    for i in 0..rounds {
        if to_consumer.send(i).is_err() || from_consumer.recv().is_err() {
            break;
        }
    }
    let elapsed = start.elapsed();
    drop(to_consumer);
    let _ = consumer.join();

    let mean = per_round(elapsed, rounds);
    println!("  Total: {:?}, per round: {:?}", elapsed, mean);
    mean
}

/// Mean time per round; zero rounds report the total.
fn per_round(elapsed: Duration, rounds: u64) -> Duration {
    elapsed.div_f64(rounds.max(1) as f64)
}

async fn test_notify_latency() {
    println!("\nTesting Tokio Notify single wake:");

    let notify = Arc::new(Notify::new());
    let sent_at = Arc::new(parking_lot::Mutex::new(None::<Instant>));

    let handle = {
        let notify = notify.clone();
        let sent_at = sent_at.clone();
        tokio::spawn(async move {
            notify.notified().await;
            let sent = *sent_at.lock();
            sent.map(|sent| sent.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    *sent_at.lock() = Some(Instant::now());
    notify.notify_one();

    match handle.await {
        Ok(Some(latency)) => {
            println!("  Latency: {:?}", latency);
            if latency > Duration::from_millis(1) {
                println!(
                    "  ⚠️  Async wake is slow; the pipeline's blocking threads avoid this path"
                );
            }
        }
        _ => println!("  Waiter did not report a latency"),
    }
}

fn test_timer_resolution() {
    println!("\nTesting System Timer Resolution:");

    let mut measurements = Vec::new();
    for _ in 0..20 {
        let start = Instant::now();
        thread::sleep(Duration::from_micros(100));
        measurements.push(start.elapsed());
    }

    measurements.sort();
    let min = measurements[0];
    let median = measurements[measurements.len() / 2];

    println!("  Minimum sleep: {:?}", min);
    println!("  Median sleep: {:?}", median);

    if min > Duration::from_millis(1) {
        println!(
            "  ⚠️  Timer resolution is coarse; handoff timeouts below this are unreliable"
        );
    } else {
        println!("  ✓ Good timer resolution");
    }
}
