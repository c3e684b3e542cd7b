//! Flash-sale simulation: a crowd of buyers racing for a few units.
//!
//! Run with:
//! ```
//! RUST_LOG=seckill_core=info cargo run --example flash_sale --features memory
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use seckill_core::prelude::*;
use seckill_core::{AdmissionRule, KeyScope, Quota};

const BUYERS: u64 = 2_000;
const STOCK: u64 = 25;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SeckillConfig::default()
        .with_lock_wait(Duration::from_secs(2))
        .with_admission(vec![
            AdmissionRule::sliding_window("user", KeyScope::ActivityUser, Quota::per_minute(3)),
            AdmissionRule::token_bucket("activity", KeyScope::Activity, Quota::bucket(500.0, 1_500)),
        ]);
    let seckill = Arc::new(Seckill::new(MemoryStorage::new(), config)?);

    let now = current_timestamp_ms();
    seckill
        .create_activity(&Activity::new(1, 9001, STOCK, now, now + 60_000).with_name("midnight sale"))
        .await?;

    println!("=== Flash Sale Demo ===\n");
    println!("{BUYERS} buyers, {STOCK} units, two attempts each\n");

    let started = Instant::now();
    let mut handles = Vec::new();
    for attempt in 0..2 * BUYERS {
        let seckill = Arc::clone(&seckill);
        handles.push(tokio::spawn(async move {
            seckill.attempt_purchase(1, attempt % BUYERS).await
        }));
    }

    let mut tally: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut orders = Vec::new();
    for handle in handles {
        match handle.await?? {
            PurchaseOutcome::Admitted(reservation) => {
                *tally.entry("admitted").or_default() += 1;
                orders.push(reservation);
            }
            PurchaseOutcome::Rejected(reason) => {
                *tally.entry(reason.code()).or_default() += 1;
            }
        }
    }

    println!("Finished in {:?}\n", started.elapsed());
    for (outcome, count) in &tally {
        println!("{outcome:22} {count}");
    }

    orders.sort_by_key(|r| std::cmp::Reverse(r.remaining));
    println!("\nFirst orders:");
    for reservation in orders.iter().take(5) {
        println!(
            "  {} -> user {} ({} left)",
            reservation.order_no, reservation.user_id, reservation.remaining
        );
    }

    println!("\nRemaining stock: {}", seckill.remaining_stock(1).await?);
    Ok(())
}
