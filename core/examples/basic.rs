//! Basic circuit breaker manager usage example
//!
//! Run with `RUST_LOG=service_breaker=debug` to see the breaker's own logs.

use service_breaker::{CircuitBreakerManager, Config};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Circuit Breaker Manager Example ===\n");

    let payments = Config::builder()
        .failure_rate_threshold(50.0)
        .minimum_number_of_calls(4)
        .count_window(4)
        .wait_duration_in_open_state(Duration::from_millis(500))
        .permitted_number_of_calls_in_half_open_state(2)
        .call_timeout(Duration::from_millis(100))
        .build()
        .expect("valid config");

    let manager = CircuitBreakerManager::builder()
        .service_config("payment_api", payments)
        .on_state_transition(|t| println!("  transition: {}", t))
        .build();

    // Simulate a mix that crosses the failure threshold
    println!("--- Mixed calls ---");
    for i in 1..=4 {
        let result = manager
            .execute_guarded("payment_api", || async move {
                if i % 2 == 0 {
                    Ok::<_, String>(format!("Payment {}", i))
                } else {
                    Err(format!("Payment failed {}", i))
                }
            })
            .await;
        match result {
            Ok(value) => println!("✓ {}", value),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {}\n", manager.state("payment_api"));

    // Rejected without running
    println!("--- Attempting call while open ---");
    match manager
        .execute_guarded("payment_api", || async { Ok::<_, String>("Should be rejected") })
        .await
    {
        Ok(_) => println!("✓ Success"),
        Err(e) => println!("✗ {}", e),
    }
    println!();

    // Another service is unaffected
    println!("--- Independent service ---");
    let search = manager.call_guarded("search_api", || Ok::<_, String>("3 results"));
    println!("search_api: {:?}, state {}\n", search, manager.state("search_api"));

    // Wait out the open period and probe
    println!("--- Probing after wait ---");
    tokio::time::sleep(Duration::from_millis(600)).await;
    for i in 1..=2 {
        let result = manager
            .execute_guarded("payment_api", || async move {
                Ok::<_, String>(format!("Trial payment {}", i))
            })
            .await;
        match result {
            Ok(value) => println!("✓ {}", value),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {}\n", manager.state("payment_api"));

    println!("--- Metrics ---");
    for metrics in manager.all_metrics() {
        println!(
            "{}: {} calls, {:.1}% failed, {} rejected, state {}",
            metrics.circuit,
            metrics.total_calls,
            metrics.failure_rate,
            metrics.not_permitted_calls,
            metrics.state
        );
    }
}
