//! Tandem - Coordination Server
//!
//! Tracks rooms, elects a single master per room and relays playback state
//! and remote actions between participants. Ships with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode

use std::sync::Arc;

use parking_lot::Mutex;
use tandem_coordinator::{dashboard, metrics, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());

    // Shared metrics state
    let metrics = Arc::new(Mutex::new(metrics::Metrics::new()));

    if use_dashboard {
        // Run with TUI dashboard
        dashboard::run(metrics).await
    } else {
        // Run with plain logging
        server::run_with_logging(metrics).await
    }
}
