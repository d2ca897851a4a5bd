//! membersys CLI entry point
//!
//! Operator commands against the configured membership store.

mod cli;

use std::process;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
