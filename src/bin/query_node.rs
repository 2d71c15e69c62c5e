//! Query node
//!
//! Runs one party's dispatch core: client listener, interserver listener
//! and session sweeper.
//!
//! Usage:
//!   DQUERY_CONFIG=node.json cargo run --release --bin query_node

use dotenv::dotenv;
use dquery::{server, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    log::info!("🚀 Starting query node");

    let config = Config::from_env()?;

    log::info!("📋 Configuration:");
    log::info!("   ├─ Local party: {}", config.local_party);
    log::info!("   ├─ Client listen: {}", config.front_listen);
    log::info!("   ├─ Interserver listen: {}", config.interserver_listen.address());
    for (party, address) in &config.connections {
        log::info!(
            "   ├─ {}: {} (buffer {} KiB)",
            party,
            address.address(),
            config.output_buffer_limits.get(*party) / 1024
        );
    }
    log::info!(
        "   ├─ Connect retries: {} (backoff {}-{}ms)",
        config.connect_retry_budget,
        config.connect_retry_delay_ms,
        config.connect_retry_max_delay_ms
    );
    log::info!(
        "   ├─ Session lifetime: {}s (sweep every {}s)",
        config.max_session_lifetime_secs,
        config.zombie_check_cooldown_secs
    );
    log::info!(
        "   └─ Progress every {}ms, result scale {}",
        config.result_update_cooldown_ms,
        config.result_scale
    );

    server::run(config).await?;

    log::info!("✅ Query node stopped");
    Ok(())
}
