//! Run with: cargo run --bin stress_test
//! Points at a disposable database; `stress::setup_test_database` drops and
//! recreates every table it touches.

use amm_engine::config::Config;
use amm_engine::db;
use amm_engine::stress;
use anyhow::Result;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info,amm_engine=debug").init();

    info!("amm engine stress test starting");

    let config = Config::from_env();
    config.print_config();

    let pool = db::create_pool(&config.db.database_url, config.db.max_connections).await?;

    info!("setting up disposable schema");
    stress::setup_test_database(&pool).await?;

    info!("running stress test");
    stress::run_stress_test(&pool, &config).await?;

    info!("stress test completed");
    Ok(())
}
