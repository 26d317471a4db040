use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod manager;

use config::Config;
use dbus_interface::AttendanceService;
use manager::SessionManager;
use rollcall_store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env();
    let store = Store::open(&config.db_path, &config.csv_path(), config.min_samples)
        .context("failed to open attendance store")?;
    tracing::info!(
        db = %config.db_path.display(),
        csv = %config.csv_path().display(),
        "store opened"
    );

    let store = Arc::new(Mutex::new(store));
    let manager = Arc::new(SessionManager::new(config, Arc::clone(&store)));
    let service = AttendanceService::new(Arc::clone(&manager), store);

    let _connection = zbus::connection::Builder::session()
        .context("failed to connect to session bus")?
        .name("org.rollcall.Attendance1")?
        .serve_at("/org/rollcall/Attendance1", service)?
        .build()
        .await
        .context("failed to claim bus name org.rollcall.Attendance1")?;

    tracing::info!("rollcalld ready on org.rollcall.Attendance1");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    manager.stop();

    Ok(())
}
