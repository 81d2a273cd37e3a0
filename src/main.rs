use anyhow::Result;
use energy_orchestrator::channel::MemoryChannelStore;
use energy_orchestrator::config::Config;
use energy_orchestrator::devices::ComponentFactory;
use energy_orchestrator::domain::SystemClock;
use energy_orchestrator::manager::EnergyManager;
use energy_orchestrator::telemetry::{init_tracing, shutdown_signal};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryChannelStore::new(clock.clone()));

    let factory = ComponentFactory::new(store.clone(), clock, cfg.manager.clone());
    let components = factory.build_all(&cfg)?;

    let manager = Arc::new(EnergyManager::new(cfg.manager.clone()));
    for component in components {
        manager.bind(component)?;
    }
    info!(cycle_interval_ms = cfg.manager.cycle_interval_ms, "starting energy orchestrator");

    let runner = manager.clone();
    let loop_handle = tokio::spawn(async move { runner.run().await });

    // The in-memory store holds future-dated writes until they fall due
    let release_store = store.clone();
    let release_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let released = release_store.release_due();
            if released > 0 {
                debug!(released, "scheduled writes released");
            }
        }
    });

    shutdown_signal().await;
    manager.shutdown();
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "manager loop ended abnormally");
    }
    release_handle.abort();
    manager.unbind_all();

    warn!("shutdown complete");
    Ok(())
}
