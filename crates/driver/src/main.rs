//! usb-timer-driver
//!
//! Loads the driver, plugs the configured devices into a simulated bus and
//! lets the per-device trigger and deferred handler run until shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use common::{SessionId, setup_logging};
use driver::config::DriverConfig;
use driver::{Driver, SimulatedBus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-timer-driver")]
#[command(
    author,
    version,
    about = "USB timer driver - periodic trigger with deferred buffer handler"
)]
#[command(long_about = "
Runs the timer driver against a simulated USB bus. Every attached device
gets a periodic trigger that schedules a deferred handler; the handler
clears the device buffer and re-arms the trigger. Unplugging a device
tears its state down only after any running handler has finished.

EXAMPLES:
    # Run with default config until Ctrl+C
    usb-timer-driver

    # Run for ten seconds with debug logging
    usb-timer-driver --duration 10 --log-level debug

    # Run with custom config
    usb-timer-driver --config /path/to/driver.toml

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-timer-driver/driver.toml
    3. /etc/usb-timer-driver/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Seconds to run before unloading (overrides simulation.run_secs)
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        driver::config::load_config(path).context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-timer-driver v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let settings = config.driver_settings()?;
    let driver = Arc::new(
        Driver::builder(settings)
            .pool(config.memory_pool())
            .build(),
    );
    driver.start().context("Failed to load driver")?;

    let bus = Arc::new(Mutex::new(SimulatedBus::new(Arc::clone(&driver))));
    let identities = config.simulation.identities()?;

    let plug_bus = Arc::clone(&bus);
    let plugged: Vec<SessionId> = tokio::task::spawn_blocking(move || {
        let mut bus = plug_bus.lock();
        identities
            .into_iter()
            .filter_map(|identity| match bus.plug(identity) {
                (id, Ok(())) => Some(id),
                (_, Err(_)) => None,
            })
            .collect()
    })
    .await
    .context("Plug task failed")?;
    info!("{} device(s) attached", plugged.len());

    let unplug_task = config.simulation.unplug_after_ms.map(|ms| {
        let bus = Arc::clone(&bus);
        let ids = plugged.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let result = tokio::task::spawn_blocking(move || {
                let mut bus = bus.lock();
                for id in ids {
                    log_stats(&bus, id);
                    if let Some(Err(e)) = bus.unplug(id) {
                        warn!("Unplug of {} failed: {}", id, e);
                    }
                }
            })
            .await;
            if let Err(e) = result {
                error!("Unplug task failed: {}", e);
            }
        })
    });

    let run_secs = args.duration.unwrap_or(config.simulation.run_secs);
    wait_for_shutdown(run_secs).await;

    if let Some(task) = unplug_task {
        task.abort();
    }

    let unload_bus = Arc::clone(&bus);
    let unload_driver = Arc::clone(&driver);
    let detached = tokio::task::spawn_blocking(move || {
        let mut bus = unload_bus.lock();
        let ids: Vec<SessionId> = bus.sessions().map(|s| s.id()).collect();
        for id in ids {
            log_stats(&bus, id);
        }
        let unplugged = bus.unplug_all();
        unplugged + unload_driver.stop()
    })
    .await
    .context("Unload task failed")?;

    info!("Driver unloaded ({} device(s) released)", detached);
    Ok(())
}

async fn wait_for_shutdown(run_secs: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        }
    };

    if run_secs == 0 {
        info!("Press Ctrl+C to shutdown");
        ctrl_c.await;
        return;
    }

    tokio::select! {
        _ = ctrl_c => {}
        _ = tokio::time::sleep(Duration::from_secs(run_secs)) => {
            info!("Run time of {}s elapsed", run_secs);
        }
    }
}

fn log_stats(bus: &SimulatedBus, id: SessionId) {
    let Some(session) = bus.session(id) else {
        return;
    };
    if let Some(stats) = session.with_record(|r| r.stats()) {
        info!(
            "{}: {} firings, {} executions, {} coalesced, {} buffer clears",
            id, stats.fired, stats.completed, stats.coalesced, stats.buffer_clears
        );
    }
}
