//! `serve` command
//!
//! Wires the configuration, robot transport, bus, coordinator and operator
//! console together and runs until the shutdown token fires.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, MemoryBus};
use crate::cli::args::ServeArgs;
use crate::config::ConfigLoader;
use crate::console;
use crate::coordinator::Coordinator;
use crate::error::RsbbError;
use crate::transport::{ChannelFactory, UdpChannelFactory, udp};

/// Run the referee box.
///
/// # Errors
///
/// Returns a config error if the settings cannot be loaded, a transport
/// error if the beacon port is taken, or an I/O error if the console or
/// metrics endpoint cannot bind.
pub async fn run(args: &ServeArgs, cancel: CancellationToken) -> Result<(), RsbbError> {
    if let Some(port) = args.metrics_port {
        crate::observability::init_metrics(Some(port))?;
        tracing::info!(port, "Prometheus metrics endpoint started");
    }

    tracing::info!(config = %args.config.display(), "loading configuration");
    let load_result = ConfigLoader::with_defaults().load(&args.config)?;
    for warning in &load_result.warnings {
        tracing::warn!(
            location = warning.location.as_deref().unwrap_or("<unknown>"),
            "{}",
            warning.message
        );
    }
    let config = load_result.config;
    let settings = config.settings.clone();

    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let factory: Arc<dyn ChannelFactory> = Arc::new(UdpChannelFactory::new(settings.rsbb_host.clone()));
    let coordinator = Arc::new(Coordinator::new(config, bus, factory, cancel.clone()));

    let devices = coordinator.track_devices();

    let beacons = {
        let coordinator = Arc::clone(&coordinator);
        udp::spawn_beacon_listener(
            settings.rsbb_port,
            move |beacon| coordinator.record_beacon(&beacon),
            cancel.clone(),
        )
        .await?
    };

    let bind = args.bind.as_deref().unwrap_or(&settings.console_bind);
    let (bound, console) = console::serve(bind, Arc::clone(&coordinator), cancel.clone()).await?;
    tracing::info!(%bound, beacon_port = settings.rsbb_port, "referee box running");

    cancel.cancelled().await;
    tracing::info!("shutting down");

    coordinator.shutdown().await;
    for (name, task) in [("console", console), ("beacons", beacons), ("devices", devices)] {
        if let Err(error) = task.await {
            tracing::warn!(task = name, %error, "background task failed");
        }
    }
    Ok(())
}
