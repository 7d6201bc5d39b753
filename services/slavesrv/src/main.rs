//! Modbus TCP Slave Simulator Service (slavesrv)
//!
//! Serves one or more simulated Modbus slaves over MBAP/TCP.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use slavesrv::{
    bootstrap::Args,
    config::SlavesrvConfig,
    logging,
    server::{self, SlaveServer},
    shutdown::wait_for_shutdown,
    Context, Result, SERVICE_NAME, SERVICE_VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = SlavesrvConfig::load(&args.config)?;
    args.apply_overrides(&mut config);

    logging::init_logging(&config.logging).context("Failed to initialize logging")?;
    info!("Starting {} v{}", SERVICE_NAME, SERVICE_VERSION);
    info!("Configuration loaded from {}", args.config.display());

    config.validate()?;

    // Validation mode: validate and exit
    if args.validate {
        let effective =
            serde_yaml::to_string(&config).context("Failed to render effective configuration")?;
        info!("Effective configuration:\n{}", effective);
        for slave in &config.slaves {
            info!(
                "Slave {}: coils={} discrete_inputs={} holding_registers={} input_registers={}",
                slave.unit_id,
                slave.layout.coils,
                slave.layout.discrete_inputs,
                slave.layout.holding_registers,
                slave.layout.input_registers
            );
        }
        info!(
            "Validation completed successfully: {} slave(s), bind {}",
            config.slaves.len(),
            config.service.bind_address
        );
        return Ok(());
    }

    let network = server::build_network(&config)?;
    info!(
        "Slave network ready: units {:?}, function codes {:02X?}",
        network.unit_ids(),
        network.registry().function_codes()
    );

    let cancel = CancellationToken::new();
    let event_loggers = server::spawn_point_event_loggers(&network, cancel.clone());

    let listener = SlaveServer::bind(&config.service).await?;
    let server = Arc::new(SlaveServer::new(&config.service, network, cancel.clone()));

    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let signal = wait_for_shutdown().await;
    info!("Received {}, shutting down", signal);
    cancel.cancel();

    match server_task.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => error!("Server stopped with error: {:#}", e),
        Err(e) => error!("Server task failed: {}", e),
    }
    for handle in event_loggers {
        let _ = handle.await;
    }

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
