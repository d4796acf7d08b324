use crate::capture::Capture;
use crate::cli::{Commands, ProbeArgs};
use crate::config::ProbeConfig;
use crate::hook::HookDispatcher;
use crate::metrics::{PrometheusExporter, ProbeMetrics};
use crate::session::Session;
use crate::transport::unix::UnixTransport;
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { probe } => handle_run(probe).await,
        Commands::Config { probe } => handle_config(probe),
    }
}

fn load_config(probe: &ProbeArgs) -> Result<ProbeConfig> {
    ProbeConfig::resolve(probe.config.as_deref(), probe.overrides())
        .context("Failed to load configuration")
}

fn handle_config(probe: ProbeArgs) -> Result<()> {
    let config = load_config(&probe)?;
    let filter = config.filter();

    print!("{}", config.to_yaml()?);
    println!("# effective filters");
    for (name, addr) in [("from", filter.src()), ("to", filter.dst())] {
        match addr {
            Some(addr) => println!("#   {}: {} ({:#010x})", name, Ipv4Addr::from(addr), addr),
            None => println!("#   {}: any", name),
        }
    }
    Ok(())
}

async fn handle_run(probe: ProbeArgs) -> Result<()> {
    let config = load_config(&probe)?;
    let filter = config.filter();
    info!(
        "Configuration: from={} to={} buf={} socket={} workers={}",
        describe(filter.src()),
        describe(filter.dst()),
        config.buf,
        config.socket.display(),
        config.workers
    );

    let metrics = ProbeMetrics::new()?;
    let transport = UnixTransport::bind(&config.socket).context("Failed to open transport")?;
    let mut receiver = transport.receiver()?;
    let session = Arc::new(
        Session::new(transport, config.buf, metrics.clone())
            .context("Failed to allocate batch buffer")?,
    );

    let hooks = HookDispatcher::new(filter, Arc::clone(&session), metrics.clone());
    let capture = Capture::start(hooks, config.interface.as_deref(), config.workers)
        .context("Failed to start packet capture")?;

    let exporter = PrometheusExporter::new(metrics.clone());
    let mut ticker = tokio::time::interval(Duration::from_secs(config.metrics_interval_secs));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("ncp running. Press Ctrl+C to exit.");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            inbound = receiver.recv() => match inbound {
                Ok(Some(msg)) => {
                    session.receive(&msg);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to receive from consumer socket: {}", e),
            },
            _ = ticker.tick(), if config.metrics_file.is_some() => {
                if let Some(path) = &config.metrics_file {
                    if let Err(e) = exporter.write_textfile(path).await {
                        warn!("Failed to write metrics to {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    capture.stop();
    session.shutdown();

    if let Some(path) = &config.metrics_file {
        if let Err(e) = exporter.write_textfile(path).await {
            warn!("Failed to write metrics to {}: {}", path.display(), e);
        }
    }
    info!("Final metrics: {}", metrics.snapshot());
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

fn describe(addr: Option<u32>) -> String {
    addr.map_or_else(|| "any".to_string(), |a| Ipv4Addr::from(a).to_string())
}
