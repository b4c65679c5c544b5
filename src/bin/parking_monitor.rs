//! parking_monitor - Parking occupancy monitoring daemon
//!
//! This daemon:
//! 1. Loads configuration (file, environment, flags)
//! 2. Starts the report dispatchers against the backend
//! 3. Serves the control API that starts and stops per-lot workers
//! 4. On Ctrl-C, stops the API, every lot worker, and the dispatchers

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use parking_monitor::{
    api::{ApiConfig, ApiServer, ServiceContext},
    DefaultOpener, HttpSink, MonitorConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Parking occupancy monitoring service")]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "PARKING_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides HOST and PORT).
    #[arg(long)]
    addr: Option<String>,

    /// Backend API base URL (overrides BACKEND_API_URL).
    #[arg(long)]
    backend_url: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = MonitorConfig::load_from(args.config.as_deref())?;
    if let Some(url) = args.backend_url {
        config.backend.api_url = url;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_filter()))
        .init();

    let sink = Arc::new(HttpSink::new(
        &config.backend.api_url,
        config.backend.timeout,
        config.backend.probe_timeout,
    )?);
    let ctx = ServiceContext::new(&config, sink, Arc::new(DefaultOpener))?;

    let mut api_config = ApiConfig::from_config(&config);
    if let Some(addr) = args.addr {
        api_config.addr = addr;
    }
    let api_handle = ApiServer::new(api_config, ctx.clone()).spawn()?;
    log::info!(
        "parking_monitor {} running; reporting to {}",
        env!("CARGO_PKG_VERSION"),
        config.backend.api_url
    );
    log::info!(
        "update interval {}s, {} report dispatchers",
        config.worker.update_interval.as_secs(),
        config.reporter.max_workers
    );
    if let Some(dir) = &config.worker.debug_image_dir {
        log::info!("saving annotated debug images to {}", dir.display());
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    ctx.shutdown();
    log::info!("parking_monitor stopped");

    Ok(())
}
