use anyhow::{Context, Result};
use clap::Parser;
use regscan::config::{Args, DaemonConfig, Mode, OnDemandConfig};
use regscan::constants::{ON_DEMAND_DB_ATTEMPTS, STARTUP_DELAY_SECS};
use regscan::controller::{Coordinator, CoordinatorConfig, HttpControllerClient, Listener};
use regscan::cvedb::DatabaseLoader;
use regscan::error::ScanError;
use regscan::host::{resolve_bind_address, HostProbe};
use regscan::logging::init_logging;
use regscan::scan::{dispatch, severity_counts, ScanRequest, ScannerContext};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const EXIT_FAILURE: i32 = 1;
const EXIT_INVALID_INPUT: i32 = 2;
const EXIT_UNSUPPORTED_HOST: i32 = 3;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(args.json_logs, args.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Exiting");
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ScanError>() {
        Some(ScanError::Input(_)) => EXIT_INVALID_INPUT,
        Some(ScanError::Environment(_)) => EXIT_UNSUPPORTED_HOST,
        _ => EXIT_FAILURE,
    }
}

async fn run(args: Args) -> Result<()> {
    let mode = args.mode()?;
    let loader = Arc::new(DatabaseLoader::default());

    match mode {
        Mode::DbVersion => {
            let snapshot = loader
                .reload(&args.db_dir)
                .context("Failed to read the CVE database")?;
            println!("CVE database version: {}", snapshot.version);
            Ok(())
        }
        Mode::Export(output) => {
            loader
                .load(&args.db_dir, ON_DEMAND_DB_ATTEMPTS, Some(&output))
                .await
                .context("No CVE database available to export")?;
            Ok(())
        }
        Mode::OnDemand(cfg) => {
            HostProbe::default().scanner_id(args.adv.as_deref().unwrap_or_default())?;
            run_on_demand(loader, &args.db_dir, cfg).await
        }
        Mode::Daemon(cfg) => run_daemon(loader, args.db_dir, cfg).await,
    }
}

async fn run_on_demand(
    loader: Arc<DatabaseLoader>,
    db_dir: &Path,
    cfg: OnDemandConfig,
) -> Result<()> {
    loader
        .load(db_dir, ON_DEMAND_DB_ATTEMPTS, None)
        .await
        .context("No CVE database available")?;

    let ctx = ScannerContext::new(loader);
    let request = ScanRequest::Image(cfg.request);
    let result = dispatch(&ctx, &request, None).await?;

    if !result.is_success() {
        anyhow::bail!("Scan failed: {} ({})", result.error, result.error_message);
    }

    println!("Image: {}/{}:{}", result.registry, result.repository, result.tag);
    if let Some(ref image) = result.image {
        println!("Digest: {}", image.digest);
        println!("Layers: {}", image.layers.len());
    }
    println!("CVE database version: {}", result.db_version);
    println!("Vulnerabilities: {}", result.vulnerabilities.len());
    let mut counts: Vec<_> = severity_counts(&result).into_iter().collect();
    counts.sort();
    for (severity, count) in counts {
        println!("  {}: {}", severity, count);
    }

    if let Some(submit) = cfg.submit {
        let client = HttpControllerClient::new(&submit.join, submit.port)?
            .with_credentials(&submit.username, &submit.password);
        match client.submit_result(&result).await {
            Ok(()) => tracing::info!("Scan result submitted"),
            Err(e) => tracing::error!(error = %e, "Failed to submit scan result"),
        }
    }

    Ok(())
}

async fn run_daemon(
    loader: Arc<DatabaseLoader>,
    db_dir: std::path::PathBuf,
    cfg: DaemonConfig,
) -> Result<()> {
    let probe = HostProbe::default();
    let container_id = if probe.is_running_in_container() {
        Some(probe.scanner_id("")?)
    } else {
        tracing::debug!("Not running in container");
        None
    };

    let advertise_address = if cfg.advertise_address.is_empty() {
        resolve_bind_address(&cfg.join, cfg.join_port).await?
    } else {
        cfg.advertise_address.clone()
    };
    let scanner_id = container_id.unwrap_or_else(|| advertise_address.clone());

    let ctx = Arc::new(ScannerContext::new(loader.clone()));
    let (notice_tx, notice_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = Listener::new(ctx, notice_tx, &scanner_id);
    let listener_shutdown = shutdown_rx.clone();
    let advertise_port = cfg.advertise_port;
    let listener_task = tokio::spawn(async move {
        if let Err(e) = listener.start(advertise_port, listener_shutdown).await {
            tracing::error!(error = %e, "Scanner listener stopped");
        }
    });

    if cfg.startup_delay {
        // give the advertised address time to reach the rest of the cluster
        tracing::info!(delay_secs = STARTUP_DELAY_SECS, "Waiting before joining");
        tokio::time::sleep(Duration::from_secs(STARTUP_DELAY_SECS)).await;
    }

    let controller = Arc::new(HttpControllerClient::new(&cfg.join, cfg.join_port)?);
    let coordinator = Coordinator::new(
        CoordinatorConfig::new(&scanner_id, &advertise_address, cfg.advertise_port, db_dir),
        loader,
        controller,
        notice_rx,
    );
    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx));

    wait_for_signal().await?;
    tracing::info!("Exiting ...");
    shutdown_tx.send_replace(true);

    coordinator_task.await.context("Registration task failed")?;
    listener_task.await.context("Listener task failed")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for SIGINT")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
