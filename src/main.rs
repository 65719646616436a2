//! facecam: USB webcam streamer and face capture for the Raspberry Pi
//!
//! Opens a USB webcam (retrying while the device settles), serves an MJPEG
//! stream, stores cropped faces in SQLite and forwards them to Supabase.

mod camera;
mod capture;
mod cli;
mod config;
mod devices;
mod diagnose;
mod error;
mod faces;
mod grabber;
mod logging;
mod overlay;
mod server;
mod state;
mod storage;
mod sync;

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use camera::StopSignal;
use capture::CommandOpener;
use cli::{Cli, Command, ConfigCommand, RunCommand, SyncCommand};
use config::Config;
use faces::{FaceDetector, FaceWorker, SeetaDetector};
use grabber::{Grabber, GrabberSettings};
use state::AppState;
use storage::Storage;
use sync::SupabaseClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbosity());

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Run(cmd) => run(config, cmd).await,
        Command::Sync(cmd) => sync_once(&config, &cmd).await,
        Command::Diagnose => {
            tokio::task::spawn_blocking(move || diagnose::run(&config, &CommandOpener)).await?;
            Ok(())
        }
        Command::Config(cmd) => show_config(&config, &cmd),
    }
}

fn open_storage(config: &Config) -> Result<Arc<Mutex<Storage>>> {
    let path = config.database_path();
    let storage = Storage::open(&path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    info!("Database: {}", storage.path().display());
    Ok(Arc::new(Mutex::new(storage)))
}

async fn run(config: Config, cmd: RunCommand) -> Result<()> {
    info!("facecam {} starting", env!("CARGO_PKG_VERSION"));

    let storage = open_storage(&config)?;
    let state = Arc::new(AppState::new(Some(storage.clone())));

    let faces = if config.faces.enabled && !cmd.no_faces {
        let model_path = config.model_path();
        let detector_config = config.faces.clone();
        info!("Loading face model from {}", model_path.display());
        Some(FaceWorker::spawn(
            move || {
                let detector = SeetaDetector::load(&model_path, &detector_config)?;
                Ok(Box::new(detector) as Box<dyn FaceDetector>)
            },
            config.faces.clone(),
            storage.clone(),
            state.clone(),
        ))
    } else {
        info!("Face capture disabled");
        None
    };

    let stop = Arc::new(StopSignal::new());
    let grabber = Grabber::new(
        CommandOpener,
        GrabberSettings::from(&config),
        state.clone(),
        faces,
        stop.clone(),
    );
    let mut capture = tokio::task::spawn_blocking(move || grabber.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let client = SupabaseClient::new(&config.sync)
        .context("failed to build sync client")?
        .map(Arc::new);
    let sync_task = match &client {
        Some(client) => Some(tokio::spawn(sync::run_periodic(
            client.clone(),
            storage.clone(),
            config.sync.interval(),
            config.sync.batch_size,
            shutdown_rx.clone(),
        ))),
        None => {
            warn!("Supabase sync disabled: set SUPABASE_URL and SUPABASE_ANON_KEY");
            None
        }
    };

    let server_task = if config.stream.enabled && !cmd.no_stream {
        let addr: SocketAddr = match cmd.bind {
            Some(addr) => addr,
            None => config
                .stream
                .bind
                .parse()
                .with_context(|| format!("invalid stream.bind '{}'", config.stream.bind))?,
        };
        let app = server::router(state.clone(), &config.stream)?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!("Starting web server on http://{}", addr);
        info!("  - Live view: http://<ip>:{}/", addr.port());
        info!("  - MJPEG stream: http://<ip>:{}/video_feed", addr.port());
        info!("  - Single frame: http://<ip>:{}/frame.jpg", addr.port());
        info!("  - Status: http://<ip>:{}/status", addr.port());

        let mut server_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
        }))
    } else {
        info!("HTTP stream disabled");
        None
    };

    let capture_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down");
            None
        }
        joined = &mut capture => Some(joined),
    };

    stop.stop();
    state.begin_shutdown();
    let _ = shutdown_tx.send(true);

    let camera_found = match capture_result {
        Some(joined) => joined.context("capture thread panicked")?,
        None => {
            capture.await.context("capture thread panicked")?;
            true
        }
    };

    if let Some(server) = server_task {
        server.await.context("web server task panicked")??;
    }
    if let Some(task) = sync_task {
        let _ = task.await;
    }
    if let Some(client) = &client {
        info!("Final sync");
        sync::final_flush(client, &storage, config.sync.final_batch_size).await;
    }

    if !camera_found {
        bail!("could not access the webcam; run `facecam diagnose` for details");
    }
    info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn sync_once(config: &Config, cmd: &SyncCommand) -> Result<()> {
    let Some(client) = SupabaseClient::new(&config.sync).context("failed to build sync client")?
    else {
        bail!("sync is not configured: set SUPABASE_URL and SUPABASE_ANON_KEY (or sync.url and sync.anon_key)");
    };
    let storage = open_storage(config)?;
    let batch = cmd.batch.unwrap_or(config.sync.final_batch_size);

    let report = sync::sync_pending(&client, &storage, batch).await?;
    let pending = sync::with_storage(&storage, |s| s.count()).await?;
    println!("Sent {}/{} capture(s) to {}", report.sent, report.fetched, client.endpoint());
    println!("{pending} capture(s) still pending");
    Ok(())
}

fn show_config(config: &Config, cmd: &ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            println!();
            println!("Database:    {}", config.database_path().display());
            println!("Face model:  {}", config.model_path().display());
            println!(
                "Sync:        {}",
                if config.sync.is_configured() {
                    format!("enabled as '{}'", config.sync.device_id())
                } else {
                    "disabled".to_string()
                }
            );
        }
        ConfigCommand::Path => println!("{}", Config::default_config_path().display()),
    }
    Ok(())
}
