mod core;
mod utils;
mod workers;

use crate::core::connection::webrtc::WebRtcTransport;
use crate::core::orchestrator::{Exit, Orchestrator, OrchestratorConfig};
use crate::core::session_store::SessionStore;
use crate::core::signaling::{self, SignalingChannel, SignalingConfig};
use crate::utils::file_log::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use anyhow::{bail, Context};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{EnvFilter, Layer};
use workers::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();
    let data_dir = utils::data_dir::resolve(args.conf.as_deref())?;

    // webrtc_ice reports late STUN responses as warnings; they are harmless.
    let filter = match args.verbose {
        0 => "warn,blazeit=info,webrtc_ice=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    let file_layer = FileLogLayer::new(&utils::data_dir::log_file(&data_dir))
        .context("opening log file")?;

    // stdout belongs to the console; diagnostics go to stderr at warn and above.
    // System notices are already printed by the console.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(
            Targets::new()
                .with_default(LevelFilter::WARN)
                .with_target("blazeit::core::message_log", LevelFilter::OFF),
        );

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(stderr_layer)
        .with(file_layer)
        .init();

    let mut store = SessionStore::load(&data_dir);
    let username = args.username.clone().or_else(|| store.username().map(str::to_string));
    let room = args.room.clone().or_else(|| store.room().map(str::to_string));
    let (Some(username), Some(room)) = (username, room) else {
        bail!("A username and a room are required: pass --username <name> --room <room>");
    };
    if let Err(e) = store.save(&username, &room) {
        warn!(event = "session_store_save_failure", error = %e, "Could not remember the session");
    }

    let downloads = args
        .downloads
        .clone()
        .unwrap_or_else(|| utils::data_dir::downloads(&data_dir));

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    let signaling_config = SignalingConfig::new(args.server_url(), &username, !args.no_reconnect)?;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let signaling_task = signaling::channel::spawn(signaling_config, outbound_rx, signal_tx, sos.clone());

    let transport = Arc::new(WebRtcTransport::new(args.ice_servers())?);
    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (orchestrator, loopback) = Orchestrator::new(
        OrchestratorConfig {
            username: username.clone(),
            room: room.clone(),
            downloads: Some(downloads),
        },
        transport,
        SignalingChannel::new(outbound_tx),
        app_tx,
    );

    info!(event = "startup", user = %username, room = %room, data_dir = %data_dir.display(), "blazeit starting");

    let console_task = tokio::spawn(workers::console::run(command_tx, app_rx, sos.clone()));
    let exit = orchestrator.run(loopback, signal_rx, command_rx, sos.clone()).await;

    if exit == Exit::Disconnected {
        store.clear().context("forgetting the remembered session")?;
        println!("Disconnected. Login forgotten.");
    }

    sos.cancel();
    let _ = signaling_task.await;
    console_task.abort();
    Ok(())
}
