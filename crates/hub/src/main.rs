mod config;
mod light;
mod orchestrator;
mod sim;
mod state;
mod store;
mod web;

use anyhow::Result;
use std::{env, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use growbox_control::{Connect, PacketLink};

use config::Config;
use light::{Bh1750, LightSource, SimLight};
use orchestrator::{Controller, Orchestrator, OrchestratorSettings};
use sim::{Environment, SimBoard, SimConnector};
use state::{SharedState, SystemState};
use store::Store;

/// Report cadence of the simulated board.
const SIM_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "growbox.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        port = %cfg.link.port,
        baud = cfg.link.baud,
        web_port = cfg.web.port,
        "config loaded"
    );

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = SystemState::shared(cfg.reconciler.clone(), cfg.tune.clone());
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── Store (history is optional, control is not) ─────────────────
    let store = match Store::open(&cfg.store.dir, cfg.store.max_records_per_segment).await {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("store disabled: {e:#}");
            shared
                .write()
                .await
                .record_error(format!("store disabled: {e:#}"));
            None
        }
    };

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared: SharedState::clone(&shared),
        store_dir: store
            .as_ref()
            .map_or_else(|| cfg.store.dir.clone(), |s| s.dir().to_path_buf()),
    };
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("{e:#}");
        }
    });

    // ── Ctrl-C ──────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                error!("cannot listen for ctrl-c, running until killed: {e}");
                std::future::pending::<()>().await;
            }
        }
    });

    // ── Control loop ────────────────────────────────────────────────
    #[cfg(feature = "serial")]
    {
        if !cfg.link.is_sim() {
            let connector =
                growbox_control::transport::SerialConnector::new(cfg.link.port.clone(), cfg.link.baud);
            return run_control(connector, Box::new(Bh1750::open()), &cfg, shared, store, stop_rx)
                .await;
        }
    }

    #[cfg(not(feature = "serial"))]
    {
        if !cfg.link.is_sim() {
            warn!(
                port = %cfg.link.port,
                "built without `serial` feature, using the simulated board"
            );
        }
    }

    let board = SimBoard::new(Environment::default(), SIM_REPORT_INTERVAL, fastrand::u64(..));
    let light: Box<dyn LightSource> = if cfg!(feature = "light") {
        Box::new(Bh1750::open())
    } else {
        Box::new(SimLight)
    };
    run_control(SimConnector::new(board), light, &cfg, shared, store, stop_rx).await
}

async fn run_control<C: Connect>(
    connector: C,
    light: Box<dyn LightSource>,
    cfg: &Config,
    shared: SharedState,
    store: Option<Store>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let controller = Controller::new(
        cfg.reconciler.clone(),
        cfg.tune.clone(),
        cfg.control.min_report_interval(),
    );
    let settings = OrchestratorSettings {
        receive_timeout: cfg.link.receive_timeout(),
        reconnect_backoff: cfg.control.reconnect_backoff(),
    };

    let link = PacketLink::new(connector, cfg.link.settings());
    let mut orchestrator = Orchestrator::new(link, controller, shared, settings).with_light(light);
    if let Some(store) = store {
        orchestrator = orchestrator.with_store(store);
    }
    orchestrator.run(stop).await
}
