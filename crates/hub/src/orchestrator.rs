//! The control task: receive reports, reconcile, actuate, publish, persist.
//!
//! Owns the [`PacketLink`] and the reconciler state. Link loss (no heartbeat,
//! reader stopped, failed write) closes the session and reopens it after a
//! backoff. On shutdown every actuator is switched off before the link closes.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use growbox_control::{
    reconcile, Connect, Inbound, LinkError, PacketLink, ReconcilerCommand, ReconcilerConfig,
    ReconcilerState, ReconcilerTune, SensorReport, LEVEL_MAX,
};

use crate::light::LightSource;
use crate::state::SharedState;
use crate::store::{Record, Store};

/// `dt` for the first report after start.
const FIRST_DT: f64 = 1e-3;
/// Peltier level at or above which the fans run.
pub const FAN_THRESHOLD: u16 = 64;

pub fn fan_level_for(peltier_level: u16) -> u16 {
    if peltier_level >= FAN_THRESHOLD {
        LEVEL_MAX
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// Controller (pure decision logic, no I/O)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actuation {
    pub command: ReconcilerCommand,
    pub fan_level: u16,
}

impl Actuation {
    pub fn from_command(command: ReconcilerCommand) -> Self {
        Self {
            command,
            fan_level: fan_level_for(command.peltier_level),
        }
    }
}

pub struct Controller {
    state: ReconcilerState,
    config: ReconcilerConfig,
    tune: ReconcilerTune,
    min_interval: Duration,
    last_reconciled: Option<(Instant, ReconcilerCommand)>,
}

impl Controller {
    pub fn new(config: ReconcilerConfig, tune: ReconcilerTune, min_interval: Duration) -> Self {
        Self {
            state: ReconcilerState::default(),
            config,
            tune,
            min_interval,
            last_reconciled: None,
        }
    }

    pub fn state(&self) -> &ReconcilerState {
        &self.state
    }

    /// Decide the actuation for a report received at `now`. Reports closer
    /// than `min_interval` to the last reconciled one reuse its command.
    pub fn on_report(&mut self, report: &SensorReport, now: Instant) -> Actuation {
        let dt = match self.last_reconciled {
            Some((at, command)) if now.duration_since(at) < self.min_interval => {
                debug!("report within min interval, reusing last command");
                return Actuation::from_command(command);
            }
            Some((at, _)) => now.duration_since(at).as_secs_f64(),
            None => FIRST_DT,
        };

        let command = reconcile(&mut self.state, &self.config, &self.tune, report, dt);
        self.last_reconciled = Some((now, command));
        Actuation::from_command(command)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator (link + state + store)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub receive_timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(2),
        }
    }
}

pub struct Orchestrator<C: Connect> {
    link: PacketLink<C>,
    controller: Controller,
    shared: SharedState,
    settings: OrchestratorSettings,
    light: Option<Box<dyn LightSource>>,
    store: Option<Store>,
}

impl<C: Connect> Orchestrator<C> {
    pub fn new(
        link: PacketLink<C>,
        controller: Controller,
        shared: SharedState,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            link,
            controller,
            shared,
            settings,
            light: None,
            store: None,
        }
    }

    pub fn with_light(mut self, light: Box<dyn LightSource>) -> Self {
        self.light = Some(light);
        self
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }

            // ── Session ─────────────────────────────────────────────
            if !self.link.is_open() {
                match self.link.open().await {
                    Ok(()) => {
                        self.shared
                            .write()
                            .await
                            .record_link(true, "link open".to_string());
                    }
                    Err(e) => {
                        warn!("link open failed: {e}");
                        self.shared
                            .write()
                            .await
                            .record_error(format!("link open failed: {e}"));
                        if pause(&mut shutdown, self.settings.reconnect_backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            // ── Receive ─────────────────────────────────────────────
            let received = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                r = self.link.receive(self.settings.receive_timeout) => r,
            };

            match received {
                Ok(Some(Inbound::Report(report))) => {
                    if let Err(e) = self.handle_report(report).await {
                        if self.reconnect(&mut shutdown, format!("send failed: {e}")).await {
                            break;
                        }
                        continue;
                    }
                }
                Ok(Some(Inbound::Heartbeat)) | Ok(None) => {}
                Err(LinkError::ReaderStopped(reason)) => {
                    if self
                        .reconnect(&mut shutdown, format!("reader stopped: {reason}"))
                        .await
                    {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    if self.reconnect(&mut shutdown, format!("receive failed: {e}")).await {
                        break;
                    }
                    continue;
                }
            }

            // ── Liveness ────────────────────────────────────────────
            if !self.link.is_alive() {
                let age = self.link.heartbeat_age().unwrap_or_default();
                let reason = format!("heartbeat lost ({:.1}s since last)", age.as_secs_f64());
                if self.reconnect(&mut shutdown, reason).await {
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle_report(&mut self, report: SensorReport) -> Result<(), LinkError> {
        let lux = self.light.as_mut().and_then(|l| l.read_lux());
        let report = report.with_illumination(lux);
        let actuation = self.controller.on_report(&report, Instant::now());

        debug!(?report, ?actuation, "reconciled");
        self.shared.write().await.record_report(report);

        actuate(&self.link, actuation).await?;

        self.shared.write().await.record_command(
            actuation.command,
            actuation.fan_level,
            self.controller.state(),
        );

        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.append(&Record::now(report, actuation.command)).await {
                warn!("store append failed: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("store append failed: {e:#}"));
            }
        }
        Ok(())
    }

    /// Close the session and wait out the backoff. True if shutdown arrived
    /// meanwhile.
    async fn reconnect(&mut self, shutdown: &mut watch::Receiver<bool>, reason: String) -> bool {
        warn!(%reason, "link down, reconnecting");
        self.shared.write().await.record_link(false, reason);
        self.link.close().await;
        pause(shutdown, self.settings.reconnect_backoff).await
    }

    async fn shutdown(&mut self) {
        if self.link.is_open() {
            if let Err(e) = actuate(&self.link, Actuation::from_command(ReconcilerCommand::OFF)).await {
                warn!("failed to switch actuators off: {e}");
            }
            self.link.close().await;
        }
        let mut st = self.shared.write().await;
        st.record_link(false, "link closed".to_string());
        st.record_system("control loop stopped".to_string());
        info!("control loop stopped");
    }
}

/// Send pump, peltier and fans in that order. Borrows only the link so the
/// light source need not be `Sync`.
async fn actuate<C: Connect>(link: &PacketLink<C>, actuation: Actuation) -> Result<(), LinkError> {
    let cmd = actuation.command;
    link.send_pump(i64::from(cmd.pump_level)).await?;
    link.send_peltier(
        i64::from(cmd.peltier_level),
        i64::from(cmd.peltier_forward),
    )
    .await?;
    link.send_fans(i64::from(actuation.fan_level)).await
}

/// Sleep for `period`; true if shutdown was requested first.
async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => true,
        _ = sleep(period) => false,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
