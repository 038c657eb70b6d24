//! Packet link to the board: one session per open transport.
//!
//! While open, two background tasks run against the shared transport:
//!
//! - the **reader** decodes lines, refreshes the liveness timestamp on
//!   heartbeats and queues every other packet for [`PacketLink::receive`];
//! - the **heartbeat sender** writes a heartbeat every half
//!   `heartbeat_timeout`.
//!
//! [`PacketLink::close`] signals both, waits for them to finish and only then
//! drops the transport, so nothing is written after teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::codec::{decode_line, Inbound, Outbound};
use crate::error::LinkError;
use crate::transport::{is_fatal, Connect, Transport};

#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// The link counts as dead once no heartbeat arrived for this long.
    pub heartbeat_timeout: Duration,
    /// Sleep after an empty read.
    pub idle_backoff: Duration,
    /// Sleep after a transient read error.
    pub error_backoff: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(10),
            idle_backoff: Duration::from_millis(10),
            error_backoff: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness (written by the reader, read by callers)
// ---------------------------------------------------------------------------

struct Liveness {
    epoch: Instant,
    last_heartbeat_ms: AtomicU64,
    alive: AtomicBool,
    fault: Mutex<Option<String>>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            fault: Mutex::new(None),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_heartbeat_ms.store(self.now_ms(), Ordering::Release);
    }

    fn since_heartbeat(&self) -> Duration {
        let last = self.last_heartbeat_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        self.alive.load(Ordering::Acquire) && self.since_heartbeat() < timeout
    }

    fn fail(&self, reason: String) {
        self.alive.store(false, Ordering::Release);
        if let Ok(mut fault) = self.fault.lock() {
            *fault = Some(reason);
        }
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock().ok().and_then(|f| f.clone())
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

struct Session<T> {
    transport: Arc<T>,
    packets: mpsc::UnboundedReceiver<Inbound>,
    liveness: Arc<Liveness>,
    shutdown: watch::Sender<bool>,
    workers: [JoinHandle<()>; 2],
}

pub struct PacketLink<C: Connect> {
    connector: C,
    settings: LinkSettings,
    session: Option<Session<C::Transport>>,
}

impl<C: Connect> PacketLink<C> {
    pub fn new(connector: C, settings: LinkSettings) -> Self {
        Self {
            connector,
            settings,
            session: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Connect, drop stale input and start the background tasks. No-op when
    /// already open.
    pub async fn open(&mut self) -> Result<(), LinkError> {
        if self.session.is_some() {
            return Ok(());
        }

        let transport = Arc::new(self.connector.connect().await.map_err(LinkError::Connect)?);
        transport.discard_input().await.map_err(LinkError::Connect)?;

        let liveness = Arc::new(Liveness::new());
        let (tx, packets) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let reader = tokio::spawn(read_loop(
            Arc::clone(&transport),
            tx,
            Arc::clone(&liveness),
            shutdown.subscribe(),
            self.settings.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&transport),
            shutdown.subscribe(),
            self.settings.heartbeat_timeout / 2,
        ));

        info!(
            heartbeat_timeout_ms = self.settings.heartbeat_timeout.as_millis() as u64,
            "packet link open"
        );

        self.session = Some(Session {
            transport,
            packets,
            liveness,
            shutdown,
            workers: [reader, heartbeat],
        });
        Ok(())
    }

    /// Stop both background tasks, wait for them, then release the transport.
    /// Safe to call repeatedly or without a prior `open`.
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let _ = session.shutdown.send(true);
        for worker in session.workers {
            if let Err(e) = worker.await {
                warn!("link worker ended abnormally: {e}");
            }
        }
        drop(session.transport);
        info!("packet link closed");
    }

    /// Open, and a heartbeat arrived within `heartbeat_timeout`.
    pub fn is_alive(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.liveness.is_alive(self.settings.heartbeat_timeout))
    }

    /// Time since the last heartbeat (or since `open` if none arrived yet).
    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.session.as_ref().map(|s| s.liveness.since_heartbeat())
    }

    /// Packets decoded but not yet received.
    pub fn queued(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.packets.len())
    }

    /// Next queued packet, or `Ok(None)` once `wait` elapses without one.
    ///
    /// Fails with [`LinkError::ReaderStopped`] when the reader has exited and
    /// the queue is drained.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<Inbound>, LinkError> {
        let session = self.session.as_mut().ok_or(LinkError::NotOpen)?;
        match tokio::time::timeout(wait, session.packets.recv()).await {
            Ok(Some(packet)) => Ok(Some(packet)),
            Ok(None) => Err(LinkError::ReaderStopped(
                session
                    .liveness
                    .fault()
                    .unwrap_or_else(|| "reader exited".to_string()),
            )),
            Err(_) => Ok(None),
        }
    }

    pub async fn send_pump(&self, level: i64) -> Result<(), LinkError> {
        self.send(Outbound::pump(level)?).await
    }

    pub async fn send_peltier(&self, level: i64, forward: i64) -> Result<(), LinkError> {
        self.send(Outbound::peltier(level, forward)?).await
    }

    pub async fn send_fans(&self, level: i64) -> Result<(), LinkError> {
        self.send(Outbound::fans(level)?).await
    }

    pub async fn send_heartbeat(&self) -> Result<(), LinkError> {
        self.send(Outbound::Heartbeat).await
    }

    pub async fn send(&self, packet: Outbound) -> Result<(), LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotOpen)?;
        session
            .transport
            .write_line(&packet.encode())
            .await
            .map_err(LinkError::Write)
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Resolves once shutdown is requested or the link is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleep for `period`; true if shutdown arrived first.
async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stopped(shutdown) => true,
        _ = sleep(period) => false,
    }
}

async fn read_loop<T: Transport>(
    transport: Arc<T>,
    packets: mpsc::UnboundedSender<Inbound>,
    liveness: Arc<Liveness>,
    mut shutdown: watch::Receiver<bool>,
    settings: LinkSettings,
) {
    debug!("reader started");
    loop {
        let read = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            read = transport.read_line() => read,
        };

        match read {
            Ok(Some(line)) => handle_line(&line, &packets, &liveness),
            Ok(None) => {
                if pause(&mut shutdown, settings.idle_backoff).await {
                    break;
                }
            }
            Err(e) if is_fatal(&e) => {
                error!("reader stopping, transport failed: {e}");
                liveness.fail(e.to_string());
                break;
            }
            Err(e) => {
                warn!("transport read failed: {e}");
                if pause(&mut shutdown, settings.error_backoff).await {
                    break;
                }
            }
        }
    }
    debug!("reader stopped");
}

fn handle_line(line: &str, packets: &mpsc::UnboundedSender<Inbound>, liveness: &Liveness) {
    if line.trim().is_empty() {
        return;
    }
    match decode_line(line) {
        Ok(Inbound::Heartbeat) => liveness.touch(),
        Ok(packet) => {
            debug!(kind = ?packet.kind(), "packet queued");
            if packets.send(packet).is_err() {
                debug!("packet dropped, receiver gone");
            }
        }
        Err(e) => warn!(line = %line.trim(), "dropping malformed line: {e}"),
    }
}

async fn heartbeat_loop<T: Transport>(
    transport: Arc<T>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let line = Outbound::Heartbeat.encode();

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        // Not raced against shutdown: close() waits for an in-flight write.
        if let Err(e) = transport.write_line(&line).await {
            warn!("heartbeat send failed: {e}");
        }
    }
    debug!("heartbeat sender stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
