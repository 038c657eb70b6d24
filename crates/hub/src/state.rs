use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use growbox_control::{
    ReconcilerCommand, ReconcilerConfig, ReconcilerState, ReconcilerTune, SensorReport,
};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub link_alive: bool,
    pub latest_report: Option<LatestReport>,
    pub latest_command: Option<LatestCommand>,
    pub reconciler: ReconcilerState,
    pub config: ReconcilerConfig,
    pub tune: ReconcilerTune,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct LatestReport {
    /// Bumped on every report so pollers can detect repeats of equal values.
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub report: SensorReport,
}

#[derive(Clone, Serialize)]
pub struct LatestCommand {
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub command: ReconcilerCommand,
    pub fan_level: u16,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Report,
    Command,
    Link,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON responses (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub link_alive: bool,
    pub latest_report: Option<LatestReport>,
    pub latest_command: Option<LatestCommand>,
    pub events: Vec<SystemEvent>,
}

#[derive(Serialize)]
pub struct ReconcilerSnapshot {
    pub state: ReconcilerState,
    pub config: ReconcilerConfig,
    pub tune: ReconcilerTune,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(config: ReconcilerConfig, tune: ReconcilerTune) -> Self {
        Self {
            started_at: Instant::now(),
            link_alive: false,
            latest_report: None,
            latest_command: None,
            reconciler: ReconcilerState::default(),
            config,
            tune,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(config: ReconcilerConfig, tune: ReconcilerTune) -> SharedState {
        Arc::new(RwLock::new(Self::new(config, tune)))
    }

    /// Record a sensor report from the board.
    pub fn record_report(&mut self, report: SensorReport) {
        let seq = self.latest_report.as_ref().map_or(1, |r| r.seq + 1);
        self.latest_report = Some(LatestReport {
            seq,
            ts: now(),
            report,
        });

        let lux = report
            .illumination
            .map_or_else(|| "n/a".to_string(), |l| format!("{l:.0}"));
        self.push_event(
            EventKind::Report,
            format!(
                "moisture={} temp_inner={} humd_inner={} temp_outer={} humd_outer={} lux={lux}",
                report.moisture,
                report.temp_inner,
                report.humd_inner,
                report.temp_outer,
                report.humd_outer
            ),
        );
    }

    /// Record the command sent in response to a report, together with the
    /// reconciler state that produced it.
    pub fn record_command(
        &mut self,
        command: ReconcilerCommand,
        fan_level: u16,
        reconciler: &ReconcilerState,
    ) {
        let seq = self.latest_command.as_ref().map_or(1, |c| c.seq + 1);
        self.latest_command = Some(LatestCommand {
            seq,
            ts: now(),
            command,
            fan_level,
        });
        self.reconciler.clone_from(reconciler);

        self.push_event(
            EventKind::Command,
            format!(
                "pump={} peltier={} forward={} fans={fan_level}",
                command.pump_level, command.peltier_level, command.peltier_forward
            ),
        );
    }

    /// Record a link health transition.
    pub fn record_link(&mut self, alive: bool, detail: String) {
        self.link_alive = alive;
        self.push_event(EventKind::Link, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            link_alive: self.link_alive,
            latest_report: self.latest_report.clone(),
            latest_command: self.latest_command.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    pub fn to_reconciler_snapshot(&self) -> ReconcilerSnapshot {
        ReconcilerSnapshot {
            state: self.reconciler.clone(),
            config: self.config.clone(),
            tune: self.tune.clone(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: now(),
            kind,
            detail,
        });
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

// ===========================================================================
// Tests
// ===========================================================================
