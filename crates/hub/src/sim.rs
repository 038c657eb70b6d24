//! Simulated grow box board for running the hub without hardware.
//!
//! Plays the microcontroller's side of the serial protocol over a
//! [`Transport`]: every report interval it advances a small physics model and
//! emits a sensor report followed by a heartbeat. Commands written by the hub
//! set the actuator levels that drive the model.
//!
//! - Pump adds up to 5 %/s soil moisture; evaporation removes 0.5 %/s
//! - Peltier moves the inner temperature up to 3 °C/s (heats on forward = 0)
//! - Inner temperature leaks toward outer at 1 %/s of the difference
//! - Inner humidity dries out above 20 °C
//! - Uniform sensor noise on moisture, temperature and humidity

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use growbox_control::codec::{decode_command, Inbound, Outbound, SensorReport, LEVEL_MAX};
use growbox_control::{Connect, Transport};

/// Longest a single `read_line` waits before reporting an empty read.
const SIM_POLL: Duration = Duration::from_millis(100);

const PUMP_RATE: f64 = 5.0;
const EVAPORATION_RATE: f64 = 0.5;
const PELTIER_RATE: f64 = 3.0;
const LEAK_RATE: f64 = 0.01;
const DRYING_RATE: f64 = 0.01;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    pub moisture: f64,
    pub temp_inner: f64,
    pub humd_inner: f64,
    pub temp_outer: f64,
    pub humd_outer: f64,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            moisture: 15.0,
            temp_inner: 14.0,
            humd_inner: 55.0,
            temp_outer: 12.0,
            humd_outer: 60.0,
        }
    }
}

impl Environment {
    fn report(&self) -> SensorReport {
        SensorReport::new(
            self.moisture as i32,
            self.temp_inner as i32,
            self.humd_inner as i32,
            self.temp_outer as i32,
            self.humd_outer as i32,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actuators {
    pub pump: u16,
    pub peltier: u16,
    /// `true` cools.
    pub peltier_forward: bool,
    pub fans: u16,
}

impl Actuators {
    fn apply(&mut self, packet: Outbound) {
        match packet {
            Outbound::Pump { level } => self.pump = level,
            Outbound::Peltier { level, forward } => {
                self.peltier = level;
                self.peltier_forward = forward;
            }
            Outbound::Fans { level } => self.fans = level,
            Outbound::Heartbeat => {}
        }
    }
}

fn uniform(rng: &mut fastrand::Rng, spread: f64) -> f64 {
    (rng.f64() * 2.0 - 1.0) * spread
}

/// Advance `env` by `dt` seconds under `act`.
fn step(env: &mut Environment, act: &Actuators, rng: &mut fastrand::Rng, dt: f64) {
    let full = f64::from(LEVEL_MAX);

    env.moisture += (f64::from(act.pump) / full * PUMP_RATE - EVAPORATION_RATE) * dt;

    let peltier = f64::from(act.peltier) / full * PELTIER_RATE * dt;
    if act.peltier_forward {
        env.temp_inner -= peltier;
    } else {
        env.temp_inner += peltier;
    }
    env.temp_inner += (env.temp_outer - env.temp_inner) * LEAK_RATE * dt;

    env.humd_inner -= (env.temp_inner - 20.0) * DRYING_RATE * dt;

    env.moisture += uniform(rng, 0.5);
    env.temp_inner += uniform(rng, 0.1);
    env.humd_inner += uniform(rng, 0.5);

    env.moisture = env.moisture.clamp(0.0, 100.0);
    env.temp_inner = env.temp_inner.clamp(0.0, 100.0);
    env.humd_inner = env.humd_inner.clamp(0.0, 100.0);
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

struct Board {
    env: Environment,
    act: Actuators,
    rng: fastrand::Rng,
    outbox: VecDeque<String>,
    next_report: Instant,
}

/// Handle to the simulated board. Clones share the same board, so the model
/// survives link reconnects.
#[derive(Clone)]
pub struct SimBoard {
    board: Arc<Mutex<Board>>,
    interval: Duration,
}

impl SimBoard {
    /// The first report is due immediately.
    pub fn new(env: Environment, interval: Duration, seed: u64) -> Self {
        Self {
            board: Arc::new(Mutex::new(Board {
                env,
                act: Actuators::default(),
                rng: fastrand::Rng::with_seed(seed),
                outbox: VecDeque::new(),
                next_report: Instant::now(),
            })),
            interval,
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Board>> {
        self.board
            .lock()
            .map_err(|_| io::Error::other("sim board lock poisoned"))
    }

    #[cfg(test)]
    fn actuators(&self) -> io::Result<Actuators> {
        Ok(self.lock()?.act)
    }
}

impl Transport for SimBoard {
    async fn read_line(&self) -> io::Result<Option<String>> {
        let wake = {
            let mut board = self.lock()?;
            if let Some(line) = board.outbox.pop_front() {
                return Ok(Some(line));
            }

            let now = Instant::now();
            if now >= board.next_report {
                let Board { env, act, rng, .. } = &mut *board;
                step(env, act, rng, self.interval.as_secs_f64());

                let report = Inbound::Report(board.env.report()).encode();
                board.outbox.push_back(report.trim_end().to_string());
                board
                    .outbox
                    .push_back(Inbound::Heartbeat.encode().trim_end().to_string());
                board.next_report = now + self.interval;
                return Ok(board.outbox.pop_front());
            }
            board.next_report.min(now + SIM_POLL)
        };
        sleep_until(wake).await;
        Ok(None)
    }

    async fn write_line(&self, line: &str) -> io::Result<()> {
        match decode_command(line) {
            Ok(packet) => self.lock()?.act.apply(packet),
            Err(e) => tracing::warn!(line = %line.trim_end(), "sim board ignoring command: {e}"),
        }
        Ok(())
    }

    async fn discard_input(&self) -> io::Result<()> {
        self.lock()?.outbox.clear();
        Ok(())
    }
}

/// Hands the same [`SimBoard`] to every link session.
pub struct SimConnector {
    board: SimBoard,
}

impl SimConnector {
    pub fn new(board: SimBoard) -> Self {
        Self { board }
    }
}

impl Connect for SimConnector {
    type Transport = SimBoard;

    async fn connect(&self) -> io::Result<SimBoard> {
        tracing::info!(interval = ?self.board.interval, "connected to simulated board");
        Ok(self.board.clone())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use growbox_control::codec::decode_line;

    fn still_env() -> Environment {
        Environment {
            moisture: 30.0,
            temp_inner: 20.0,
            humd_inner: 50.0,
            temp_outer: 20.0,
            humd_outer: 50.0,
        }
    }

    // -- Physics ----------------------------------------------------------

    #[test]
    fn pump_raises_moisture() {
        let mut env = still_env();
        let act = Actuators {
            pump: LEVEL_MAX,
            ..Actuators::default()
        };
        let mut rng = fastrand::Rng::with_seed(1);
        for _ in 0..10 {
            step(&mut env, &act, &mut rng, 1.0);
        }
        // 4.5 %/s net for 10 s, noise at most ±0.5 per step.
        assert!(env.moisture >= 30.0 + 45.0 - 5.0, "{}", env.moisture);
    }

    #[test]
    fn evaporation_dries_soil() {
        let mut env = still_env();
        let mut rng = fastrand::Rng::with_seed(2);
        for _ in 0..40 {
            step(&mut env, &Actuators::default(), &mut rng, 1.0);
        }
        assert!(env.moisture < 30.0, "{}", env.moisture);
    }

    #[test]
    fn peltier_direction() {
        let mut rng = fastrand::Rng::with_seed(3);

        let mut heated = still_env();
        let heat = Actuators {
            peltier: LEVEL_MAX,
            peltier_forward: false,
            ..Actuators::default()
        };
        step(&mut heated, &heat, &mut rng, 1.0);
        assert!(heated.temp_inner > 22.0, "{}", heated.temp_inner);

        let mut cooled = still_env();
        let cool = Actuators {
            peltier_forward: true,
            ..heat
        };
        step(&mut cooled, &cool, &mut rng, 1.0);
        assert!(cooled.temp_inner < 18.0, "{}", cooled.temp_inner);
    }

    #[test]
    fn values_stay_clamped() {
        let mut env = Environment {
            moisture: 99.0,
            temp_inner: 1.0,
            ..still_env()
        };
        let act = Actuators {
            pump: LEVEL_MAX,
            peltier: LEVEL_MAX,
            peltier_forward: true,
            fans: 0,
        };
        let mut rng = fastrand::Rng::with_seed(4);
        for _ in 0..20 {
            step(&mut env, &act, &mut rng, 1.0);
            assert!((0.0..=100.0).contains(&env.moisture));
            assert!((0.0..=100.0).contains(&env.temp_inner));
            assert!((0.0..=100.0).contains(&env.humd_inner));
        }
    }

    // -- Transport --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn emits_report_then_heartbeat_each_interval() {
        let board = SimBoard::new(still_env(), Duration::from_secs(1), 5);

        let line = board.read_line().await.unwrap().unwrap();
        assert!(matches!(decode_line(&line), Ok(Inbound::Report(_))), "{line}");
        assert_eq!(board.read_line().await.unwrap().as_deref(), Some("9"));

        // Nothing more until the next interval elapses.
        let started = Instant::now();
        let mut empty_reads = 0;
        let next = loop {
            match board.read_line().await.unwrap() {
                Some(line) => break line,
                None => empty_reads += 1,
            }
        };
        assert!(empty_reads >= 9, "{empty_reads}");
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(matches!(decode_line(&next), Ok(Inbound::Report(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_set_actuators() {
        let board = SimBoard::new(still_env(), Duration::from_secs(1), 6);
        board.write_line("0,1023\n").await.unwrap();
        board.write_line("1,512,1\n").await.unwrap();
        board.write_line("2,1023\n").await.unwrap();
        board.write_line("9\n").await.unwrap();
        board.write_line("7,1\n").await.unwrap();

        let act = board.actuators().unwrap();
        assert_eq!(
            act,
            Actuators {
                pump: 1023,
                peltier: 512,
                peltier_forward: true,
                fans: 1023,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connector_shares_board_across_sessions() {
        let board = SimBoard::new(still_env(), Duration::from_secs(1), 7);
        let connector = SimConnector::new(board.clone());

        let first = connector.connect().await.unwrap();
        first.write_line("0,700\n").await.unwrap();
        drop(first);

        let second = connector.connect().await.unwrap();
        assert_eq!(second.actuators().unwrap().pump, 700);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_drops_pending_lines() {
        let board = SimBoard::new(still_env(), Duration::from_secs(1), 8);
        board.read_line().await.unwrap().unwrap();
        board.discard_input().await.unwrap();
        assert_eq!(board.read_line().await.unwrap(), None);
    }
}
