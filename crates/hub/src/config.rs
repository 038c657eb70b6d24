//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use growbox_control::{Gains, LinkSettings, ReconcilerConfig, ReconcilerTune, LEVEL_MAX};

/// Upper bound for every `*_sec` setting (one day).
pub const MAX_SECONDS: f64 = 86_400.0;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub reconciler: ReconcilerConfig,
    pub tune: ReconcilerTune,
    pub store: StoreConfig,
    pub web: WebConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial device path, or `sim` for the built-in mock board.
    pub port: String,
    pub baud: u32,
    pub heartbeat_timeout_sec: f64,
    pub receive_timeout_sec: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA3".to_string(),
            baud: 9600,
            heartbeat_timeout_sec: 10.0,
            receive_timeout_sec: 1.0,
        }
    }
}

impl LinkConfig {
    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            heartbeat_timeout: seconds(self.heartbeat_timeout_sec),
            ..LinkSettings::default()
        }
    }

    pub fn receive_timeout(&self) -> Duration {
        seconds(self.receive_timeout_sec)
    }

    pub fn is_sim(&self) -> bool {
        self.port.eq_ignore_ascii_case("sim")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
    /// 360 records = 30 minutes at one report every 5 s.
    pub max_records_per_segment: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            max_records_per_segment: 360,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Reports closer together than this reuse the previous command. 0 = off.
    pub min_report_interval_sec: f64,
    pub reconnect_backoff_sec: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            min_report_interval_sec: 0.0,
            reconnect_backoff_sec: 2.0,
        }
    }
}

impl ControlConfig {
    pub fn min_report_interval(&self) -> Duration {
        seconds(self.min_report_interval_sec)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        seconds(self.reconnect_backoff_sec)
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `SERIAL_PORT`, `WEB_PORT` and `STORE_DIR` on top of the file.
    /// `var` is `std::env::var` in production.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("SERIAL_PORT") {
            self.link.port = port;
        }
        if let Some(raw) = var("WEB_PORT") {
            match raw.parse() {
                Ok(port) => self.web.port = port,
                Err(_) => tracing::warn!(value = %raw, "ignoring unparseable WEB_PORT"),
            }
        }
        if let Some(dir) = var("STORE_DIR") {
            self.store.dir = PathBuf::from(dir);
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_link(&mut errors);
        self.validate_reconciler(&mut errors);
        self.validate_tune(&mut errors);
        self.validate_runtime(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_link(&self, errors: &mut Vec<String>) {
        let l = &self.link;
        if l.port.trim().is_empty() {
            errors.push("link: port is empty".to_string());
        }
        if l.baud == 0 {
            errors.push("link: baud must be positive".to_string());
        }
        for (name, v) in [
            ("heartbeat_timeout_sec", l.heartbeat_timeout_sec),
            ("receive_timeout_sec", l.receive_timeout_sec),
        ] {
            if !positive(v) {
                errors.push(format!("link: {name} must be positive, got {v}"));
            } else if v > MAX_SECONDS {
                errors.push(format!("link: {name} must be at most {MAX_SECONDS}, got {v}"));
            }
        }
    }

    fn validate_reconciler(&self, errors: &mut Vec<String>) {
        let r = &self.reconciler;
        let (lo, hi) = r.moisture_range;

        // ── Moisture band ───────────────────────────────────
        for (name, v) in [("lo", lo), ("hi", hi)] {
            if !(0..=100).contains(&v) {
                errors.push(format!(
                    "reconciler: moisture_range {name} {v} out of range [0, 100]"
                ));
            }
        }
        if lo >= hi {
            errors.push(format!(
                "reconciler: moisture_range lo ({lo}) must be less than hi ({hi})"
            ));
        }

        // ── Disable windows ─────────────────────────────────
        for (i, w) in r.pump_disable_times.iter().enumerate() {
            for (name, hour) in [("start_hour", w.start_hour), ("end_hour", w.end_hour)] {
                if hour > 23 {
                    errors.push(format!(
                        "reconciler: pump_disable_times[{i}]: {name} {hour} out of range [0, 23]"
                    ));
                }
            }
            for (name, minute) in [("start_minute", w.start_minute), ("end_minute", w.end_minute)]
            {
                if minute > 59 {
                    errors.push(format!(
                        "reconciler: pump_disable_times[{i}]: {name} {minute} out of range [0, 59]"
                    ));
                }
            }
        }
    }

    fn validate_tune(&self, errors: &mut Vec<String>) {
        let t = &self.tune;

        validate_gains("pump", &t.pump, errors);
        validate_gains("peltier", &t.peltier, errors);

        for (name, alpha) in [
            ("temp_ema_alpha", t.temp_ema_alpha),
            ("moisture_ema_alpha", t.moisture_ema_alpha),
        ] {
            if !(0.0..=1.0).contains(&alpha) {
                errors.push(format!("tune: {name} {alpha} out of range [0.0, 1.0]"));
            }
        }

        for (name, v) in [
            ("temp_deadband", t.temp_deadband),
            ("moisture_deadband", t.moisture_deadband),
            ("der_tau", t.der_tau),
            ("aw_limit", t.aw_limit),
        ] {
            if !non_negative(v) {
                errors.push(format!("tune: {name} must be finite and >= 0, got {v}"));
            }
        }

        if t.cutoff > LEVEL_MAX {
            errors.push(format!(
                "tune: cutoff {} out of range [0, {LEVEL_MAX}]",
                t.cutoff
            ));
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        if self.store.max_records_per_segment == 0 {
            errors.push("store: max_records_per_segment must be positive".to_string());
        }
        if self.store.dir.as_os_str().is_empty() {
            errors.push("store: dir is empty".to_string());
        }
        for (name, v) in [
            ("min_report_interval_sec", self.control.min_report_interval_sec),
            ("reconnect_backoff_sec", self.control.reconnect_backoff_sec),
        ] {
            if !non_negative(v) {
                errors.push(format!("control: {name} must be finite and >= 0, got {v}"));
            } else if v > MAX_SECONDS {
                errors.push(format!("control: {name} must be at most {MAX_SECONDS}, got {v}"));
            }
        }
    }
}

fn validate_gains(channel: &str, g: &Gains, errors: &mut Vec<String>) {
    for (name, v) in [("kp", g.kp), ("ki", g.ki), ("kd", g.kd)] {
        if !non_negative(v) {
            errors.push(format!(
                "tune: {channel}.{name} must be finite and >= 0, got {v}"
            ));
        }
    }
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

/// Seconds to a `Duration`, saturating at [`MAX_SECONDS`]. Negative or NaN
/// input gives zero.
fn seconds(v: f64) -> Duration {
    Duration::try_from_secs_f64(v.min(MAX_SECONDS)).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, override from the environment, and validate. A missing file
/// yields the defaults.
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use growbox_control::DisableWindow;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.link.port, "/dev/ttyAMA3");
        assert_eq!(config.link.baud, 9600);
        assert_eq!(config.reconciler.moisture_range, (20, 60));
        assert_eq!(config.tune.cutoff, 64);
        assert_eq!(config.store.max_records_per_segment, 360);
        assert_eq!(config.web.port, 8000);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[link]
port = "sim"
heartbeat_timeout_sec = 5

[reconciler]
moisture_range = [30, 70]
target_inner_temp = 24

[[reconciler.pump_disable_times]]
start_hour = 22
start_minute = 0
end_hour = 6
end_minute = 30

[tune]
cutoff = 100
temp_ema_count = 5

[tune.peltier]
kp = 12.0
ki = 0.5
kd = 0.0

[store]
dir = "/var/lib/growbox"

[control]
min_report_interval_sec = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.link.is_sim());
        assert_eq!(config.link.heartbeat_timeout_sec, 5.0);
        assert_eq!(config.link.baud, 9600);
        assert_eq!(config.reconciler.moisture_range, (30, 70));
        assert_eq!(config.reconciler.target_inner_temp, 24);
        assert_eq!(
            config.reconciler.pump_disable_times,
            vec![DisableWindow::new(22, 0, 6, 30)]
        );
        assert_eq!(config.tune.cutoff, 100);
        assert_eq!(config.tune.temp_ema_count, 5);
        assert_eq!(config.tune.peltier.kp, 12.0);
        assert_eq!(config.tune.pump, ReconcilerTune::default().pump);
        assert_eq!(config.store.dir, PathBuf::from("/var/lib/growbox"));
        assert_eq!(config.control.min_report_interval(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn link_settings_conversion() {
        let link = LinkConfig {
            heartbeat_timeout_sec: 2.5,
            receive_timeout_sec: 0.5,
            ..LinkConfig::default()
        };
        assert_eq!(link.settings().heartbeat_timeout, Duration::from_millis(2500));
        assert_eq!(link.receive_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("growbox-config-does-not-exist.toml");
        let config = load(&path).unwrap();
        assert_eq!(config.tune, ReconcilerTune::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = std::env::temp_dir().join(format!(
            "growbox-config-malformed-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[link\nport = ").unwrap();
        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config"));
        std::fs::remove_file(&path).ok();
    }

    // -- Environment overrides --------------------------------------------

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("SERIAL_PORT", "/dev/ttyUSB0"),
            ("WEB_PORT", "9090"),
            ("STORE_DIR", "/tmp/growbox"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.link.port, "/dev/ttyUSB0");
        assert_eq!(config.web.port, 9090);
        assert_eq!(config.store.dir, PathBuf::from("/tmp/growbox"));
    }

    #[test]
    fn bad_web_port_override_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|k| (k == "WEB_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.web.port, 8000);
    }

    // -- Validation: reconciler -------------------------------------------

    #[test]
    fn defaults_pass() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn moisture_range_inverted() {
        let mut cfg = Config::default();
        cfg.reconciler.moisture_range = (60, 20);
        assert_validation_err(&cfg, "lo (60) must be less than hi (20)");
    }

    #[test]
    fn moisture_range_out_of_bounds() {
        let mut cfg = Config::default();
        cfg.reconciler.moisture_range = (-5, 120);
        assert_validation_err(&cfg, "lo -5 out of range");
        assert_validation_err(&cfg, "hi 120 out of range");
    }

    #[test]
    fn disable_window_bad_hour_and_minute() {
        let mut cfg = Config::default();
        cfg.reconciler.pump_disable_times = vec![DisableWindow::new(24, 0, 6, 60)];
        assert_validation_err(&cfg, "pump_disable_times[0]: start_hour 24");
        assert_validation_err(&cfg, "pump_disable_times[0]: end_minute 60");
    }

    // -- Validation: tune -------------------------------------------------

    #[test]
    fn alpha_out_of_range() {
        let mut cfg = Config::default();
        cfg.tune.temp_ema_alpha = 1.5;
        assert_validation_err(&cfg, "temp_ema_alpha 1.5 out of range");
    }

    #[test]
    fn negative_deadband() {
        let mut cfg = Config::default();
        cfg.tune.moisture_deadband = -1.0;
        assert_validation_err(&cfg, "moisture_deadband must be finite and >= 0");
    }

    #[test]
    fn cutoff_above_level_max() {
        let mut cfg = Config::default();
        cfg.tune.cutoff = 2000;
        assert_validation_err(&cfg, "cutoff 2000 out of range");
    }

    #[test]
    fn non_finite_gain() {
        let mut cfg = Config::default();
        cfg.tune.peltier.ki = f64::NAN;
        assert_validation_err(&cfg, "peltier.ki must be finite");
    }

    // -- Validation: link + runtime ---------------------------------------

    #[test]
    fn zero_heartbeat_timeout() {
        let mut cfg = Config::default();
        cfg.link.heartbeat_timeout_sec = 0.0;
        assert_validation_err(&cfg, "heartbeat_timeout_sec must be positive");
    }

    #[test]
    fn oversized_timeouts_are_rejected() {
        let mut cfg = Config::default();
        cfg.link.heartbeat_timeout_sec = 1e30;
        cfg.control.reconnect_backoff_sec = 1e30;
        assert_validation_err(&cfg, "heartbeat_timeout_sec must be at most 86400");
        assert_validation_err(&cfg, "reconnect_backoff_sec must be at most 86400");
    }

    #[test]
    fn huge_seconds_do_not_panic() {
        let link = LinkConfig {
            heartbeat_timeout_sec: 1e30,
            receive_timeout_sec: f64::INFINITY,
            ..LinkConfig::default()
        };
        let day = Duration::from_secs(86_400);
        assert_eq!(link.settings().heartbeat_timeout, day);
        assert_eq!(link.receive_timeout(), day);

        let control = ControlConfig {
            min_report_interval_sec: -1.0,
            reconnect_backoff_sec: f64::NAN,
        };
        assert_eq!(control.min_report_interval(), Duration::ZERO);
        assert_eq!(control.reconnect_backoff(), day);
    }

    #[test]
    fn zero_segment_size() {
        let mut cfg = Config::default();
        cfg.store.max_records_per_segment = 0;
        assert_validation_err(&cfg, "max_records_per_segment must be positive");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.link.port = "".into();
        cfg.reconciler.moisture_range = (50, 50);
        cfg.tune.der_tau = -1.0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "{msg}");
        assert!(msg.contains("port is empty"), "{msg}");
        assert!(msg.contains("must be less than hi"), "{msg}");
        assert!(msg.contains("der_tau"), "{msg}");
    }
}
