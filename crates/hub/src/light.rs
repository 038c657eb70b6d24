//! Ambient light sources for the `illumination` field of sensor reports.
//!
//! The BH1750 sits on the host's own I2C bus (not behind the board), so the
//! reading is attached after a report is decoded. Any failure yields `None`.

use time::OffsetDateTime;

// ── BH1750 constants ────────────────────────────────────────────────────────

/// Default address with the ADDR pin pulled low.
#[cfg_attr(not(feature = "light"), allow(dead_code))]
pub const BH1750_ADDRESS: u16 = 0x23;
/// Continuously measure at 1 lx resolution (120 ms per conversion).
#[cfg_attr(not(feature = "light"), allow(dead_code))]
pub const CONTINUOUS_HIGH_RES_MODE: u8 = 0x10;
/// Counts per lux in high-resolution mode.
#[cfg_attr(not(feature = "light"), allow(dead_code))]
const COUNTS_PER_LUX: f64 = 1.2;

/// Convert the big-endian measurement register to lux.
#[cfg_attr(not(feature = "light"), allow(dead_code))]
pub fn raw_to_lux(raw: [u8; 2]) -> f64 {
    f64::from(u16::from_be_bytes(raw)) / COUNTS_PER_LUX
}

/// Anything that can report ambient illumination in lux.
pub trait LightSource: Send {
    fn read_lux(&mut self) -> Option<f64>;
}

// ── Hardware driver ─────────────────────────────────────────────────────────

/// BH1750 backed by `rppal::i2c` when the `light` feature is enabled.
/// Without the feature, or if the bus cannot be opened, it always reports
/// `None`.
pub struct Bh1750 {
    #[cfg(feature = "light")]
    i2c: Option<rppal::i2c::I2c>,
}

impl Bh1750 {
    /// Open I2C bus 1 and address the sensor. Failure is logged, not fatal.
    #[cfg(feature = "light")]
    pub fn open() -> Self {
        let open = || -> anyhow::Result<rppal::i2c::I2c> {
            let mut i2c = rppal::i2c::I2c::new()?;
            i2c.set_slave_address(BH1750_ADDRESS)?;
            Ok(i2c)
        };
        match open() {
            Ok(i2c) => {
                tracing::info!(
                    addr = format_args!("0x{BH1750_ADDRESS:02x}"),
                    "bh1750 initialised"
                );
                Self { i2c: Some(i2c) }
            }
            Err(e) => {
                tracing::warn!("bh1750 unavailable, illumination disabled: {e}");
                Self { i2c: None }
            }
        }
    }

    #[cfg(not(feature = "light"))]
    pub fn open() -> Self {
        tracing::info!("built without `light` feature, illumination disabled");
        Self {}
    }
}

impl LightSource for Bh1750 {
    #[cfg(feature = "light")]
    fn read_lux(&mut self) -> Option<f64> {
        let i2c = self.i2c.as_mut()?;
        let mut buf = [0u8; 2];
        match i2c.block_read(CONTINUOUS_HIGH_RES_MODE, &mut buf) {
            Ok(()) => Some(raw_to_lux(buf)),
            Err(e) => {
                tracing::warn!("bh1750 read failed: {e}");
                None
            }
        }
    }

    #[cfg(not(feature = "light"))]
    fn read_lux(&mut self) -> Option<f64> {
        None
    }
}

// ── Simulated daylight ──────────────────────────────────────────────────────

/// Synthetic daylight curve used alongside the mock board: dark around
/// midday UTC, brightest at midnight, matching the mock physics rather than
/// a real sky.
pub struct SimLight;

impl SimLight {
    /// Lux at `fraction` of the day (0.0 = 00:00, 0.5 = 12:00).
    pub fn lux_at(fraction: f64) -> f64 {
        1000.0 * ((0.5 - fraction).abs() * 2.0 - 0.1).max(0.0)
    }
}

impl LightSource for SimLight {
    fn read_lux(&mut self) -> Option<f64> {
        let now = OffsetDateTime::now_utc();
        let secs = f64::from(now.hour()) * 3600.0
            + f64::from(now.minute()) * 60.0
            + f64::from(now.second());
        Some(Self::lux_at(secs / 86_400.0))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- Conversion ---------------------------------------------------------

    #[test]
    fn raw_to_lux_scales_by_1_2() {
        assert_eq!(raw_to_lux([0x00, 0x00]), 0.0);
        assert_eq!(raw_to_lux([0x00, 0x78]), 100.0); // 120 counts
        assert!((raw_to_lux([0xFF, 0xFF]) - 54612.5).abs() < 1e-9);
    }

    #[test]
    fn mode_and_address() {
        assert_eq!(BH1750_ADDRESS, 0x23);
        assert_eq!(CONTINUOUS_HIGH_RES_MODE, 0x10);
    }

    // -- Sources ------------------------------------------------------------

    #[cfg(not(feature = "light"))]
    #[test]
    fn without_feature_reports_none() {
        let mut sensor = Bh1750::open();
        assert_eq!(sensor.read_lux(), None);
    }

    #[test]
    fn sim_light_curve() {
        assert_eq!(SimLight::lux_at(0.5), 0.0);
        assert!((SimLight::lux_at(0.0) - 900.0).abs() < 1e-9);
        assert!((SimLight::lux_at(0.25) - 400.0).abs() < 1e-9);
        let lux = SimLight.read_lux().unwrap();
        assert!((0.0..=900.0).contains(&lux), "{lux}");
    }
}
