//! Synthetic telemetry for simulation mode.
//!
//! Generates physically plausible solar, battery and load behavior from the
//! wall clock: a bell-shaped solar curve inside the daylight window, peak
//! and trough load multipliers, and a stateful battery SOC integrated over
//! the time elapsed between samples.

use chrono::{DateTime, Datelike, Local, Timelike};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Battery SOC ceiling, percent
const SOC_MAX_PERCENT: f64 = 95.0;
/// Battery SOC floor, percent
const SOC_MIN_PERCENT: f64 = 20.0;
/// Maximum battery charge power, W
const MAX_CHARGE_POWER_W: f64 = 2000.0;
/// Maximum battery discharge power, W
const MAX_DISCHARGE_POWER_W: f64 = 3000.0;

/// Tunable parameters of the simulation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationParams {
    #[serde(default = "default_max_solar_power")]
    pub max_solar_power_w: f64,
    #[serde(default = "default_battery_capacity")]
    pub battery_capacity_ah: f64,
    #[serde(default = "default_battery_voltage")]
    pub battery_voltage_v: f64,
    #[serde(default = "default_base_load")]
    pub base_load_w: f64,
    /// First daylight hour, inclusive
    #[serde(default = "default_daylight_start")]
    pub daylight_start_hour: u32,
    /// Last daylight hour, exclusive
    #[serde(default = "default_daylight_end")]
    pub daylight_end_hour: u32,
    /// Cloud-cover attenuation range applied per sample
    #[serde(default = "default_weather_min")]
    pub weather_factor_min: f64,
    #[serde(default = "default_weather_max")]
    pub weather_factor_max: f64,
    #[serde(default = "default_initial_soc")]
    pub initial_soc_percent: f64,
}

fn default_max_solar_power() -> f64 {
    5000.0
}

fn default_battery_capacity() -> f64 {
    100.0
}

fn default_battery_voltage() -> f64 {
    48.0
}

fn default_base_load() -> f64 {
    800.0
}

fn default_daylight_start() -> u32 {
    6
}

fn default_daylight_end() -> u32 {
    18
}

fn default_weather_min() -> f64 {
    0.7
}

fn default_weather_max() -> f64 {
    1.0
}

fn default_initial_soc() -> f64 {
    75.0
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            max_solar_power_w: default_max_solar_power(),
            battery_capacity_ah: default_battery_capacity(),
            battery_voltage_v: default_battery_voltage(),
            base_load_w: default_base_load(),
            daylight_start_hour: default_daylight_start(),
            daylight_end_hour: default_daylight_end(),
            weather_factor_min: default_weather_min(),
            weather_factor_max: default_weather_max(),
            initial_soc_percent: default_initial_soc(),
        }
    }
}

/// One synthesized telemetry sample
#[derive(Debug, Clone)]
pub struct SimulatedReading {
    pub solar_power_w: f64,
    pub battery_power_w: f64,
    pub load_power_w: f64,
    pub grid_power_w: f64,
    pub battery_soc_percent: f64,
    pub battery_voltage_v: f64,
    pub system_efficiency_percent: f64,
    pub temperature_c: f64,
}

/// Stateful telemetry generator; SOC persists across samples
#[derive(Debug)]
pub struct SimulationEngine {
    params: SimulationParams,
    soc_percent: f64,
    last_sample: Option<DateTime<Local>>,
}

impl SimulationEngine {
    pub fn new(params: SimulationParams) -> Self {
        let soc_percent = params
            .initial_soc_percent
            .clamp(SOC_MIN_PERCENT, SOC_MAX_PERCENT);
        Self {
            params,
            soc_percent,
            last_sample: None,
        }
    }

    pub fn soc_percent(&self) -> f64 {
        self.soc_percent
    }

    /// Generate a sample for the current wall-clock time
    pub fn sample(&mut self) -> SimulatedReading {
        self.sample_at(Local::now())
    }

    /// Generate a sample for an explicit timestamp.
    ///
    /// SOC integration uses the time elapsed since the previous sample;
    /// a backwards clock step contributes zero elapsed time.
    pub fn sample_at(&mut self, now: DateTime<Local>) -> SimulatedReading {
        let elapsed_secs = self
            .last_sample
            .map(|prev| ((now - prev).num_milliseconds() as f64 / 1000.0).max(0.0))
            .unwrap_or(0.0);
        self.last_sample = Some(now);

        let mut rng = rand::thread_rng();

        let solar_power_w = self.solar_power(now, &mut rng);
        let load_power_w = self.load_power(now, &mut rng);
        let battery_power_w = self.battery_power(solar_power_w, load_power_w, elapsed_secs, &mut rng);
        let grid_power_w = load_power_w - solar_power_w - battery_power_w;

        SimulatedReading {
            solar_power_w,
            battery_power_w,
            load_power_w,
            grid_power_w,
            battery_soc_percent: self.soc_percent,
            battery_voltage_v: self.params.battery_voltage_v + rng.gen_range(-0.5..=0.5),
            system_efficiency_percent: self.efficiency(solar_power_w, &mut rng),
            temperature_c: self.temperature(now, &mut rng),
        }
    }

    /// Bell curve peaked at solar noon, attenuated by weather, zero outside
    /// the daylight window
    fn solar_power(&self, now: DateTime<Local>, rng: &mut impl Rng) -> f64 {
        let hour = now.num_seconds_from_midnight() as f64 / 3600.0;
        let start = self.params.daylight_start_hour as f64;
        let end = self.params.daylight_end_hour as f64;
        if hour < start || hour >= end {
            return 0.0;
        }

        let since_sunrise = hour - start;
        let peak_hour = (end - start) / 2.0;
        let hours_from_peak = (since_sunrise - peak_hour).abs();

        let mut factor = (-(hours_from_peak * hours_from_peak) / 8.0).exp();
        factor *= 1.0 + rng.gen_range(-0.1..=0.1);

        let weather =
            rng.gen_range(self.params.weather_factor_min..=self.params.weather_factor_max);

        let power = self.params.max_solar_power_w * factor * weather + rng.gen_range(-50.0..=50.0);
        power.max(0.0)
    }

    /// Base load with morning/evening peaks and a night trough
    fn load_power(&self, now: DateTime<Local>, rng: &mut impl Rng) -> f64 {
        let hour = now.hour();
        let mut load = self.params.base_load_w;

        if (7..=9).contains(&hour) {
            load *= rng.gen_range(1.2..=1.5);
        } else if (18..=22).contains(&hour) {
            load *= rng.gen_range(1.3..=1.8);
        } else if hour >= 22 || hour <= 6 {
            load *= rng.gen_range(0.3..=0.6);
        }

        (load + rng.gen_range(-100.0..=200.0)).max(0.0)
    }

    /// Charge from excess solar, discharge into a deficit; integrates SOC
    /// over elapsed time and clamps it to the working band.
    fn battery_power(
        &mut self,
        solar_power: f64,
        load_power: f64,
        elapsed_secs: f64,
        rng: &mut impl Rng,
    ) -> f64 {
        let excess = solar_power - load_power;
        let capacity_ws =
            self.params.battery_capacity_ah * self.params.battery_voltage_v * 3600.0;

        let power = if excess > 0.0 && self.soc_percent < SOC_MAX_PERCENT {
            let charge = (excess * 0.8).min(MAX_CHARGE_POWER_W);
            let soc_gain = charge * elapsed_secs / capacity_ws * 100.0;
            self.soc_percent = (self.soc_percent + soc_gain).min(SOC_MAX_PERCENT);
            -charge
        } else if excess < 0.0 && self.soc_percent > SOC_MIN_PERCENT {
            let discharge = (excess.abs() * 0.9).min(MAX_DISCHARGE_POWER_W);
            let soc_drop = discharge * elapsed_secs / capacity_ws * 100.0;
            self.soc_percent = (self.soc_percent - soc_drop).max(SOC_MIN_PERCENT);
            discharge
        } else {
            0.0
        };

        power + rng.gen_range(-50.0..=50.0)
    }

    /// Base 85 %, peaking in the mid power band
    fn efficiency(&self, solar_power: f64, rng: &mut impl Rng) -> f64 {
        if solar_power <= 0.0 {
            return 0.0;
        }

        let mut efficiency = 85.0;
        let power_ratio = (solar_power / self.params.max_solar_power_w).min(1.0);
        if (0.3..=0.7).contains(&power_ratio) {
            efficiency += 5.0;
        }

        (efficiency + rng.gen_range(-2.0f64..=2.0)).clamp(0.0, 100.0)
    }

    /// Diurnal sinusoid plus a slow seasonal drift
    fn temperature(&self, now: DateTime<Local>, rng: &mut impl Rng) -> f64 {
        let hour = now.hour() as f64;
        let base = if (6.0..=18.0).contains(&hour) {
            25.0 + 10.0 * ((hour - 6.0) * std::f64::consts::PI / 12.0).sin()
        } else {
            15.0 + 5.0 * ((hour - 18.0) * std::f64::consts::PI / 12.0).sin()
        };

        let day_of_year = now.ordinal() as f64;
        let seasonal = 10.0 * ((day_of_year - 172.0) * 2.0 * std::f64::consts::PI / 365.0).sin();

        base + seasonal + rng.gen_range(-2.0..=2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 21, hour, minute, 0).unwrap()
    }

    fn clear_sky_params() -> SimulationParams {
        SimulationParams {
            weather_factor_min: 1.0,
            weather_factor_max: 1.0,
            ..SimulationParams::default()
        }
    }

    #[test]
    fn solar_is_zero_outside_daylight_window() {
        let mut engine = SimulationEngine::new(clear_sky_params());
        for &(hour, minute) in &[(2, 0), (5, 59), (18, 0), (23, 30)] {
            let reading = engine.sample_at(at(hour, minute));
            assert_eq!(
                reading.solar_power_w, 0.0,
                "expected no production at {:02}:{:02}",
                hour, minute
            );
        }
    }

    #[test]
    fn solar_peaks_near_noon_under_clear_sky() {
        let mut engine = SimulationEngine::new(clear_sky_params());
        let reading = engine.sample_at(at(12, 0));
        // Bell factor is 1.0 at noon; only sample noise remains
        assert!(
            reading.solar_power_w >= 0.85 * 5000.0,
            "noon production too low: {}",
            reading.solar_power_w
        );
        assert!(reading.system_efficiency_percent > 0.0);
    }

    #[test]
    fn soc_stays_in_band_over_long_horizons() {
        let mut engine = SimulationEngine::new(SimulationParams::default());
        // Half-hour steps walk the clock across several days
        let mut now = at(0, 0);
        for _ in 0..1000 {
            let reading = engine.sample_at(now);
            assert!(
                (SOC_MIN_PERCENT..=SOC_MAX_PERCENT).contains(&reading.battery_soc_percent),
                "SOC out of band: {}",
                reading.battery_soc_percent
            );
            now = now + chrono::Duration::minutes(30);
        }
    }

    #[test]
    fn soc_clamped_even_for_huge_time_steps() {
        let mut engine = SimulationEngine::new(SimulationParams {
            initial_soc_percent: 21.0,
            ..clear_sky_params()
        });
        // Night sample forces a discharge over an enormous interval
        engine.sample_at(at(23, 0));
        let reading = engine.sample_at(at(23, 0) + chrono::Duration::days(30));
        assert!(reading.battery_soc_percent >= SOC_MIN_PERCENT);
        assert!(reading.battery_soc_percent <= SOC_MAX_PERCENT);
    }

    #[test]
    fn load_is_never_negative() {
        let mut engine = SimulationEngine::new(SimulationParams::default());
        for hour in 0..24 {
            let reading = engine.sample_at(at(hour, 15));
            assert!(reading.load_power_w >= 0.0);
        }
    }

    #[test]
    fn grid_balances_the_power_flows() {
        let mut engine = SimulationEngine::new(SimulationParams::default());
        let reading = engine.sample_at(at(12, 0));
        let balance =
            reading.load_power_w - reading.solar_power_w - reading.battery_power_w;
        assert!((reading.grid_power_w - balance).abs() < 1e-9);
    }

    #[test]
    fn efficiency_is_zero_without_production() {
        let mut engine = SimulationEngine::new(SimulationParams::default());
        let reading = engine.sample_at(at(3, 0));
        assert_eq!(reading.system_efficiency_percent, 0.0);
    }
}
