//! Moist-air psychrometrics (ASHRAE Handbook Fundamentals, SI units).
//!
//! [`state_from_wet_bulb`] takes dry-bulb and wet-bulb temperatures in Kelvin and total
//! pressure in Pa, matching the units the math controller normalises its inputs into.

const ZERO_CELSIUS_K: f64 = 273.15;
const TRIPLE_POINT_WATER_C: f64 = 0.01;
/// Ratio of molecular weights of water vapour and dry air.
const MOLAR_RATIO: f64 = 0.621945;
const R_DA: f64 = 287.042;
const MIN_HUM_RATIO: f64 = 1e-7;

pub const STANDARD_PRESSURE_PA: f64 = 101_325.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsychroState {
    /// Relative humidity in percent, clamped to [0, 100].
    pub relative_humidity: f64,
    /// kg water / kg dry air.
    pub humidity_ratio: f64,
    /// J/kg dry air.
    pub specific_enthalpy: f64,
    /// m³/kg dry air.
    pub specific_volume: f64,
}

/// Saturation vapour pressure over water (or ice below the triple point), Pa.
pub fn saturation_vapor_pressure(t_c: f64) -> f64 {
    let t = t_c + ZERO_CELSIUS_K;
    let ln_pws = if t_c <= TRIPLE_POINT_WATER_C {
        -5.674_535_9e3 / t + 6.392_524_7 - 9.677_843e-3 * t + 6.221_570_1e-7 * t * t
            + 2.074_782_5e-9 * t.powi(3)
            - 9.484_024e-13 * t.powi(4)
            + 4.163_501_9 * t.ln()
    } else {
        -5.800_220_6e3 / t + 1.391_499_3 - 4.864_023_9e-2 * t + 4.176_476_8e-5 * t * t
            - 1.445_209_3e-8 * t.powi(3)
            + 6.545_967_3 * t.ln()
    };
    ln_pws.exp()
}

fn saturation_humidity_ratio(t_c: f64, pressure: f64) -> f64 {
    let pws = saturation_vapor_pressure(t_c);
    (MOLAR_RATIO * pws / (pressure - pws)).max(MIN_HUM_RATIO)
}

fn humidity_ratio_from_wet_bulb(dry_c: f64, wet_c: f64, pressure: f64) -> f64 {
    let ws_star = saturation_humidity_ratio(wet_c, pressure);
    let w = if wet_c >= TRIPLE_POINT_WATER_C {
        ((2501.0 - 2.326 * wet_c) * ws_star - 1.006 * (dry_c - wet_c))
            / (2501.0 + 1.86 * dry_c - 4.186 * wet_c)
    } else {
        ((2830.0 - 0.24 * wet_c) * ws_star - 1.006 * (dry_c - wet_c))
            / (2830.0 + 1.86 * dry_c - 2.1 * wet_c)
    };
    w.max(MIN_HUM_RATIO)
}

fn vapor_pressure_from_humidity_ratio(w: f64, pressure: f64) -> f64 {
    pressure * w / (MOLAR_RATIO + w)
}

/// Full moist-air state from dry-bulb/wet-bulb temperatures (K) and pressure (Pa).
pub fn state_from_wet_bulb(dry_bulb_k: f64, wet_bulb_k: f64, pressure_pa: f64) -> PsychroState {
    let dry_c = dry_bulb_k - ZERO_CELSIUS_K;
    let wet_c = wet_bulb_k - ZERO_CELSIUS_K;

    let w = humidity_ratio_from_wet_bulb(dry_c, wet_c, pressure_pa);
    let vapor = vapor_pressure_from_humidity_ratio(w, pressure_pa);
    let rh = vapor / saturation_vapor_pressure(dry_c) * 100.0;

    PsychroState {
        relative_humidity: rh.clamp(0.0, 100.0),
        humidity_ratio: w,
        specific_enthalpy: (1.006 * dry_c + w * (2501.0 + 1.86 * dry_c)) * 1000.0,
        specific_volume: R_DA * dry_bulb_k * (1.0 + 1.607_858 * w) / pressure_pa,
    }
}

/// Vapour-pressure deficit in Pa from temperature (°C) and relative humidity (%).
pub fn vapor_pressure_deficit(temperature_c: f64, humidity_pct: f64) -> f64 {
    let svp = 610.78 * 10f64.powf(temperature_c / (temperature_c + 238.3) * 7.5);
    svp - (humidity_pct / 100.0) * svp
}
