// ABOUTME: Unit newtypes and conversion constants for the quantities the solver mixes
// ABOUTME: Keeps hours/seconds and g/m3 vs mg/kg conversions explicit instead of inline factors

use serde::{Deserialize, Serialize};

pub const SECONDS_PER_HOUR: f64 = 3600.0;
pub const SECONDS_PER_DAY: f64 = 86400.0;
pub const GRAMS_PER_KILOGRAM: f64 = 1000.0;

/// Specific weight of water (N/m3), for boundary shear stress.
pub const WATER_SPECIFIC_WEIGHT: f64 = 9810.0;
/// Density of water in solver concentration units (g/m3).
pub const WATER_DENSITY_G_M3: f64 = 1.0e6;

/// Simulation clock time (hours past time zero).
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Hours(pub f64);

/// Integration step length (seconds).
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Seconds(pub f64);

impl Hours {
    #[inline]
    pub fn to_seconds(self) -> Seconds {
        Seconds(self.0 * SECONDS_PER_HOUR)
    }

    #[inline]
    pub fn advanced_by(self, dt: Seconds) -> Hours {
        Hours(self.0 + dt.0 / SECONDS_PER_HOUR)
    }
}

impl Seconds {
    #[inline]
    pub fn to_hours(self) -> Hours {
        Hours(self.0 / SECONDS_PER_HOUR)
    }
}

/// Convert a first-order rate constant given in 1/day to 1/s.
#[inline]
pub fn per_day_to_per_second(k: f64) -> f64 {
    k / SECONDS_PER_DAY
}

/// Convert a load given in kg/day to g/s.
#[inline]
pub fn kg_per_day_to_g_per_second(load: f64) -> f64 {
    load * GRAMS_PER_KILOGRAM / SECONDS_PER_DAY
}

/// Convert a bed concentration from g/m3 of layer volume to mg/kg of dry
/// solids, given the total solids concentration of the layer (g/m3).
/// Used only at the reporting boundary.
#[inline]
pub fn g_m3_to_mg_kg(chem: f64, total_solids: f64) -> f64 {
    if total_solids > 0.0 {
        chem * 1.0e6 / total_solids / GRAMS_PER_KILOGRAM
    } else {
        0.0
    }
}
