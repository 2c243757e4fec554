// ABOUTME: Environmental properties driving kinetics: temperature, pH, DOC, wind, light
// ABOUTME: Piecewise-linear forcings written to dense per-location arrays plus per-cell solar radiation

use crate::engine::core::grid::{Grid, GridMap};
use crate::engine::core::timefunc::TimeFunction;

/// Top-of-atmosphere average solar intensity (W/m2).
const SOLAR_CONSTANT: f64 = 1370.0;
/// Average days per year, counting leap years.
const DAYS_PER_YEAR: f64 = 365.25;
/// Julian day of the summer solstice.
const SOLSTICE_DAY: f64 = 173.0;

/// One forced environmental property: a time function, an optional
/// static spatial multiplier, and the dense per-location values the
/// transport stages read by index.
#[derive(Clone, Debug)]
pub struct EnvField {
    pub function: TimeFunction,
    pub multiplier: Option<Vec<f64>>,
    values: Vec<f64>,
}

impl EnvField {
    pub fn new(function: TimeFunction, n_loc: usize) -> Self {
        let base = function.value(0.0);
        Self {
            function,
            multiplier: None,
            values: vec![base; n_loc],
        }
    }

    pub fn constant(value: f64, n_loc: usize) -> Self {
        Self::new(TimeFunction::constant(value), n_loc)
    }

    /// Advance the cursor and refresh the dense values.
    pub fn update(&mut self, time_hours: f64) {
        self.function.update(time_hours);
        let base = self.function.value(time_hours);
        match &self.multiplier {
            Some(mult) => {
                for (v, m) in self.values.iter_mut().zip(mult) {
                    *v = base * m;
                }
            }
            None => self.values.fill(base),
        }
    }

    #[inline]
    pub fn get(&self, loc: usize) -> f64 {
        self.values[loc]
    }
}

/// The environmental property set for one domain (overland cells or
/// channel nodes).
#[derive(Clone, Debug)]
pub struct EnvProperties {
    /// Air temperature (deg C), for snowfall partitioning and melt.
    pub air_temp: EnvField,
    /// Water column temperature (deg C).
    pub water_temp: EnvField,
    /// Soil or sediment bed temperature (deg C).
    pub bed_temp: EnvField,
    /// Dissolved organic carbon (g/m3).
    pub doc: EnvField,
    pub ph: EnvField,
    pub hardness: EnvField,
    /// Oxidant/radical concentration (g/m3).
    pub oxidant: EnvField,
    /// Bacterial count for second-order biodegradation.
    pub bacteria: EnvField,
    /// Light extinction coefficient (1/m).
    pub extinction: EnvField,
    /// User-defined reaction property.
    pub user: EnvField,
    /// Wind speed (m/s).
    pub wind: EnvField,
    /// Cloud cover (0-1).
    pub cloud: EnvField,
}

impl EnvProperties {
    pub fn defaults(n_loc: usize) -> Self {
        Self {
            air_temp: EnvField::constant(20.0, n_loc),
            water_temp: EnvField::constant(20.0, n_loc),
            bed_temp: EnvField::constant(15.0, n_loc),
            doc: EnvField::constant(0.0, n_loc),
            ph: EnvField::constant(7.0, n_loc),
            hardness: EnvField::constant(100.0, n_loc),
            oxidant: EnvField::constant(0.0, n_loc),
            bacteria: EnvField::constant(0.0, n_loc),
            extinction: EnvField::constant(1.0, n_loc),
            user: EnvField::constant(0.0, n_loc),
            wind: EnvField::constant(0.0, n_loc),
            cloud: EnvField::constant(0.0, n_loc),
        }
    }

    pub fn update(&mut self, time_hours: f64) {
        self.air_temp.update(time_hours);
        self.water_temp.update(time_hours);
        self.bed_temp.update(time_hours);
        self.doc.update(time_hours);
        self.ph.update(time_hours);
        self.hardness.update(time_hours);
        self.oxidant.update(time_hours);
        self.bacteria.update(time_hours);
        self.extinction.update(time_hours);
        self.user.update(time_hours);
        self.wind.update(time_hours);
        self.cloud.update(time_hours);
    }
}

/// Environmental state for both domains plus solar radiation.
#[derive(Clone, Debug)]
pub struct EnvironmentState {
    pub overland: EnvProperties,
    pub channel: EnvProperties,
    /// Particulate organic carbon fraction per solids fraction.
    pub fpoc: Vec<f64>,
    /// Incident solar radiation per cell (W/m2).
    pub solar: GridMap<f64>,
    /// Geographic latitude of the domain center (degrees).
    pub latitude: f64,
    /// Decimal julian day at simulation time zero.
    pub tzero: f64,
}

impl EnvironmentState {
    pub fn new(grid: &Grid, n_nodes: usize, n_fractions: usize, latitude: f64, tzero: f64) -> Self {
        Self {
            overland: EnvProperties::defaults(grid.cell_count()),
            channel: EnvProperties::defaults(n_nodes.max(1)),
            fpoc: vec![0.0; n_fractions],
            solar: GridMap::new(grid.rows, grid.cols, 0.0),
            latitude,
            tzero,
        }
    }

    /// Advance every property cursor and recompute solar radiation.
    pub fn update(&mut self, grid: &Grid, time_hours: f64) {
        self.overland.update(time_hours);
        self.channel.update(time_hours);
        self.update_solar(grid, time_hours);
    }

    /// Shortwave solar radiation near the land surface from standard
    /// astronomical geometry: declination about the summer solstice,
    /// hour angle, zenith and solar azimuth, terrain slope and aspect
    /// incidence, cloud-dependent transmissivities, and sky view.
    pub fn update_solar(&mut self, grid: &Grid, time_hours: f64) {
        let mut jday = self.tzero + time_hours / 24.0;
        while jday > DAYS_PER_YEAR {
            jday -= DAYS_PER_YEAR;
        }
        let hour = (jday - jday.floor()) * 24.0;

        let pi = std::f64::consts::PI;
        let deg = pi / 180.0;
        let declination = 0.41 * (2.0 * pi * (jday - SOLSTICE_DAY) / DAYS_PER_YEAR).cos();
        let hangle = (hour * 15.0 - 180.0) * deg;
        let lat = self.latitude * deg;

        let mut cosz = declination.sin() * lat.sin() + declination.cos() * lat.cos() * hangle.cos();
        if cosz < 0.0 {
            cosz = 0.0;
        }
        let sinz = (1.0 - cosz * cosz).sqrt();

        // solar azimuth with due south as the origin; corrected so angles
        // below the local horizon measure from the normal to the slope
        let mut azsun = if sinz > 0.0 {
            (declination.cos() * hangle.sin() / sinz).clamp(-1.0, 1.0).asin()
        } else {
            0.0
        };
        if hangle < 0.0 {
            if hangle < azsun {
                azsun = -pi - azsun;
            }
        } else if hangle > 0.0 && hangle > azsun {
            azsun = pi - azsun;
        }

        for (r, c) in grid.iter_domain() {
            let aspect = grid.aspect.get(r, c);
            // convert aspect (north origin) to slope azimuth (south origin)
            let azslope = if aspect >= 180.0 {
                aspect - 180.0
            } else {
                aspect + 180.0
            };

            let slope = grid.slope.get(r, c).atan();
            let mut cosi = slope.cos() * cosz + slope.sin() * sinz * (azsun - azslope * deg).cos();
            if cosi < 0.0 || cosz <= 0.0 {
                cosi = 0.0;
            }

            let cloud = self.overland.cloud.get(grid.index(r, c)).clamp(0.0, 1.0);
            let psi_direct = (0.6 + 0.2 * cosz) * (1.0 - cloud);
            let psi_diffuse = (0.3 + 0.1 * cosz) * cloud;
            // canopy transmissivity folded into the sky view factor
            let psi_cover = 0.0;

            let qsi_direct = cosi * psi_direct * SOLAR_CONSTANT;
            let qsi_diffuse = cosz * psi_diffuse * SOLAR_CONSTANT;

            let sky = grid.sky_view.get(r, c);
            self.solar.set(
                r,
                c,
                ((1.0 - sky) * psi_cover + sky) * (qsi_direct + qsi_diffuse),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_field_updates_dense_values() {
        let f = TimeFunction::new(vec![0.0, 2.0], vec![10.0, 30.0]).unwrap();
        let mut field = EnvField::new(f, 3);
        field.update(1.0);
        assert!((field.get(0) - 20.0).abs() < 1.0e-12);
        assert!((field.get(2) - 20.0).abs() < 1.0e-12);
    }

    #[test]
    fn test_env_field_multiplier() {
        let mut field = EnvField::constant(10.0, 2);
        field.multiplier = Some(vec![1.0, 0.5]);
        field.update(0.0);
        assert_eq!(field.get(0), 10.0);
        assert_eq!(field.get(1), 5.0);
    }

    #[test]
    fn test_solar_zero_at_night() {
        let grid = Grid::uniform(1, 1, 100.0, 0.0);
        // midnight at time zero on a mid-latitude midsummer day
        let mut env = EnvironmentState::new(&grid, 0, 0, 40.0, 173.0);
        env.update_solar(&grid, 0.0);
        assert_eq!(env.solar.get(0, 0), 0.0);
    }

    #[test]
    fn test_solar_positive_at_noon() {
        let grid = Grid::uniform(1, 1, 100.0, 0.0);
        let mut env = EnvironmentState::new(&grid, 0, 0, 40.0, 173.0);
        env.update_solar(&grid, 12.0);
        let noon = env.solar.get(0, 0);
        assert!(noon > 500.0, "noon radiation {} too low", noon);
        // full cloud cover kills the direct beam
        env.overland.cloud = EnvField::constant(1.0, 1);
        env.overland.cloud.update(12.0);
        env.update_solar(&grid, 12.0);
        assert!(env.solar.get(0, 0) < noon);
    }

    #[test]
    fn test_solar_reduced_by_sky_view() {
        let mut grid = Grid::uniform(1, 2, 100.0, 0.0);
        grid.sky_view.set(0, 1, 0.5);
        let mut env = EnvironmentState::new(&grid, 0, 0, 40.0, 173.0);
        env.update_solar(&grid, 12.0);
        assert!(env.solar.get(0, 1) < env.solar.get(0, 0));
    }
}
