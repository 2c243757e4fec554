// ABOUTME: Solids (sediment) fraction properties and water-column concentration state
// ABOUTME: Bundles the per-process flux/mass ledgers for the overland plane and channels

use serde::{Deserialize, Serialize};

use crate::engine::massbalance::{LayerLedger, SourceLedger};

/// One particle class with fixed size, density, and settling behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolidsFraction {
    pub name: String,
    /// Mean particle diameter (m).
    pub diameter: f64,
    /// Quiescent settling velocity omega (m/s).
    pub settling_velocity: f64,
    pub specific_gravity: f64,
    /// Dimensionless particle diameter.
    #[serde(default)]
    pub dstar: f64,
    /// Cohesive sediments erode by excess shear; non-cohesive by
    /// transport capacity.
    #[serde(default)]
    pub cohesive: bool,
    /// Critical shear stress for deposition (N/m2); 0 disables the
    /// probability-of-deposition correction.
    #[serde(default)]
    pub tau_cd: f64,
    /// Critical shear stress for erosion (N/m2).
    #[serde(default)]
    pub tau_ce: f64,
    /// Erodibility aging rate (1/h) applied since the last shear peak.
    #[serde(default)]
    pub aging_rate: f64,
    /// Reporting group this fraction folds into.
    #[serde(default)]
    pub group: usize,
}

/// How a soil or sediment type erodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErosionScheme {
    /// Rainfall-driven soil loss (overland only).
    Usle,
    /// Excess shear above the fraction's critical stress.
    #[default]
    ExcessShear,
    /// Relaxation toward a stream-power transport capacity.
    TransportCapacity,
}

/// Soil or channel-bed material class: erosion and infiltration
/// properties shared by every cell or node of the type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BedMaterial {
    pub name: String,
    #[serde(default)]
    pub erosion_scheme: ErosionScheme,
    pub porosity: f64,
    /// USLE soil erodibility K, for rainfall-driven overland erosion.
    #[serde(default)]
    pub usle_k: f64,
    /// Excess-shear erosion yield coefficient a_y (g/m2/s at unit
    /// excess).
    #[serde(default)]
    pub erosion_yield: f64,
    /// Excess-shear erosion intensity exponent m.
    #[serde(default = "default_erosion_exponent")]
    pub erosion_exponent: f64,
    /// Transport-capacity coefficient for non-cohesive erosion.
    #[serde(default)]
    pub transport_capacity_coeff: f64,
    /// Green-Ampt saturated hydraulic conductivity (m/s).
    #[serde(default)]
    pub hydraulic_conductivity: f64,
    /// Green-Ampt capillary suction head (m).
    #[serde(default)]
    pub capillary_suction: f64,
    /// Green-Ampt soil moisture deficit (-).
    #[serde(default)]
    pub moisture_deficit: f64,
}

fn default_erosion_exponent() -> f64 {
    1.0
}

/// Concentration field over (series, location), in g/m3.
#[derive(Clone, Debug)]
pub struct SeriesField {
    data: Vec<f64>,
    n_series: usize,
    n_loc: usize,
}

impl SeriesField {
    pub fn new(n_series: usize, n_loc: usize) -> Self {
        Self {
            data: vec![0.0; n_series * n_loc],
            n_series,
            n_loc,
        }
    }

    #[inline]
    pub fn get(&self, series: usize, loc: usize) -> f64 {
        debug_assert!(series < self.n_series && loc < self.n_loc);
        self.data[series * self.n_loc + loc]
    }

    #[inline]
    pub fn set(&mut self, series: usize, loc: usize, value: f64) {
        debug_assert!(series < self.n_series && loc < self.n_loc);
        self.data[series * self.n_loc + loc] = value;
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    pub fn n_series(&self) -> usize {
        self.n_series
    }

    pub fn n_loc(&self) -> usize {
        self.n_loc
    }
}

/// Double-buffered concentration state: fluxes read `current`, balances
/// write `next`, and the state advance swaps them.
#[derive(Clone, Debug)]
pub struct BufferedField {
    pub current: SeriesField,
    pub next: SeriesField,
}

impl BufferedField {
    pub fn new(n_series: usize, n_loc: usize) -> Self {
        Self {
            current: SeriesField::new(n_series, n_loc),
            next: SeriesField::new(n_series, n_loc),
        }
    }

    pub fn advance(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
    }
}

/// The per-process ledgers for solids in one domain (overland plane or
/// channel network).
#[derive(Clone, Debug)]
pub struct SolidsLedgers {
    /// Advection, by source channel.
    pub adv: SourceLedger,
    /// Dispersion, by source channel.
    pub dsp: SourceLedger,
    /// Point and distributed loads, charged at the point slot.
    pub load: SourceLedger,
    /// Deposition (water column to surface layer), by layer.
    pub dep: LayerLedger,
    /// Erosion (surface layer to water column), by layer.
    pub ers: LayerLedger,
    /// Burial from stack pushes and collapses, by layer.
    pub bur: LayerLedger,
    /// Scour from stack pops, by layer.
    pub scr: LayerLedger,
    /// Transformation losses (dissolution of a pure-phase fraction).
    pub tns: LayerLedger,
}

impl SolidsLedgers {
    pub fn new(n_series: usize, n_loc: usize, n_layers: usize) -> Self {
        Self {
            adv: SourceLedger::new(n_series, n_loc),
            dsp: SourceLedger::new(n_series, n_loc),
            load: SourceLedger::new(n_series, n_loc),
            dep: LayerLedger::new(n_series, n_loc, n_layers),
            ers: LayerLedger::new(n_series, n_loc, n_layers),
            bur: LayerLedger::new(n_series, n_loc, n_layers),
            scr: LayerLedger::new(n_series, n_loc, n_layers),
            tns: LayerLedger::new(n_series, n_loc, n_layers),
        }
    }

    pub fn clear_fluxes(&mut self) {
        self.adv.clear_fluxes();
        self.dsp.clear_fluxes();
        self.load.clear_fluxes();
        self.dep.clear_fluxes();
        self.ers.clear_fluxes();
        self.scr.clear_fluxes();
        // tns is written by the chemical stage, which runs after the
        // solids balance: its rates apply one step later and are cleared
        // there, not here. Burial moves mass instantaneously in the
        // re-indexing pass and has no rate terms to clear.
    }

    pub fn settle(&mut self, dt_seconds: f64) {
        self.adv.settle(dt_seconds);
        self.dsp.settle(dt_seconds);
        self.load.settle(dt_seconds);
        self.dep.settle(dt_seconds);
        self.ers.settle(dt_seconds);
        self.scr.settle(dt_seconds);
        self.tns.settle(dt_seconds);
    }
}

/// Erodibility aging state: the running shear peak per location and the
/// time it occurred, for the excess-shear decay factor.
#[derive(Clone, Debug)]
pub struct AgingState {
    pub peak_shear: Vec<f64>,
    pub peak_time: Vec<f64>,
}

impl AgingState {
    pub fn new(n_loc: usize) -> Self {
        Self {
            peak_shear: vec![0.0; n_loc],
            peak_time: vec![0.0; n_loc],
        }
    }

    /// Track the running shear peak at a location.
    pub fn update_peak(&mut self, loc: usize, shear: f64, time_hours: f64) {
        if shear >= self.peak_shear[loc] {
            self.peak_shear[loc] = shear;
            self.peak_time[loc] = time_hours;
        }
    }

    /// Erodibility decay factor for one fraction's aging rate: 1 at a
    /// fresh peak, decaying with hours elapsed since it.
    pub fn factor(&self, loc: usize, aging_rate: f64, time_hours: f64) -> f64 {
        if aging_rate <= 0.0 {
            return 1.0;
        }
        (-aging_rate * (time_hours - self.peak_time[loc]).max(0.0)).exp()
    }
}

/// Complete solids state: fractions, water-column concentrations for
/// both domains, ledgers, and aging state. Bed concentrations live in
/// the stack columns.
#[derive(Clone, Debug)]
pub struct SolidsState {
    pub fractions: Vec<SolidsFraction>,
    /// Overland water-column concentrations (g/m3).
    pub conc_ov: BufferedField,
    /// Channel water-column concentrations (g/m3).
    pub conc_ch: BufferedField,
    pub ledgers_ov: SolidsLedgers,
    pub ledgers_ch: SolidsLedgers,
    pub aging_ov: AgingState,
    pub aging_ch: AgingState,
}

impl SolidsState {
    pub fn new(
        fractions: Vec<SolidsFraction>,
        n_cells: usize,
        n_nodes: usize,
        n_layers: usize,
    ) -> Self {
        let n = fractions.len();
        Self {
            fractions,
            conc_ov: BufferedField::new(n, n_cells),
            conc_ch: BufferedField::new(n, n_nodes),
            ledgers_ov: SolidsLedgers::new(n, n_cells, n_layers),
            ledgers_ch: SolidsLedgers::new(n, n_nodes, n_layers),
            aging_ov: AgingState::new(n_cells),
            aging_ch: AgingState::new(n_nodes),
        }
    }

    pub fn n_fractions(&self) -> usize {
        self.fractions.len()
    }

    pub fn advance(&mut self) {
        self.conc_ov.advance();
        self.conc_ch.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_field_indexing() {
        let mut field = SeriesField::new(2, 3);
        field.set(1, 2, 42.0);
        assert_eq!(field.get(1, 2), 42.0);
        assert_eq!(field.get(0, 2), 0.0);
    }

    #[test]
    fn test_buffered_field_advance() {
        let mut field = BufferedField::new(1, 1);
        field.next.set(0, 0, 5.0);
        field.advance();
        assert_eq!(field.current.get(0, 0), 5.0);
    }

    #[test]
    fn test_aging_decay_after_peak() {
        let mut aging = AgingState::new(1);
        aging.update_peak(0, 2.0, 0.0);
        assert_eq!(aging.factor(0, 0.5, 0.0), 1.0);
        // falling shear one hour after the peak decays the erodibility
        aging.update_peak(0, 1.0, 1.0);
        let f = aging.factor(0, 0.5, 1.0);
        assert!((f - (-0.5f64).exp()).abs() < 1.0e-12);
        // a fresh peak resets the clock
        aging.update_peak(0, 3.0, 2.0);
        assert_eq!(aging.factor(0, 0.5, 2.0), 1.0);
        // zero rate disables aging entirely
        assert_eq!(aging.factor(0, 0.0, 10.0), 1.0);
    }
}
