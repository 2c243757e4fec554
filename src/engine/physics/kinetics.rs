// ABOUTME: Chemical reaction kernels: biodegradation, hydrolysis, oxidation, photolysis,
// ABOUTME: radioactive decay, volatilization, user-defined, dissolution, and yield routing

use serde::{Deserialize, Serialize};

use crate::engine::core::stack::StackColumn;
use crate::engine::core::units::per_day_to_per_second;
use crate::engine::massbalance::LayerLedger;
use crate::engine::physics::chemical::{ChemicalLedgers, ChemicalSpecies, PhaseState};
use crate::engine::physics::solids::SeriesField;

/// The closed set of kinetic process kinds, used to route yields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionProcess {
    Biodegradation,
    Hydrolysis,
    Oxidation,
    Photolysis,
    RadioactiveDecay,
    Volatilization,
    UserDefined,
    Dissolution,
}

const PROCESS_COUNT: usize = 8;

impl ReactionProcess {
    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// One kinetic reaction a species participates in. Rate constants are
/// per day; lengths are meters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reaction {
    /// First-order decay, or second-order against the bacterial count.
    Biodegradation {
        k_water: f64,
        k_bed: f64,
        #[serde(default)]
        second_order: bool,
    },
    /// Acid/neutral/base pH-weighted, temperature-corrected by theta.
    Hydrolysis {
        k_acid: f64,
        k_neutral: f64,
        k_base: f64,
        #[serde(default = "default_theta")]
        theta: f64,
    },
    /// Second-order against the oxidant/radical concentration.
    Oxidation { k_ox: f64 },
    /// Depth-integrated with light extinction; k applies at the
    /// reference surface radiation.
    Photolysis {
        k_surface: f64,
        reference_radiation: f64,
    },
    /// First-order on all phases in every layer.
    RadioactiveDecay { k_decay: f64 },
    /// Two-film transfer with Henry's law. Film conductances are m/day;
    /// the gas film scales linearly with wind speed relative to 1 m/s.
    Volatilization {
        henry: f64,
        k_liquid: f64,
        k_gas: f64,
        #[serde(default = "default_theta")]
        theta: f64,
    },
    /// Arbitrary kernel driven by the user environmental property.
    UserDefined { k_user: f64 },
    /// Mass transfer from a pure-phase solids fraction to the dissolved
    /// phase at k_dsl*(C_sat - C_d).
    Dissolution {
        from_fraction: usize,
        k_water: f64,
        k_bed: f64,
        solubility: f64,
    },
}

fn default_theta() -> f64 {
    1.0
}

impl Reaction {
    pub fn process(&self) -> ReactionProcess {
        match self {
            Reaction::Biodegradation { .. } => ReactionProcess::Biodegradation,
            Reaction::Hydrolysis { .. } => ReactionProcess::Hydrolysis,
            Reaction::Oxidation { .. } => ReactionProcess::Oxidation,
            Reaction::Photolysis { .. } => ReactionProcess::Photolysis,
            Reaction::RadioactiveDecay { .. } => ReactionProcess::RadioactiveDecay,
            Reaction::Volatilization { .. } => ReactionProcess::Volatilization,
            Reaction::UserDefined { .. } => ReactionProcess::UserDefined,
            Reaction::Dissolution { .. } => ReactionProcess::Dissolution,
        }
    }
}

/// Stoichiometric conversion of one species to another when the source
/// is consumed by a given process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChemicalYield {
    pub from_species: usize,
    pub to_species: usize,
    pub process: ReactionProcess,
    /// Product mass per unit reacted mass (g/g).
    pub yield_factor: f64,
}

/// Environmental values at one location, snapshotted for the kernels.
#[derive(Clone, Copy, Debug)]
pub struct EnvSnapshot {
    pub water_temp: f64,
    pub bed_temp: f64,
    pub ph: f64,
    pub doc: f64,
    pub oxidant: f64,
    pub bacteria: f64,
    pub extinction: f64,
    pub user: f64,
    pub wind: f64,
    /// Incident solar radiation (W/m2).
    pub radiation: f64,
}

/// Reusable per-location scratch holding each species' process loss
/// rates by layer, for yield routing.
#[derive(Clone, Debug)]
pub struct KineticsScratch {
    rates: Vec<f64>,
    n_layers: usize,
}

impl KineticsScratch {
    pub fn new(n_species: usize, n_layers: usize) -> Self {
        Self {
            rates: vec![0.0; n_species * PROCESS_COUNT * n_layers],
            n_layers,
        }
    }

    #[inline]
    fn idx(&self, species: usize, process: ReactionProcess, layer: usize) -> usize {
        (species * PROCESS_COUNT + process.index()) * self.n_layers + layer
    }

    fn reset(&mut self) {
        self.rates.fill(0.0);
    }

    fn record(&mut self, species: usize, process: ReactionProcess, layer: usize, rate: f64) {
        let i = self.idx(species, process, layer);
        self.rates[i] += rate;
    }

    fn rate(&self, species: usize, process: ReactionProcess, layer: usize) -> f64 {
        self.rates[self.idx(species, process, layer)]
    }
}

/// Update the cached phase fractions for one column: layer 0 from the
/// water-column solids, layers 1..=nstack from the stack layers.
#[allow(clippy::too_many_arguments)]
pub fn update_column_phases(
    species: &[ChemicalSpecies],
    loc: usize,
    water_solids: &SeriesField,
    stack: &StackColumn,
    doc: f64,
    fpoc: &[f64],
    phases: &mut PhaseState,
) {
    let n_fractions = fpoc.len();
    let mut solids: Vec<f64> = (0..n_fractions)
        .map(|f| water_solids.get(f, loc))
        .collect();
    for (s, sp) in species.iter().enumerate() {
        let split = super::chemical::partition(sp, doc, &solids, fpoc);
        phases.store(s, loc, 0, &split);
    }
    for k in 1..=stack.nstack() {
        let layer = stack.layer(k);
        solids.copy_from_slice(&layer.solids);
        for (s, sp) in species.iter().enumerate() {
            let split = super::chemical::partition(sp, doc, &solids, fpoc);
            phases.store(s, loc, k, &split);
        }
    }
}

/// Depth-averaged light attenuation factor (1 - e^(-k h)) / (k h).
fn light_attenuation(extinction: f64, depth: f64) -> f64 {
    let kh = extinction * depth;
    if kh > 1.0e-6 {
        (1.0 - (-kh).exp()) / kh
    } else {
        1.0
    }
}

/// Arrhenius-style temperature correction about 20 degrees C.
fn theta_correction(theta: f64, temp: f64) -> f64 {
    if theta > 0.0 && theta != 1.0 {
        theta.powf(temp - 20.0)
    } else {
        1.0
    }
}

/// Run every reaction for every species over one column (water column
/// plus active stack layers), charging the process ledgers and routing
/// yields. All rates are computed from current-state concentrations.
#[allow(clippy::too_many_arguments)]
pub fn apply_column_kinetics(
    species: &[ChemicalSpecies],
    loc: usize,
    water_depth: f64,
    surface_area: f64,
    water_conc: &SeriesField,
    water_solids: &SeriesField,
    stack: &StackColumn,
    phases: &PhaseState,
    env: &EnvSnapshot,
    yields: &[ChemicalYield],
    dt: f64,
    ledgers: &mut ChemicalLedgers,
    solids_tns: &mut LayerLedger,
    scratch: &mut KineticsScratch,
) {
    scratch.reset();
    let water_volume = water_depth * surface_area;
    let wet = water_depth > 1.0e-8;

    for (s, sp) in species.iter().enumerate() {
        for reaction in &sp.reactions {
            match *reaction {
                Reaction::Biodegradation {
                    k_water,
                    k_bed,
                    second_order,
                } => {
                    if wet {
                        let mut k = per_day_to_per_second(k_water);
                        if second_order {
                            k *= env.bacteria;
                        }
                        let c = water_conc.get(s, loc);
                        let rate = k * phases.mobile(s, loc, 0) * c * water_volume;
                        if rate > 0.0 {
                            ledgers.bio.add_outflux(s, loc, 0, rate);
                            scratch.record(s, ReactionProcess::Biodegradation, 0, rate);
                        }
                    }
                    for k_layer in 1..=stack.nstack() {
                        let layer = stack.layer(k_layer);
                        let rate =
                            per_day_to_per_second(k_bed) * layer.chems[s] * layer.volume;
                        if rate > 0.0 {
                            ledgers.bio.add_outflux(s, loc, k_layer, rate);
                            scratch.record(s, ReactionProcess::Biodegradation, k_layer, rate);
                        }
                    }
                }

                Reaction::Hydrolysis {
                    k_acid,
                    k_neutral,
                    k_base,
                    theta,
                } => {
                    let h_ion = 10.0f64.powf(-env.ph);
                    let oh_ion = 10.0f64.powf(env.ph - 14.0);
                    let kh = k_acid * h_ion + k_neutral + k_base * oh_ion;
                    if wet {
                        let k = per_day_to_per_second(kh)
                            * theta_correction(theta, env.water_temp);
                        let rate = k
                            * phases.dissolved(s, loc, 0)
                            * water_conc.get(s, loc)
                            * water_volume;
                        if rate > 0.0 {
                            ledgers.hyd.add_outflux(s, loc, 0, rate);
                            scratch.record(s, ReactionProcess::Hydrolysis, 0, rate);
                        }
                    }
                    let k_bed = per_day_to_per_second(kh) * theta_correction(theta, env.bed_temp);
                    for k_layer in 1..=stack.nstack() {
                        let layer = stack.layer(k_layer);
                        let rate = k_bed
                            * phases.dissolved(s, loc, k_layer)
                            * layer.chems[s]
                            * layer.volume;
                        if rate > 0.0 {
                            ledgers.hyd.add_outflux(s, loc, k_layer, rate);
                            scratch.record(s, ReactionProcess::Hydrolysis, k_layer, rate);
                        }
                    }
                }

                Reaction::Oxidation { k_ox } => {
                    let k = per_day_to_per_second(k_ox) * env.oxidant;
                    if wet {
                        let rate = k
                            * phases.dissolved(s, loc, 0)
                            * water_conc.get(s, loc)
                            * water_volume;
                        if rate > 0.0 {
                            ledgers.oxi.add_outflux(s, loc, 0, rate);
                            scratch.record(s, ReactionProcess::Oxidation, 0, rate);
                        }
                    }
                    for k_layer in 1..=stack.nstack() {
                        let layer = stack.layer(k_layer);
                        let rate = k
                            * phases.dissolved(s, loc, k_layer)
                            * layer.chems[s]
                            * layer.volume;
                        if rate > 0.0 {
                            ledgers.oxi.add_outflux(s, loc, k_layer, rate);
                            scratch.record(s, ReactionProcess::Oxidation, k_layer, rate);
                        }
                    }
                }

                Reaction::Photolysis {
                    k_surface,
                    reference_radiation,
                } => {
                    // photolysis reaches the water column only, at the
                    // same rate for every phase
                    if wet && env.radiation > 0.0 && reference_radiation > 0.0 {
                        let k = per_day_to_per_second(k_surface)
                            * (env.radiation / reference_radiation)
                            * light_attenuation(env.extinction, water_depth);
                        let rate = k * water_conc.get(s, loc) * water_volume;
                        if rate > 0.0 {
                            ledgers.pht.add_outflux(s, loc, 0, rate);
                            scratch.record(s, ReactionProcess::Photolysis, 0, rate);
                        }
                    }
                }

                Reaction::RadioactiveDecay { k_decay } => {
                    let k = per_day_to_per_second(k_decay);
                    if wet {
                        let rate = k * water_conc.get(s, loc) * water_volume;
                        if rate > 0.0 {
                            ledgers.rad.add_outflux(s, loc, 0, rate);
                            scratch.record(s, ReactionProcess::RadioactiveDecay, 0, rate);
                        }
                    }
                    for k_layer in 1..=stack.nstack() {
                        let layer = stack.layer(k_layer);
                        let rate = k * layer.chems[s] * layer.volume;
                        if rate > 0.0 {
                            ledgers.rad.add_outflux(s, loc, k_layer, rate);
                            scratch.record(s, ReactionProcess::RadioactiveDecay, k_layer, rate);
                        }
                    }
                }

                Reaction::Volatilization {
                    henry,
                    k_liquid,
                    k_gas,
                    theta,
                } => {
                    if wet && henry > 0.0 && k_liquid > 0.0 && k_gas > 0.0 {
                        let kl = per_day_to_per_second(k_liquid)
                            * theta_correction(theta, env.water_temp);
                        let kg = per_day_to_per_second(k_gas) * env.wind.max(0.1);
                        let kv = 1.0 / (1.0 / kl + 1.0 / (kg * henry));
                        let rate = kv
                            * surface_area
                            * phases.dissolved(s, loc, 0)
                            * water_conc.get(s, loc);
                        if rate > 0.0 {
                            ledgers.vlt.add_outflux(s, loc, 0, rate);
                            scratch.record(s, ReactionProcess::Volatilization, 0, rate);
                        }
                    }
                }

                Reaction::UserDefined { k_user } => {
                    let k = per_day_to_per_second(k_user) * env.user;
                    if k > 0.0 {
                        if wet {
                            let rate = k * water_conc.get(s, loc) * water_volume;
                            ledgers.udr.add_outflux(s, loc, 0, rate);
                            scratch.record(s, ReactionProcess::UserDefined, 0, rate);
                        }
                        for k_layer in 1..=stack.nstack() {
                            let layer = stack.layer(k_layer);
                            let rate = k * layer.chems[s] * layer.volume;
                            if rate > 0.0 {
                                ledgers.udr.add_outflux(s, loc, k_layer, rate);
                                scratch.record(s, ReactionProcess::UserDefined, k_layer, rate);
                            }
                        }
                    }
                }

                Reaction::Dissolution {
                    from_fraction,
                    k_water,
                    k_bed,
                    solubility,
                } => {
                    // pure-phase solid to dissolved species; the solid is
                    // consumed through the solids transformation ledger
                    if wet {
                        let deficit =
                            (solubility - phases.dissolved(s, loc, 0) * water_conc.get(s, loc))
                                .max(0.0);
                        let mut rate = per_day_to_per_second(k_water) * surface_area * deficit;
                        let available = water_solids.get(from_fraction, loc) * water_volume;
                        rate = rate.min(available / dt);
                        if rate > 0.0 {
                            ledgers.dsl.add_influx(s, loc, 0, rate);
                            solids_tns.add_outflux(from_fraction, loc, 0, rate);
                            scratch.record(s, ReactionProcess::Dissolution, 0, rate);
                        }
                    }
                    for k_layer in 1..=stack.nstack() {
                        let layer = stack.layer(k_layer);
                        let dissolved =
                            phases.dissolved(s, loc, k_layer) * layer.chems[s];
                        let deficit = (solubility - dissolved).max(0.0);
                        let mut rate = per_day_to_per_second(k_bed) * layer.area * deficit;
                        let available = layer.solids[from_fraction] * layer.volume;
                        rate = rate.min(available / dt);
                        if rate > 0.0 {
                            ledgers.dsl.add_influx(s, loc, k_layer, rate);
                            solids_tns.add_outflux(from_fraction, loc, k_layer, rate);
                            scratch.record(s, ReactionProcess::Dissolution, k_layer, rate);
                        }
                    }
                }
            }
        }
    }

    // route yields: product influx proportional to the reacted rate of
    // the source species through the named process
    for y in yields {
        for layer in 0..=stack.nstack() {
            let reacted = scratch.rate(y.from_species, y.process, layer);
            if reacted > 0.0 {
                ledgers
                    .yld
                    .add_influx(y.to_species, loc, layer, y.yield_factor * reacted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::core::stack::Layer;
    use crate::engine::physics::chemical::ChemicalLedgers;

    fn still_pond_setup() -> (
        Vec<ChemicalSpecies>,
        SeriesField,
        SeriesField,
        StackColumn,
        PhaseState,
        ChemicalLedgers,
        LayerLedger,
        KineticsScratch,
    ) {
        let species = vec![ChemicalSpecies {
            name: "x".to_string(),
            kb: 0.0,
            kp: 0.0,
            koc: 0.0,
            nux: 0.0,
            fdoc_effect: 1.0,
            reactions: vec![],
            group: 0,
        }];
        let mut water_conc = SeriesField::new(1, 1);
        water_conc.set(0, 0, 100.0);
        let water_solids = SeriesField::new(1, 1);
        let stack = StackColumn::new(
            vec![Layer::spec(0.1, 100.0, 10.0, 0.4, vec![1.0e5], vec![5.0])],
            0.0,
            3,
            0.5,
            1.5,
        );
        let phases = PhaseState::new(1, 1, 4, 1);
        let ledgers = ChemicalLedgers::new(1, 1, 4);
        let tns = LayerLedger::new(1, 1, 4);
        let scratch = KineticsScratch::new(1, 4);
        (
            species,
            water_conc,
            water_solids,
            stack,
            phases,
            ledgers,
            tns,
            scratch,
        )
    }

    fn env() -> EnvSnapshot {
        EnvSnapshot {
            water_temp: 20.0,
            bed_temp: 20.0,
            ph: 7.0,
            doc: 0.0,
            oxidant: 0.0,
            bacteria: 0.0,
            extinction: 1.0,
            user: 0.0,
            wind: 1.0,
            radiation: 0.0,
        }
    }

    #[test]
    fn test_first_order_biodegradation_rate() {
        let (mut species, water_conc, water_solids, stack, phases, mut ledgers, mut tns, mut scratch) =
            still_pond_setup();
        species[0].reactions.push(Reaction::Biodegradation {
            k_water: 0.864,
            k_bed: 0.0,
            second_order: false,
        });
        apply_column_kinetics(
            &species, 0, 1.0, 100.0, &water_conc, &water_solids, &stack, &phases, &env(),
            &[], 10.0, &mut ledgers, &mut tns, &mut scratch,
        );
        // k = 0.864/day = 1e-5 /s on 100 g/m3 * 100 m3
        let expected = 1.0e-5 * 100.0 * 100.0;
        assert!((ledgers.bio.outflux(0, 0, 0) - expected).abs() < 1.0e-9);
    }

    #[test]
    fn test_radioactive_decay_reaches_bed_layers() {
        let (mut species, water_conc, water_solids, stack, phases, mut ledgers, mut tns, mut scratch) =
            still_pond_setup();
        species[0]
            .reactions
            .push(Reaction::RadioactiveDecay { k_decay: 0.0864 });
        apply_column_kinetics(
            &species, 0, 1.0, 100.0, &water_conc, &water_solids, &stack, &phases, &env(),
            &[], 10.0, &mut ledgers, &mut tns, &mut scratch,
        );
        // bed layer: 5 g/m3 * 10 m3 at 1e-6 /s
        assert!((ledgers.rad.outflux(0, 0, 1) - 5.0e-5).abs() < 1.0e-12);
        assert!(ledgers.rad.outflux(0, 0, 0) > 0.0);
    }

    #[test]
    fn test_photolysis_needs_light() {
        let (mut species, water_conc, water_solids, stack, phases, mut ledgers, mut tns, mut scratch) =
            still_pond_setup();
        species[0].reactions.push(Reaction::Photolysis {
            k_surface: 1.0,
            reference_radiation: 1000.0,
        });
        let mut dark = env();
        dark.radiation = 0.0;
        apply_column_kinetics(
            &species, 0, 1.0, 100.0, &water_conc, &water_solids, &stack, &phases, &dark,
            &[], 10.0, &mut ledgers, &mut tns, &mut scratch,
        );
        assert_eq!(ledgers.pht.outflux(0, 0, 0), 0.0);

        let mut noon = env();
        noon.radiation = 1000.0;
        apply_column_kinetics(
            &species, 0, 1.0, 100.0, &water_conc, &water_solids, &stack, &phases, &noon,
            &[], 10.0, &mut ledgers, &mut tns, &mut scratch,
        );
        let atten = (1.0 - (-1.0f64).exp()) / 1.0;
        let expected = (1.0 / 86400.0) * atten * 100.0 * 100.0;
        assert!((ledgers.pht.outflux(0, 0, 0) - expected).abs() < 1.0e-9);
    }

    #[test]
    fn test_light_attenuation_limits() {
        assert!((light_attenuation(1.0, 0.0) - 1.0).abs() < 1.0e-9);
        assert!(light_attenuation(2.0, 5.0) < 0.11);
    }

    #[test]
    fn test_yield_routes_reacted_mass() {
        let inert = |name: &str| ChemicalSpecies {
            name: name.to_string(),
            kb: 0.0,
            kp: 0.0,
            koc: 0.0,
            nux: 0.0,
            fdoc_effect: 1.0,
            reactions: vec![],
            group: 0,
        };
        let mut parent = inert("parent");
        parent.reactions.push(Reaction::Biodegradation {
            k_water: 0.864,
            k_bed: 0.0,
            second_order: false,
        });
        let species = vec![parent, inert("daughter")];

        let mut water_conc = SeriesField::new(2, 1);
        water_conc.set(0, 0, 100.0);
        let water_solids = SeriesField::new(1, 1);
        let stack = StackColumn::new(
            vec![Layer::spec(0.1, 100.0, 10.0, 0.4, vec![1.0e5], vec![0.0, 0.0])],
            0.0,
            3,
            0.5,
            1.5,
        );
        let phases = PhaseState::new(2, 1, 4, 1);
        let mut ledgers = ChemicalLedgers::new(2, 1, 4);
        let mut tns = LayerLedger::new(2, 1, 4);
        let mut scratch = KineticsScratch::new(2, 4);
        let yields = vec![ChemicalYield {
            from_species: 0,
            to_species: 1,
            process: ReactionProcess::Biodegradation,
            yield_factor: 0.5,
        }];
        apply_column_kinetics(
            &species, 0, 1.0, 100.0, &water_conc, &water_solids, &stack, &phases, &env(),
            &yields, 10.0, &mut ledgers, &mut tns, &mut scratch,
        );
        let reacted = ledgers.bio.outflux(0, 0, 0);
        assert!(reacted > 0.0);
        assert!((ledgers.yld.influx(1, 0, 0) - 0.5 * reacted).abs() < 1.0e-12);
    }

    #[test]
    fn test_dissolution_consumes_solid_and_caps_at_inventory() {
        let (mut species, water_conc, mut water_solids, stack, phases, mut ledgers, mut tns, mut scratch) =
            still_pond_setup();
        species[0].reactions.push(Reaction::Dissolution {
            from_fraction: 0,
            k_water: 8640.0,
            k_bed: 0.0,
            solubility: 1000.0,
        });
        // tiny solid inventory: 0.001 g/m3 in 100 m3 = 0.1 g
        water_solids.set(0, 0, 0.001);
        apply_column_kinetics(
            &species, 0, 1.0, 100.0, &water_conc, &water_solids, &stack, &phases, &env(),
            &[], 10.0, &mut ledgers, &mut tns, &mut scratch,
        );
        let rate = ledgers.dsl.influx(0, 0, 0);
        // capped at available mass over dt
        assert!((rate - 0.1 / 10.0).abs() < 1.0e-12);
        assert!((tns.outflux(0, 0, 0) - rate).abs() < 1.0e-12);
    }
}
