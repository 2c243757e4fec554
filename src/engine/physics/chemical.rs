// ABOUTME: Chemical species properties, equilibrium phase partitioning, and chemical state
// ABOUTME: Phase fractions are cached per (species, location, layer) for the transport stages

use serde::{Deserialize, Serialize};

use crate::engine::massbalance::{LayerLedger, SourceLedger};
use crate::engine::physics::kinetics::Reaction;
use crate::engine::physics::solids::BufferedField;

/// One chemical state variable with its partitioning parameters and the
/// reaction set it participates in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChemicalSpecies {
    pub name: String,
    /// DOC binding coefficient K_b (m3/g).
    #[serde(default)]
    pub kb: f64,
    /// Solids partition coefficient K_p (m3/g). Ignored when koc > 0.
    #[serde(default)]
    pub kp: f64,
    /// Organic-carbon partition coefficient K_oc (m3/g); when positive,
    /// K_p for each fraction is K_oc times the fraction's fpoc.
    #[serde(default)]
    pub koc: f64,
    /// Particle interaction parameter nu_x (g/m3) attenuating K_p with
    /// total solids; 0 disables the attenuation.
    #[serde(default)]
    pub nux: f64,
    /// Effectiveness of DOC binding (0-1).
    #[serde(default = "default_fdoc_effect")]
    pub fdoc_effect: f64,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Reporting group this species folds into.
    #[serde(default)]
    pub group: usize,
}

fn default_fdoc_effect() -> f64 {
    1.0
}

impl ChemicalSpecies {
    /// Whether equilibrium partitioning is active for this species.
    pub fn partitions(&self) -> bool {
        self.kb > 0.0 || self.kp > 0.0 || self.koc > 0.0
    }

    /// Effective K_p for one fraction given its fpoc and the total
    /// solids concentration (g/m3).
    pub fn kp_effective(&self, fpoc: f64, total_solids: f64) -> f64 {
        let kp = if self.koc > 0.0 {
            self.koc * fpoc
        } else {
            self.kp
        };
        if self.nux > 0.0 && kp > 0.0 {
            kp / (1.0 + total_solids * kp / self.nux)
        } else {
            kp
        }
    }
}

/// Equilibrium phase split for one (species, location, layer).
/// dissolved + bound + sum(particulate) = 1 by construction.
#[derive(Clone, Debug)]
pub struct PhaseSplit {
    pub dissolved: f64,
    pub bound: f64,
    pub particulate: Vec<f64>,
}

impl PhaseSplit {
    /// Mobile share: the phases that move with water.
    pub fn mobile(&self) -> f64 {
        self.dissolved + self.bound
    }
}

/// Compute the equilibrium phase split from partition coefficients, DOC,
/// and per-fraction solids concentrations (g/m3).
pub fn partition(
    species: &ChemicalSpecies,
    doc_conc: f64,
    solids_conc: &[f64],
    fpoc: &[f64],
) -> PhaseSplit {
    if !species.partitions() {
        return PhaseSplit {
            dissolved: 1.0,
            bound: 0.0,
            particulate: vec![0.0; solids_conc.len()],
        };
    }
    let total_solids: f64 = solids_conc.iter().sum();
    let bound_term = species.kb * doc_conc * species.fdoc_effect;
    let kp_terms: Vec<f64> = solids_conc
        .iter()
        .zip(fpoc)
        .map(|(&cs, &f)| species.kp_effective(f, total_solids) * cs)
        .collect();
    let denom = 1.0 + bound_term + kp_terms.iter().sum::<f64>();
    let dissolved = 1.0 / denom;
    PhaseSplit {
        dissolved,
        bound: bound_term * dissolved,
        particulate: kp_terms.iter().map(|t| t * dissolved).collect(),
    }
}

/// Cached phase fractions over (species, location, layer). Layer 0 is
/// the water column; layers 1..n_layers-1 are stack positions.
#[derive(Clone, Debug)]
pub struct PhaseState {
    fd: Vec<f64>,
    fb: Vec<f64>,
    fp: Vec<f64>,
    n_species: usize,
    n_loc: usize,
    n_layers: usize,
    n_fractions: usize,
}

impl PhaseState {
    pub fn new(n_species: usize, n_loc: usize, n_layers: usize, n_fractions: usize) -> Self {
        let n = n_species * n_loc * n_layers;
        Self {
            fd: vec![1.0; n],
            fb: vec![0.0; n],
            fp: vec![0.0; n * n_fractions],
            n_species,
            n_loc,
            n_layers,
            n_fractions,
        }
    }

    #[inline]
    fn idx(&self, species: usize, loc: usize, layer: usize) -> usize {
        debug_assert!(species < self.n_species && loc < self.n_loc && layer < self.n_layers);
        (species * self.n_loc + loc) * self.n_layers + layer
    }

    pub fn store(&mut self, species: usize, loc: usize, layer: usize, split: &PhaseSplit) {
        let i = self.idx(species, loc, layer);
        self.fd[i] = split.dissolved;
        self.fb[i] = split.bound;
        let base = i * self.n_fractions;
        for (f, &p) in split.particulate.iter().enumerate() {
            self.fp[base + f] = p;
        }
    }

    #[inline]
    pub fn dissolved(&self, species: usize, loc: usize, layer: usize) -> f64 {
        self.fd[self.idx(species, loc, layer)]
    }

    #[inline]
    pub fn bound(&self, species: usize, loc: usize, layer: usize) -> f64 {
        self.fb[self.idx(species, loc, layer)]
    }

    #[inline]
    pub fn mobile(&self, species: usize, loc: usize, layer: usize) -> f64 {
        let i = self.idx(species, loc, layer);
        self.fd[i] + self.fb[i]
    }

    #[inline]
    pub fn particulate(&self, species: usize, loc: usize, layer: usize, fraction: usize) -> f64 {
        debug_assert!(fraction < self.n_fractions);
        self.fp[self.idx(species, loc, layer) * self.n_fractions + fraction]
    }
}

/// Per-process ledgers for chemicals in one domain.
#[derive(Clone, Debug)]
pub struct ChemicalLedgers {
    pub adv: SourceLedger,
    pub dsp: SourceLedger,
    pub load: SourceLedger,
    pub dep: LayerLedger,
    pub ers: LayerLedger,
    /// Porewater released to the water column by bed erosion.
    pub pwr: LayerLedger,
    /// Infiltration transfer from the water column into the bed.
    pub inf: LayerLedger,
    pub bur: LayerLedger,
    pub scr: LayerLedger,
    pub bio: LayerLedger,
    pub hyd: LayerLedger,
    pub oxi: LayerLedger,
    pub pht: LayerLedger,
    pub rad: LayerLedger,
    pub vlt: LayerLedger,
    pub udr: LayerLedger,
    /// Dissolution gains from pure-phase solids.
    pub dsl: LayerLedger,
    /// Yield gains routed from other species' reactions.
    pub yld: LayerLedger,
}

impl ChemicalLedgers {
    pub fn new(n_species: usize, n_loc: usize, n_layers: usize) -> Self {
        let layer = || LayerLedger::new(n_species, n_loc, n_layers);
        Self {
            adv: SourceLedger::new(n_species, n_loc),
            dsp: SourceLedger::new(n_species, n_loc),
            load: SourceLedger::new(n_species, n_loc),
            dep: layer(),
            ers: layer(),
            pwr: layer(),
            inf: layer(),
            bur: layer(),
            scr: layer(),
            bio: layer(),
            hyd: layer(),
            oxi: layer(),
            pht: layer(),
            rad: layer(),
            vlt: layer(),
            udr: layer(),
            dsl: layer(),
            yld: layer(),
        }
    }

    pub fn clear_fluxes(&mut self) {
        self.adv.clear_fluxes();
        self.dsp.clear_fluxes();
        self.load.clear_fluxes();
        for ledger in [
            &mut self.dep,
            &mut self.ers,
            &mut self.pwr,
            &mut self.inf,
            &mut self.scr,
            &mut self.bio,
            &mut self.hyd,
            &mut self.oxi,
            &mut self.pht,
            &mut self.rad,
            &mut self.vlt,
            &mut self.udr,
            &mut self.dsl,
            &mut self.yld,
        ] {
            ledger.clear_fluxes();
        }
    }

    pub fn settle(&mut self, dt_seconds: f64) {
        self.adv.settle(dt_seconds);
        self.dsp.settle(dt_seconds);
        self.load.settle(dt_seconds);
        for ledger in [
            &mut self.dep,
            &mut self.ers,
            &mut self.pwr,
            &mut self.inf,
            &mut self.scr,
            &mut self.bio,
            &mut self.hyd,
            &mut self.oxi,
            &mut self.pht,
            &mut self.rad,
            &mut self.vlt,
            &mut self.udr,
            &mut self.dsl,
            &mut self.yld,
        ] {
            ledger.settle(dt_seconds);
        }
    }

    /// Gross reaction gains for one species (kg): dissolution plus
    /// routed yields.
    pub fn reaction_inmass(&self, species: usize) -> f64 {
        self.dsl.total_inmass(species) + self.yld.total_inmass(species)
    }

    /// Gross reaction losses for one species (kg) over every kinetic
    /// process.
    pub fn reaction_outmass(&self, species: usize) -> f64 {
        self.bio.total_outmass(species)
            + self.hyd.total_outmass(species)
            + self.oxi.total_outmass(species)
            + self.pht.total_outmass(species)
            + self.rad.total_outmass(species)
            + self.vlt.total_outmass(species)
            + self.udr.total_outmass(species)
    }
}

/// Complete chemical state for both domains. Bed concentrations live in
/// the stack columns.
#[derive(Clone, Debug)]
pub struct ChemicalState {
    pub species: Vec<ChemicalSpecies>,
    pub conc_ov: BufferedField,
    pub conc_ch: BufferedField,
    pub phase_ov: PhaseState,
    pub phase_ch: PhaseState,
    pub ledgers_ov: ChemicalLedgers,
    pub ledgers_ch: ChemicalLedgers,
}

impl ChemicalState {
    pub fn new(
        species: Vec<ChemicalSpecies>,
        n_cells: usize,
        n_nodes: usize,
        n_layers: usize,
        n_fractions: usize,
    ) -> Self {
        let n = species.len();
        Self {
            species,
            conc_ov: BufferedField::new(n, n_cells),
            conc_ch: BufferedField::new(n, n_nodes),
            phase_ov: PhaseState::new(n, n_cells, n_layers, n_fractions),
            phase_ch: PhaseState::new(n, n_nodes, n_layers, n_fractions),
            ledgers_ov: ChemicalLedgers::new(n, n_cells, n_layers),
            ledgers_ch: ChemicalLedgers::new(n, n_nodes, n_layers),
        }
    }

    pub fn n_species(&self) -> usize {
        self.species.len()
    }

    pub fn advance(&mut self) {
        self.conc_ov.advance();
        self.conc_ch.advance();
    }
}
