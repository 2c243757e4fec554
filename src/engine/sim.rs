// SPDX-License-Identifier: MIT
// Copyright (c) 2025 TREX contributors

// ABOUTME: The coupled simulation: owns all state, advances the fixed stage pipeline each
// ABOUTME: step, runs the time-step controller, and performs the stack re-indexing pass

use log::{info, warn};

use crate::engine::core::channel::ChannelNetwork;
use crate::engine::core::error::{Location, Result, TrexError};
use crate::engine::core::grid::Grid;
use crate::engine::core::stack::{Layer, MassTransfer, StackColumn};
use crate::engine::core::timefunc::IntervalSchedule;
use crate::engine::core::units::{Hours, Seconds, GRAMS_PER_KILOGRAM};
use crate::engine::massbalance::{BalanceLine, LayerLedger, PeakTracker};
use crate::engine::physics::chemical::ChemicalState;
use crate::engine::physics::chemical_transport::{
    chemical_balance, chemical_transport, ChemicalContext, ChemicalParameters,
};
use crate::engine::physics::environment::{EnvField, EnvironmentState};
use crate::engine::physics::forcing::{BoundaryConcentration, MassLoad};
use crate::engine::physics::hydrology::{
    water_balance, water_transport, ChannelInflow, CourantLimit, HydrologyParameters, LandClass,
    OverlandOutlet, WaterContext,
};
use crate::engine::physics::kinetics::{ChemicalYield, KineticsScratch};
use crate::engine::physics::solids::{BedMaterial, SolidsState};
use crate::engine::physics::solids_transport::{
    solids_balance, solids_transport, SolidsContext, SolidsParameters,
};
use crate::engine::physics::water::{ChannelWater, OverlandWater, WaterBudget};

/// How the step length is chosen each iteration.
#[derive(Clone, Debug)]
pub enum TimestepMode {
    /// User-supplied piecewise-constant schedule.
    Schedule(IntervalSchedule),
    /// Stability-driven: relaxation times the Courant limit, capped.
    Automatic { relaxation: f64, dt_max: f64 },
    /// Replay a recorded step-length trace.
    Replay { dts: Vec<f64>, cursor: usize },
}

/// The time-step controller. Automatic mode records its trace so a
/// relaunch can replay a hydraulics-only run against the full process
/// set.
#[derive(Clone, Debug)]
pub struct TimestepController {
    mode: TimestepMode,
    /// Fatal floor on the step length (s).
    pub dt_floor: f64,
    trace: Vec<f64>,
}

impl TimestepController {
    pub fn schedule(schedule: IntervalSchedule) -> Self {
        Self {
            mode: TimestepMode::Schedule(schedule),
            dt_floor: 1.0e-4,
            trace: Vec::new(),
        }
    }

    pub fn automatic(relaxation: f64, dt_max: f64) -> Self {
        Self {
            mode: TimestepMode::Automatic { relaxation, dt_max },
            dt_floor: 1.0e-4,
            trace: Vec::new(),
        }
    }

    pub fn replay(dts: Vec<f64>) -> Self {
        Self {
            mode: TimestepMode::Replay { dts, cursor: 0 },
            dt_floor: 1.0e-4,
            trace: Vec::new(),
        }
    }

    /// The step length for the step starting at `time_hours`, given the
    /// Courant limit observed on the previous step.
    pub fn next_dt(&mut self, time_hours: f64, courant: CourantLimit) -> Result<f64> {
        let dt = match &mut self.mode {
            TimestepMode::Schedule(schedule) => {
                schedule.advance(time_hours);
                schedule.current()
            }
            TimestepMode::Automatic { relaxation, dt_max } => {
                let stable = courant.min_dt * *relaxation;
                stable.min(*dt_max)
            }
            TimestepMode::Replay { dts, cursor } => {
                let dt = dts[(*cursor).min(dts.len() - 1)];
                *cursor += 1;
                dt
            }
        };
        if dt < self.dt_floor || !dt.is_finite() {
            return Err(TrexError::TimestepUnderflow {
                dt,
                floor: self.dt_floor,
                time: time_hours,
            });
        }
        self.trace.push(dt);
        Ok(dt)
    }

    /// The step lengths used so far, for the relaunch buffer and the
    /// step-length export file.
    pub fn trace(&self) -> &[f64] {
        &self.trace
    }
}

/// A logged stack event (collapse warnings are non-fatal).
#[derive(Clone, Debug)]
pub struct StackEvent {
    pub time_hours: f64,
    pub location: Location,
    pub collapsed: bool,
}

/// Running extrema for the statistics and summary files.
#[derive(Clone, Debug, Default)]
pub struct RunningStats {
    pub peak_outlet_discharge: PeakTracker,
    pub peak_overland_depth: PeakTracker,
    pub peak_channel_depth: PeakTracker,
    pub peak_solids_conc: Vec<PeakTracker>,
    pub peak_chem_conc: Vec<PeakTracker>,
}

/// Per-run initial masses (kg) captured after initialization, the
/// anchor of the end-of-run balance check.
#[derive(Clone, Debug, Default)]
pub struct InitialMasses {
    pub solids: Vec<f64>,
    pub chems: Vec<f64>,
}

/// Observer invoked once per completed step and once at the end of the
/// run; the output subsystem implements this.
pub trait StepSink {
    fn on_step(&mut self, sim: &Simulation) -> Result<()> {
        let _ = sim;
        Ok(())
    }
    fn on_finish(&mut self, sim: &Simulation) -> Result<()> {
        let _ = sim;
        Ok(())
    }
}

/// A sink that discards everything; used by relaunch passes and tests.
pub struct NullSink;

impl StepSink for NullSink {}

/// Summary of a completed run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub steps: u64,
    pub end_time_hours: f64,
    pub water_residual_m3: f64,
}

/// The coupled simulation state machine.
pub struct Simulation {
    pub grid: Grid,
    pub channels: ChannelNetwork,
    pub land: Vec<LandClass>,
    pub soils: Vec<BedMaterial>,

    pub hydro_params: HydrologyParameters,
    pub solids_params: SolidsParameters,
    pub chem_params: ChemicalParameters,

    pub outlets: Vec<OverlandOutlet>,
    /// Rainfall gauge series (mm/h) with optional spatial multiplier.
    pub rain: EnvField,
    pub channel_inflows: Vec<ChannelInflow>,
    pub solids_loads: Vec<MassLoad>,
    pub solids_boundary: Vec<BoundaryConcentration>,
    pub chem_loads: Vec<MassLoad>,
    pub chem_boundary: Vec<BoundaryConcentration>,
    pub yields: Vec<ChemicalYield>,

    pub ov_water: OverlandWater,
    pub ch_water: ChannelWater,
    pub solids: Option<SolidsState>,
    pub chems: Option<ChemicalState>,
    pub stacks_ov: Vec<StackColumn>,
    pub stacks_ch: Vec<StackColumn>,
    pub env: EnvironmentState,

    pub budget: WaterBudget,
    pub controller: TimestepController,
    pub stats: RunningStats,
    pub stack_events: Vec<StackEvent>,
    pub initial_masses: InitialMasses,

    /// Collapse option for the soil and sediment stacks.
    pub collapse_overland: bool,
    pub collapse_channel: bool,
    /// Propagate bed elevation changes into the routing surfaces.
    pub update_elevations: bool,

    /// Simulation clock (hours past time zero) and the run window.
    pub time_hours: f64,
    pub start_hours: f64,
    pub end_hours: f64,
    pub steps_taken: u64,
    /// Current and previous step lengths (s).
    pub dt: f64,

    initial_water_storage: f64,
    last_courant: CourantLimit,
    scratch: Option<KineticsScratch>,
    max_stack: usize,
}

impl Simulation {
    /// A hydrology-only simulation over the given domain. Solids and
    /// chemicals are attached afterwards with the `enable_*` calls.
    pub fn new(
        grid: Grid,
        channels: ChannelNetwork,
        land: Vec<LandClass>,
        soils: Vec<BedMaterial>,
    ) -> Result<Self> {
        if land.is_empty() || soils.is_empty() {
            return Err(TrexError::Validation(
                "at least one land-use and one soil class are required".to_string(),
            ));
        }
        channels.validate(&grid)?;
        let n_cells = grid.cell_count();
        let n_nodes = channels.node_count();
        let ov_water = OverlandWater::new(&grid);
        let ch_water = ChannelWater::new(n_nodes);
        let env = EnvironmentState::new(&grid, n_nodes, 0, 40.0, 0.0);
        Ok(Self {
            grid,
            channels,
            land,
            soils,
            hydro_params: HydrologyParameters::default(),
            solids_params: SolidsParameters::default(),
            chem_params: ChemicalParameters::default(),
            outlets: Vec::new(),
            rain: EnvField::constant(0.0, n_cells),
            channel_inflows: Vec::new(),
            solids_loads: Vec::new(),
            solids_boundary: Vec::new(),
            chem_loads: Vec::new(),
            chem_boundary: Vec::new(),
            yields: Vec::new(),
            ov_water,
            ch_water,
            solids: None,
            chems: None,
            stacks_ov: Vec::new(),
            stacks_ch: Vec::new(),
            env,
            budget: WaterBudget::default(),
            controller: TimestepController::schedule(IntervalSchedule::constant(10.0)),
            stats: RunningStats::default(),
            stack_events: Vec::new(),
            initial_masses: InitialMasses::default(),
            collapse_overland: false,
            collapse_channel: false,
            update_elevations: false,
            time_hours: 0.0,
            start_hours: 0.0,
            end_hours: 1.0,
            steps_taken: 0,
            dt: 0.0,
            initial_water_storage: 0.0,
            last_courant: CourantLimit {
                min_dt: f64::INFINITY,
            },
            scratch: None,
            max_stack: 1,
        })
    }

    /// Attach the solids process. Stacks must be installed first with
    /// `install_stacks`.
    pub fn enable_solids(&mut self, solids: SolidsState) -> Result<()> {
        if self.stacks_ov.is_empty() {
            return Err(TrexError::Validation(
                "install soil/sediment stacks before enabling solids".to_string(),
            ));
        }
        if self.env.fpoc.len() != solids.n_fractions() {
            self.env.fpoc.resize(solids.n_fractions(), 0.0);
        }
        self.solids = Some(solids);
        Ok(())
    }

    /// Attach the chemical process; requires solids.
    pub fn enable_chemicals(&mut self, chems: ChemicalState) -> Result<()> {
        let Some(solids) = &self.solids else {
            return Err(TrexError::Validation(
                "chemical transport requires the solids process".to_string(),
            ));
        };
        let n_layers = self.max_stack + 1;
        self.scratch = Some(KineticsScratch::new(chems.n_species(), n_layers));
        let _ = solids;
        self.chems = Some(chems);
        Ok(())
    }

    /// Install the soil and sediment stack columns. One column per grid
    /// cell (out-of-domain cells get placeholders) and one per node.
    pub fn install_stacks(
        &mut self,
        stacks_ov: Vec<StackColumn>,
        stacks_ch: Vec<StackColumn>,
        max_stack: usize,
    ) -> Result<()> {
        if stacks_ov.len() != self.grid.cell_count() {
            return Err(TrexError::Validation(format!(
                "expected {} overland stack columns, got {}",
                self.grid.cell_count(),
                stacks_ov.len()
            )));
        }
        if stacks_ch.len() != self.channels.node_count() {
            return Err(TrexError::Validation(format!(
                "expected {} sediment stack columns, got {}",
                self.channels.node_count(),
                stacks_ch.len()
            )));
        }
        self.max_stack = max_stack;
        self.stacks_ov = stacks_ov;
        self.stacks_ch = stacks_ch;
        Ok(())
    }

    /// Uniform overland stacks built from one bottom-first layer spec,
    /// plus channel stacks sized from each node's geometry.
    pub fn install_uniform_stacks(
        &mut self,
        layer_specs: &[Layer],
        max_stack: usize,
        min_volume_factor: f64,
        max_volume_factor: f64,
    ) -> Result<()> {
        let mut stacks_ov = Vec::with_capacity(self.grid.cell_count());
        for r in 0..self.grid.rows {
            for c in 0..self.grid.cols {
                let mut specs: Vec<Layer> = layer_specs.to_vec();
                let total_thickness: f64 = specs.iter().map(|l| l.thickness).sum();
                for layer in specs.iter_mut() {
                    layer.area = self.grid.cell_area();
                    layer.bottom_width = self.grid.cell_size;
                }
                let base = self.grid.elevation.get(r, c) - total_thickness;
                stacks_ov.push(StackColumn::new(
                    specs,
                    base,
                    max_stack,
                    min_volume_factor,
                    max_volume_factor,
                ));
            }
        }
        let mut stacks_ch = Vec::with_capacity(self.channels.node_count());
        for (l, n, _) in self.channels.iter_nodes() {
            let node = self.channels.node(l, n);
            let mut specs: Vec<Layer> = layer_specs.to_vec();
            let total_thickness: f64 = specs.iter().map(|s| s.thickness).sum();
            for layer in specs.iter_mut() {
                layer.area = node.bottom_width * node.length;
                layer.bottom_width = node.bottom_width;
            }
            stacks_ch.push(StackColumn::new(
                specs,
                node.bed_elevation - total_thickness,
                max_stack,
                min_volume_factor,
                max_volume_factor,
            ));
        }
        self.install_stacks(stacks_ov, stacks_ch, max_stack)
    }

    /// Capture initial storage and masses; call once before stepping.
    pub fn initialize(&mut self) {
        // interception storage starts at each land class's capacity
        for r in 0..self.grid.rows {
            for c in 0..self.grid.cols {
                if self.grid.is_domain(r, c) {
                    let depth_mm = self.land[self.grid.land_use.get(r, c)].interception_depth;
                    self.ov_water.interception.set(r, c, depth_mm / 1000.0);
                }
            }
        }
        self.initial_water_storage = self.water_storage();
        self.initial_masses = InitialMasses {
            solids: match &self.solids {
                Some(s) => (0..s.n_fractions()).map(|f| self.total_solid_mass(f)).collect(),
                None => Vec::new(),
            },
            chems: match &self.chems {
                Some(ch) => (0..ch.n_species()).map(|s| self.total_chem_mass(s)).collect(),
                None => Vec::new(),
            },
        };
        if let Some(solids) = &self.solids {
            self.stats.peak_solids_conc = vec![PeakTracker::default(); solids.n_fractions()];
        }
        if let Some(chems) = &self.chems {
            self.stats.peak_chem_conc = vec![PeakTracker::default(); chems.n_species()];
        }
        self.time_hours = self.start_hours;
        info!(
            "initialized: {} cells, {} nodes, {} fractions, {} species",
            self.grid.cell_count(),
            self.channels.node_count(),
            self.solids.as_ref().map_or(0, |s| s.n_fractions()),
            self.chems.as_ref().map_or(0, |c| c.n_species()),
        );
    }

    /// Total surface water storage: ponded, channel, and SWE (m3).
    pub fn water_storage(&self) -> f64 {
        let mut total = self.ov_water.total_volume(&self.grid);
        for (r, c) in self.grid.iter_domain() {
            total += self.ov_water.swe.get(r, c) * self.grid.cell_area();
        }
        for (l, n, loc) in self.channels.iter_nodes() {
            total += self.channels.node(l, n).water_volume(self.ch_water.depth[loc]);
        }
        total
    }

    /// Total mass of one solids fraction over water columns and stacks
    /// (kg).
    pub fn total_solid_mass(&self, fraction: usize) -> f64 {
        let solids = self.solids.as_ref().expect("solids enabled");
        let mut grams = 0.0;
        for (r, c) in self.grid.iter_domain() {
            let loc = self.grid.index(r, c);
            grams += solids.conc_ov.current.get(fraction, loc)
                * self.ov_water.depth.get(r, c)
                * self.grid.cell_area();
            grams += self.stacks_ov[loc].total_solid_mass(fraction);
        }
        for (l, n, loc) in self.channels.iter_nodes() {
            grams += solids.conc_ch.current.get(fraction, loc)
                * self.channels.node(l, n).water_volume(self.ch_water.depth[loc]);
            grams += self.stacks_ch[loc].total_solid_mass(fraction);
        }
        grams / GRAMS_PER_KILOGRAM
    }

    /// Total mass of one chemical species over water columns and stacks
    /// (kg).
    pub fn total_chem_mass(&self, species: usize) -> f64 {
        let chems = self.chems.as_ref().expect("chemicals enabled");
        let mut grams = 0.0;
        for (r, c) in self.grid.iter_domain() {
            let loc = self.grid.index(r, c);
            grams += chems.conc_ov.current.get(species, loc)
                * self.ov_water.depth.get(r, c)
                * self.grid.cell_area();
            grams += self.stacks_ov[loc].total_chem_mass(species);
        }
        for (l, n, loc) in self.channels.iter_nodes() {
            grams += chems.conc_ch.current.get(species, loc)
                * self.channels.node(l, n).water_volume(self.ch_water.depth[loc]);
            grams += self.stacks_ch[loc].total_chem_mass(species);
        }
        grams / GRAMS_PER_KILOGRAM
    }

    /// Advance the simulation one step through the full stage pipeline.
    pub fn step(&mut self) -> Result<()> {
        // remaining run window caps the step
        let dt = self
            .controller
            .next_dt(self.time_hours, self.last_courant)?
            .min((self.end_hours - self.time_hours) * 3600.0)
            .max(self.controller.dt_floor);
        self.dt = dt;

        // stages 1-2: forcings and environment to current time
        self.rain.update(self.time_hours);
        self.env.update(&self.grid, self.time_hours);

        // stages 3-4: water transport and balance
        let ctx = WaterContext {
            grid: &self.grid,
            channels: &self.channels,
            land: &self.land,
            soils: &self.soils,
            params: &self.hydro_params,
            outlets: &self.outlets,
        };
        self.last_courant = water_transport(
            &ctx,
            &self.rain,
            &mut self.channel_inflows,
            &self.env,
            &mut self.ov_water,
            &mut self.ch_water,
            &mut self.budget,
            self.time_hours,
            dt,
        );
        water_balance(
            &ctx,
            &mut self.ov_water,
            &mut self.ch_water,
            &mut self.budget,
            self.time_hours,
            dt,
        )?;

        // stages 5-6: solids transport and balance
        if let Some(solids) = &mut self.solids {
            let ctx = SolidsContext {
                grid: &self.grid,
                channels: &self.channels,
                land: &self.land,
                soils: &self.soils,
                params: &self.solids_params,
            };
            solids_transport(
                &ctx,
                solids,
                &self.stacks_ov,
                &self.stacks_ch,
                &self.ov_water,
                &self.ch_water,
                &mut self.solids_loads,
                &mut self.solids_boundary,
                self.time_hours,
                dt,
            );
            solids_balance(
                &ctx,
                solids,
                &mut self.stacks_ov,
                &mut self.stacks_ch,
                &self.ov_water,
                &self.ch_water,
                self.time_hours,
                dt,
            )?;
        }

        // stages 7-8: chemical transport and balance
        if let Some(chems) = &mut self.chems {
            let solids = self.solids.as_mut().expect("chemicals require solids");
            let ctx = ChemicalContext {
                grid: &self.grid,
                channels: &self.channels,
                params: &self.chem_params,
                yields: &self.yields,
            };
            let scratch = self.scratch.as_mut().expect("kinetics scratch");
            chemical_transport(
                &ctx,
                chems,
                solids,
                &self.stacks_ov,
                &self.stacks_ch,
                &self.ov_water,
                &self.ch_water,
                &self.env,
                &mut self.chem_loads,
                &mut self.chem_boundary,
                scratch,
                self.time_hours,
                dt,
            );
            chemical_balance(
                &ctx,
                chems,
                &mut self.stacks_ov,
                &mut self.stacks_ch,
                &self.ov_water,
                &self.ch_water,
                self.time_hours,
                dt,
            )?;
        }

        // stage 9: stack re-indexing
        if self.solids.is_some() {
            self.reindex_stacks()?;
        }

        // stage 11: state advance and statistics
        self.ov_water.advance();
        self.ch_water.advance();
        if let Some(solids) = &mut self.solids {
            solids.advance();
        }
        if let Some(chems) = &mut self.chems {
            chems.advance();
        }
        self.time_hours = Hours(self.time_hours).advanced_by(Seconds(dt)).0;
        self.steps_taken += 1;
        self.update_stats();
        Ok(())
    }

    fn update_stats(&mut self) {
        let t = self.time_hours;
        let mut outlet_q = 0.0;
        for (r, c) in self.grid.iter_domain() {
            let loc = self.grid.index(r, c);
            outlet_q += self
                .ov_water
                .outflow
                .get(loc, crate::engine::core::grid::Source::Boundary.index());
            self.stats
                .peak_overland_depth
                .observe(self.ov_water.depth.get(r, c), t);
        }
        for (_, _, loc) in self.channels.iter_nodes() {
            outlet_q += self
                .ch_water
                .outflow
                .get(loc, crate::engine::core::grid::Source::Boundary.index());
            self.stats
                .peak_channel_depth
                .observe(self.ch_water.depth[loc], t);
        }
        self.stats.peak_outlet_discharge.observe(outlet_q, t);

        if let Some(solids) = &self.solids {
            for f in 0..solids.n_fractions() {
                let mut peak: f64 = 0.0;
                for (r, c) in self.grid.iter_domain() {
                    peak = peak.max(solids.conc_ov.current.get(f, self.grid.index(r, c)));
                }
                for (_, _, loc) in self.channels.iter_nodes() {
                    peak = peak.max(solids.conc_ch.current.get(f, loc));
                }
                self.stats.peak_solids_conc[f].observe(peak, t);
            }
        }
        if let Some(chems) = &self.chems {
            for s in 0..chems.n_species() {
                let mut peak: f64 = 0.0;
                for (r, c) in self.grid.iter_domain() {
                    peak = peak.max(chems.conc_ov.current.get(s, self.grid.index(r, c)));
                }
                for (_, _, loc) in self.channels.iter_nodes() {
                    peak = peak.max(chems.conc_ch.current.get(s, loc));
                }
                self.stats.peak_chem_conc[s].observe(peak, t);
            }
        }
    }

    /// Stage 9: fold each column's t+dt buffers in, then push, pop, or
    /// collapse wherever the surface layer crossed a volume trigger.
    /// Every column is independent, so the visit order is immaterial.
    fn reindex_stacks(&mut self) -> Result<()> {
        let time = self.time_hours;

        // overland soil stacks
        for r in 0..self.grid.rows {
            for c in 0..self.grid.cols {
                if !self.grid.is_domain(r, c) {
                    continue;
                }
                let loc = self.grid.index(r, c);
                let location = Location::Cell { row: r, col: c };
                let stack = &mut self.stacks_ov[loc];
                stack.advance();

                let solids = self.solids.as_mut().expect("solids enabled");
                match stack.maybe_push(self.collapse_overland) {
                    Ok(Some(report)) => {
                        if report.collapsed {
                            warn!("soil stack collapse at {} (time {:.4} h)", location, time);
                            self.stack_events.push(StackEvent {
                                time_hours: time,
                                location,
                                collapsed: true,
                            });
                        }
                        charge_transfers(
                            &report.transfers,
                            loc,
                            &mut solids.ledgers_ov.bur,
                            self.chems.as_mut().map(|c| &mut c.ledgers_ov.bur),
                        );
                        if self.update_elevations {
                            self.grid.elevation.set(r, c, report.new_bed_elevation);
                        }
                    }
                    Ok(None) => {
                        if let Some(report) = stack.maybe_pop() {
                            charge_transfers(
                                std::slice::from_ref(&report.transfer),
                                loc,
                                &mut solids.ledgers_ov.scr,
                                self.chems.as_mut().map(|c| &mut c.ledgers_ov.scr),
                            );
                            if self.update_elevations {
                                self.grid.elevation.set(r, c, report.new_bed_elevation);
                            }
                        }
                    }
                    Err(full) => {
                        return Err(TrexError::StackFull {
                            kind: "soil",
                            nstack: full.nstack,
                            location,
                            time,
                        });
                    }
                }
            }
        }

        // channel sediment stacks
        for l in 0..self.channels.link_count() {
            for n in 0..self.channels.links[l].nodes.len() {
                let loc = self.channels.node_index(l, n);
                let (row, col) = self.channels.cell_of(l, n);
                let location = Location::Node {
                    link: l,
                    node: n,
                    row,
                    col,
                };
                let stack = &mut self.stacks_ch[loc];
                stack.advance();

                let solids = self.solids.as_mut().expect("solids enabled");
                let outcome = match stack.maybe_push(self.collapse_channel) {
                    Ok(Some(report)) => {
                        if report.collapsed {
                            warn!(
                                "sediment stack collapse at {} (time {:.4} h)",
                                location, time
                            );
                            self.stack_events.push(StackEvent {
                                time_hours: time,
                                location,
                                collapsed: true,
                            });
                        }
                        charge_transfers(
                            &report.transfers,
                            loc,
                            &mut solids.ledgers_ch.bur,
                            self.chems.as_mut().map(|c| &mut c.ledgers_ch.bur),
                        );
                        Some((report.new_bed_elevation, report.new_bottom_width))
                    }
                    Ok(None) => stack.maybe_pop().map(|report| {
                        charge_transfers(
                            std::slice::from_ref(&report.transfer),
                            loc,
                            &mut solids.ledgers_ch.scr,
                            self.chems.as_mut().map(|c| &mut c.ledgers_ch.scr),
                        );
                        (report.new_bed_elevation, report.new_bottom_width)
                    }),
                    Err(full) => {
                        return Err(TrexError::StackFull {
                            kind: "sediment",
                            nstack: full.nstack,
                            location,
                            time,
                        });
                    }
                };

                if let Some((bed_elevation, bottom_width)) = outcome {
                    let ground = self.grid.elevation.get(row, col);
                    let node = self.channels.node_mut(l, n);
                    node.bed_elevation = bed_elevation;
                    node.bottom_width = bottom_width;
                    node.bank_height = ground - bed_elevation;
                    if node.bank_height <= 0.0 {
                        return Err(TrexError::BankHeightExhausted {
                            height: node.bank_height,
                            location,
                            time,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Run until the end of the simulation window.
    pub fn run(&mut self, sink: &mut dyn StepSink) -> Result<RunSummary> {
        while self.time_hours < self.end_hours - 1.0e-9 {
            self.step()?;
            sink.on_step(self)?;
        }
        sink.on_finish(self)?;
        Ok(RunSummary {
            steps: self.steps_taken,
            end_time_hours: self.time_hours,
            water_residual_m3: self
                .budget
                .residual(self.initial_water_storage, self.water_storage()),
        })
    }

    /// End-of-run balance line for one solids fraction.
    pub fn solids_balance_line(&self, fraction: usize) -> BalanceLine {
        let solids = self.solids.as_ref().expect("solids enabled");
        let boundary = crate::engine::core::grid::Source::Boundary.index();
        let external_in = solids.ledgers_ov.load.total_inmass(fraction)
            + solids.ledgers_ch.load.total_inmass(fraction)
            + solids.ledgers_ov.adv.inmass_by_source(fraction, boundary)
            + solids.ledgers_ch.adv.inmass_by_source(fraction, boundary);
        let external_out = solids.ledgers_ov.adv.outmass_by_source(fraction, boundary)
            + solids.ledgers_ch.adv.outmass_by_source(fraction, boundary);
        let reaction_out = solids.ledgers_ov.tns.total_outmass(fraction)
            + solids.ledgers_ch.tns.total_outmass(fraction);
        BalanceLine {
            name: solids.fractions[fraction].name.clone(),
            initial_kg: self.initial_masses.solids[fraction],
            final_kg: self.total_solid_mass(fraction),
            external_in_kg: external_in,
            external_out_kg: external_out,
            reaction_in_kg: 0.0,
            reaction_out_kg: reaction_out,
        }
    }

    /// End-of-run balance line for one chemical species. Volatilization
    /// leaves the domain and counts as an external loss alongside the
    /// boundary outflow.
    pub fn chem_balance_line(&self, species: usize) -> BalanceLine {
        let chems = self.chems.as_ref().expect("chemicals enabled");
        let boundary = crate::engine::core::grid::Source::Boundary.index();
        let external_in = chems.ledgers_ov.load.total_inmass(species)
            + chems.ledgers_ch.load.total_inmass(species)
            + chems.ledgers_ov.adv.inmass_by_source(species, boundary)
            + chems.ledgers_ch.adv.inmass_by_source(species, boundary);
        let external_out = chems.ledgers_ov.adv.outmass_by_source(species, boundary)
            + chems.ledgers_ch.adv.outmass_by_source(species, boundary)
            + chems.ledgers_ov.vlt.total_outmass(species)
            + chems.ledgers_ch.vlt.total_outmass(species);
        let reaction_in = chems.ledgers_ov.reaction_inmass(species)
            + chems.ledgers_ch.reaction_inmass(species);
        // volatilization is already on the external side
        let reaction_out = chems.ledgers_ov.reaction_outmass(species)
            + chems.ledgers_ch.reaction_outmass(species)
            - chems.ledgers_ov.vlt.total_outmass(species)
            - chems.ledgers_ch.vlt.total_outmass(species);
        BalanceLine {
            name: chems.species[species].name.clone(),
            initial_kg: self.initial_masses.chems[species],
            final_kg: self.total_chem_mass(species),
            external_in_kg: external_in,
            external_out_kg: external_out,
            reaction_in_kg: reaction_in,
            reaction_out_kg: reaction_out,
        }
    }
}

/// Charge re-indexing mass transfers to the burial or scour ledgers of
/// both processes.
fn charge_transfers(
    transfers: &[MassTransfer],
    loc: usize,
    solids_ledger: &mut LayerLedger,
    chem_ledger: Option<&mut LayerLedger>,
) {
    for t in transfers {
        for (f, &kg) in t.solids_kg.iter().enumerate() {
            solids_ledger.charge_mass(f, loc, t.from_layer, t.to_layer, kg);
        }
    }
    if let Some(ledger) = chem_ledger {
        for t in transfers {
            for (s, &kg) in t.chems_kg.iter().enumerate() {
                ledger.charge_mass(s, loc, t.from_layer, t.to_layer, kg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::physics::solids::SolidsFraction;

    fn base_sim() -> Simulation {
        let grid = Grid::uniform(1, 1, 10.0, 100.0);
        let channels = ChannelNetwork::empty();
        let land = vec![LandClass {
            name: "open".to_string(),
            manning_n: 0.03,
            interception_depth: 0.0,
            usle_c: 0.0,
            usle_p: 1.0,
        }];
        let soils = vec![BedMaterial {
            name: "bed".to_string(),
            erosion_scheme: Default::default(),
            porosity: 0.4,
            usle_k: 0.0,
            erosion_yield: 0.0,
            erosion_exponent: 1.0,
            transport_capacity_coeff: 0.0,
            hydraulic_conductivity: 0.0,
            capillary_suction: 0.0,
            moisture_deficit: 0.0,
        }];
        Simulation::new(grid, channels, land, soils).unwrap()
    }

    fn fractions() -> Vec<SolidsFraction> {
        vec![SolidsFraction {
            name: "fines".to_string(),
            diameter: 1.0e-5,
            settling_velocity: 0.0,
            specific_gravity: 2.65,
            dstar: 0.0,
            cohesive: true,
            tau_cd: 0.0,
            tau_ce: 0.0,
            aging_rate: 0.0,
            group: 0,
        }]
    }

    #[test]
    fn test_controller_schedule_advances() {
        let schedule = IntervalSchedule::new(vec![10.0, 5.0], vec![1.0, 2.0]).unwrap();
        let mut controller = TimestepController::schedule(schedule);
        let courant = CourantLimit {
            min_dt: f64::INFINITY,
        };
        assert_eq!(controller.next_dt(0.0, courant).unwrap(), 10.0);
        assert_eq!(controller.next_dt(1.5, courant).unwrap(), 5.0);
        assert_eq!(controller.trace(), &[10.0, 5.0]);
    }

    #[test]
    fn test_controller_automatic_caps_and_floors() {
        let mut controller = TimestepController::automatic(0.5, 30.0);
        let wide = CourantLimit { min_dt: 100.0 };
        assert_eq!(controller.next_dt(0.0, wide).unwrap(), 30.0);
        let narrow = CourantLimit { min_dt: 20.0 };
        assert_eq!(controller.next_dt(0.0, narrow).unwrap(), 10.0);
        let hopeless = CourantLimit { min_dt: 1.0e-6 };
        assert!(matches!(
            controller.next_dt(0.0, hopeless),
            Err(TrexError::TimestepUnderflow { .. })
        ));
    }

    #[test]
    fn test_controller_replay_repeats_last() {
        let mut controller = TimestepController::replay(vec![5.0, 7.0]);
        let courant = CourantLimit {
            min_dt: f64::INFINITY,
        };
        assert_eq!(controller.next_dt(0.0, courant).unwrap(), 5.0);
        assert_eq!(controller.next_dt(0.0, courant).unwrap(), 7.0);
        assert_eq!(controller.next_dt(0.0, courant).unwrap(), 7.0);
    }

    #[test]
    fn test_rainfall_run_reaches_expected_depth() {
        let mut sim = base_sim();
        sim.rain = EnvField::constant(50.0, 1);
        sim.end_hours = 1.0;
        sim.controller = TimestepController::schedule(IntervalSchedule::constant(10.0));
        sim.initialize();
        let summary = sim.run(&mut NullSink).unwrap();
        assert!((sim.ov_water.depth.get(0, 0) - 0.050).abs() < 1.0e-6);
        assert!(summary.water_residual_m3.abs() < 1.0e-9);
    }

    #[test]
    fn test_erosion_burial_cycle_conserves_mass() {
        // prescribed deposition pushes the stack, prescribed scour pops
        // it back; mass must survive both re-indexings
        let mut sim = base_sim();
        sim.install_uniform_stacks(
            &[
                Layer::spec(0.1, 0.0, 0.0, 0.4, vec![1.0e6], vec![]),
                Layer::spec(0.1, 0.0, 0.0, 0.4, vec![1.0e6], vec![]),
            ],
            4,
            0.5,
            1.1,
        )
        .unwrap();
        sim.enable_solids(SolidsState::new(fractions(), 1, 0, 5)).unwrap();
        sim.initialize();
        let initial_nstack = sim.stacks_ov[0].nstack();
        let initial_mass = sim.total_solid_mass(0);

        // grow the surface layer 20% past its maximum volume trigger
        {
            let stack = &mut sim.stacks_ov[0];
            let surface = stack.surface_mut();
            surface.new_volume = surface.max_volume * 1.2;
            let grown = surface.new_volume;
            let v0 = surface.volume;
            let scale = v0 / grown;
            for s in surface.solids_new.iter_mut() {
                *s *= scale;
            }
        }
        sim.reindex_stacks().unwrap();
        assert_eq!(sim.stacks_ov[0].nstack(), initial_nstack + 1);
        let after_push = sim.total_solid_mass(0);
        assert!((after_push - initial_mass).abs() < 1.0e-9 * initial_mass);

        // now scour the new surface below its minimum volume trigger,
        // keeping the layer's mass with it
        {
            let stack = &mut sim.stacks_ov[0];
            let surface = stack.surface_mut();
            surface.new_volume = surface.min_volume * 0.5;
            let scale = surface.volume / surface.new_volume;
            for s in surface.solids_new.iter_mut() {
                *s *= scale;
            }
        }
        sim.reindex_stacks().unwrap();
        assert_eq!(sim.stacks_ov[0].nstack(), initial_nstack);
        let after_pop = sim.total_solid_mass(0);
        assert!((after_pop - initial_mass).abs() < 1.0e-6 * initial_mass);

        // burial and scour symmetry in the ledgers
        let solids = sim.solids.as_ref().unwrap();
        let bur_in = solids.ledgers_ov.bur.total_inmass(0);
        let bur_out = solids.ledgers_ov.bur.total_outmass(0);
        assert!(bur_in > 0.0);
        assert!((bur_in - bur_out).abs() < 1.0e-12);
        let scr_in = solids.ledgers_ov.scr.total_inmass(0);
        assert!(scr_in > 0.0);
    }

    #[test]
    fn test_stack_collapse_bounds_depth() {
        // three consecutive pushes against maxstack = 3: the first two
        // grow the column to capacity, only the third needs a collapse
        let mut sim = base_sim();
        sim.install_uniform_stacks(
            &[Layer::spec(0.1, 0.0, 0.0, 0.4, vec![1.0e6], vec![])],
            3,
            0.5,
            1.1,
        )
        .unwrap();
        sim.enable_solids(SolidsState::new(fractions(), 1, 0, 4)).unwrap();
        sim.collapse_overland = true;
        sim.initialize();
        let initial_mass = sim.total_solid_mass(0);

        for _ in 0..3 {
            let stack = &mut sim.stacks_ov[0];
            let surface = stack.surface_mut();
            surface.new_volume = surface.max_volume * 1.2;
            let scale = surface.volume / surface.new_volume;
            for s in surface.solids_new.iter_mut() {
                *s *= scale;
            }
            sim.reindex_stacks().unwrap();
        }
        // capacity bounded, exactly one collapse event logged
        assert_eq!(sim.stacks_ov[0].nstack(), 3);
        assert_eq!(sim.stack_events.len(), 1);
        assert!(sim.stack_events[0].collapsed);
        let final_mass = sim.total_solid_mass(0);
        assert!((final_mass - initial_mass).abs() < 1.0e-6 * initial_mass);
    }

    #[test]
    fn test_stack_full_without_collapse_is_fatal() {
        let mut sim = base_sim();
        sim.install_uniform_stacks(
            &[
                Layer::spec(0.1, 0.0, 0.0, 0.4, vec![1.0e6], vec![]),
                Layer::spec(0.1, 0.0, 0.0, 0.4, vec![1.0e6], vec![]),
            ],
            2,
            0.5,
            1.1,
        )
        .unwrap();
        sim.enable_solids(SolidsState::new(fractions(), 1, 0, 3)).unwrap();
        sim.initialize();
        let stack = &mut sim.stacks_ov[0];
        let surface = stack.surface_mut();
        surface.new_volume = surface.max_volume * 1.2;
        let err = sim.reindex_stacks().unwrap_err();
        assert!(matches!(err, TrexError::StackFull { kind: "soil", .. }));
    }
}
