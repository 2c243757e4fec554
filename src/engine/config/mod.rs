// ABOUTME: Simulation configuration: a YAML document grouping general, hydrology, solids,
// ABOUTME: chemical, environment, and output inputs, with auxiliary grid and CSV references

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::core::channel::{ChannelNetwork, Connection, Link, NodeGeometry};
use crate::engine::core::error::{Result, TrexError};
use crate::engine::core::grid::{CellMask, Grid, GridMap};
use crate::engine::core::stack::Layer;
use crate::engine::core::timefunc::{IntervalSchedule, TimeFunction};
use crate::engine::output::ascii_grid::read_grid_checked;
use crate::engine::output::{OutputConfig, Station};
use crate::engine::physics::chemical::{ChemicalSpecies, ChemicalState};
use crate::engine::physics::chemical_transport::ChemicalParameters;
use crate::engine::physics::environment::EnvField;
use crate::engine::physics::forcing::{BoundaryConcentration, LoadKind, LoadLocation, MassLoad};
use crate::engine::physics::hydrology::{
    ChannelInflow, HydrologyParameters, LandClass, OverlandOutlet,
};
use crate::engine::physics::kinetics::ChemicalYield;
use crate::engine::physics::solids::{BedMaterial, SolidsFraction, SolidsState};
use crate::engine::physics::solids_transport::SolidsParameters;
use crate::engine::sim::{Simulation, TimestepController};

fn default_one() -> f64 {
    1.0
}

/// A (time, value) series given inline or as a two-column CSV file.
/// Times are hours unless flagged as days.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SeriesSource {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub times: Vec<f64>,
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default = "default_one")]
    pub scale: f64,
    #[serde(default)]
    pub time_in_days: bool,
}

impl SeriesSource {
    pub fn constant(value: f64) -> Self {
        Self {
            times: vec![0.0],
            values: vec![value],
            scale: 1.0,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.times.is_empty()
    }

    /// Resolve to a time function, reading the CSV relative to `base`.
    pub fn load(&self, base: &Path) -> Result<TimeFunction> {
        let (mut times, values) = if let Some(file) = &self.file {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base.join(file)
            };
            read_series_csv(&path)?
        } else {
            (self.times.clone(), self.values.clone())
        };
        if self.time_in_days {
            for t in times.iter_mut() {
                *t *= 24.0;
            }
        }
        let values = values.iter().map(|v| v * self.scale).collect();
        TimeFunction::new(times, values)
    }
}

/// Read a two-column (time, value) CSV, tolerating comments and blanks.
fn read_series_csv(path: &Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| TrexError::SeriesFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let mut times = Vec::new();
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| TrexError::SeriesFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if record.len() < 2 || record.iter().all(|f| f.is_empty()) {
            continue;
        }
        let parse = |field: &str| {
            field.parse::<f64>().map_err(|_| TrexError::SeriesFormat {
                path: path.to_path_buf(),
                reason: format!("bad numeric field '{}'", field),
            })
        };
        times.push(parse(&record[0])?);
        values.push(parse(&record[1])?);
    }
    Ok((times, values))
}

/// A raster given as an ESRI ASCII file or a uniform value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GridSource {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub uniform: Option<f64>,
}

impl GridSource {
    pub fn uniform(value: f64) -> Self {
        Self {
            file: None,
            uniform: Some(value),
        }
    }

    fn load(&self, base: &Path, master: &Grid, default: f64) -> Result<GridMap<f64>> {
        if let Some(file) = &self.file {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base.join(file)
            };
            read_grid_checked(&path, master)
        } else {
            Ok(GridMap::new(
                master.rows,
                master.cols,
                self.uniform.unwrap_or(default),
            ))
        }
    }
}

/// Data Group A: run identification and the time-step controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub name: String,
    #[serde(default)]
    pub start_hours: f64,
    pub end_hours: f64,
    /// Geographic latitude of the domain center (degrees).
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    /// Decimal julian day at simulation time zero.
    #[serde(default = "default_tzero")]
    pub tzero_julian_day: f64,
    pub timestep: TimestepConfig,
}

fn default_latitude() -> f64 {
    40.0
}

fn default_tzero() -> f64 {
    182.0
}

/// Time-step controller selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimestepConfig {
    /// Piecewise-constant dt (s) up to each end time (hours).
    Schedule { dts: Vec<f64>, end_times: Vec<f64> },
    /// Courant-driven with a relaxation factor and cap; optionally
    /// relaunch against the hydraulics-only trace.
    Automatic {
        relaxation: f64,
        dt_max: f64,
        #[serde(default)]
        relaunch: bool,
    },
    /// Replay a dt trace from a two-column CSV (step, dt seconds).
    Replay { file: PathBuf },
}

impl TimestepConfig {
    pub fn build(&self, base: &Path) -> Result<TimestepController> {
        match self {
            TimestepConfig::Schedule { dts, end_times } => Ok(TimestepController::schedule(
                IntervalSchedule::new(dts.clone(), end_times.clone())?,
            )),
            TimestepConfig::Automatic {
                relaxation, dt_max, ..
            } => Ok(TimestepController::automatic(*relaxation, *dt_max)),
            TimestepConfig::Replay { file } => {
                let path = if file.is_absolute() {
                    file.clone()
                } else {
                    base.join(file)
                };
                let (_, dts) = read_series_csv(&path)?;
                if dts.is_empty() {
                    return Err(TrexError::SeriesFormat {
                        path,
                        reason: "empty dt trace".to_string(),
                    });
                }
                Ok(TimestepController::replay(dts))
            }
        }
    }

    pub fn wants_relaunch(&self) -> bool {
        matches!(self, TimestepConfig::Automatic { relaunch: true, .. })
    }
}

/// A channel node row in Data Group B.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub row: usize,
    pub col: usize,
    pub bottom_width: f64,
    pub bank_height: f64,
    #[serde(default)]
    pub side_slope: f64,
    pub length: f64,
    pub manning_n: f64,
    pub bed_slope: f64,
    #[serde(default)]
    pub sediment_type: usize,
}

/// A channel link: ordered nodes plus junction topology.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkConfig {
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub upstream: Vec<(usize, usize)>,
    #[serde(default)]
    pub downstream: Vec<(usize, usize)>,
}

/// Data Group B: the raster domain, hydrologic properties, and rain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HydrologyConfig {
    pub rows: usize,
    pub cols: usize,
    pub cell_size: f64,
    #[serde(default)]
    pub mask: GridSource,
    #[serde(default)]
    pub elevation: GridSource,
    #[serde(default)]
    pub land_use_grid: GridSource,
    #[serde(default)]
    pub soil_grid: GridSource,
    #[serde(default)]
    pub slope: GridSource,
    #[serde(default)]
    pub aspect: GridSource,
    #[serde(default)]
    pub sky_view: GridSource,
    #[serde(default)]
    pub albedo: GridSource,
    pub land_use: Vec<LandClass>,
    pub soils: Vec<BedMaterial>,
    #[serde(default)]
    pub parameters: HydrologyParameters,
    /// Rain gauge series (mm/h) with an optional multiplier raster.
    #[serde(default)]
    pub rainfall: SeriesSource,
    #[serde(default)]
    pub rainfall_multiplier: GridSource,
    #[serde(default)]
    pub outlets: Vec<OverlandOutlet>,
    #[serde(default)]
    pub channels: Vec<LinkConfig>,
    /// Boundary inflow hydrographs (m3/s) at link head nodes.
    #[serde(default)]
    pub channel_inflows: Vec<InflowConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InflowConfig {
    pub link: usize,
    pub series: SeriesSource,
}

/// One stack layer spec, bottom-first, in Data Group C.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StackLayerConfig {
    pub thickness: f64,
    #[serde(default = "default_porosity")]
    pub porosity: f64,
    /// Per-fraction solids concentration (g/m3 of layer volume).
    pub solids: Vec<f64>,
    /// Per-species chemical concentration (g/m3 of layer volume).
    #[serde(default)]
    pub chems: Vec<f64>,
}

fn default_porosity() -> f64 {
    0.4
}

/// A point load row for Data Groups C and D.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadConfig {
    pub series: usize,
    #[serde(default)]
    pub row: Option<usize>,
    #[serde(default)]
    pub col: Option<usize>,
    #[serde(default)]
    pub link: Option<usize>,
    #[serde(default)]
    pub node: Option<usize>,
    /// kg/day unless `as_concentration` is set.
    pub function: SeriesSource,
    #[serde(default)]
    pub as_concentration: bool,
    #[serde(default = "default_one")]
    pub scale: f64,
}

impl LoadConfig {
    fn build(&self, base: &Path) -> Result<MassLoad> {
        let location = match (self.row, self.col, self.link, self.node) {
            (Some(row), Some(col), None, None) => LoadLocation::Cell { row, col },
            (None, None, Some(link), Some(node)) => LoadLocation::Node { link, node },
            _ => {
                return Err(TrexError::Validation(
                    "a load needs either row/col or link/node".to_string(),
                ))
            }
        };
        Ok(MassLoad {
            series: self.series,
            location,
            kind: if self.as_concentration {
                LoadKind::Concentration
            } else {
                LoadKind::MassRate
            },
            function: self.function.load(base)?,
            scale: self.scale,
        })
    }
}

/// Boundary concentration row for Data Groups C and D.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundaryConfig {
    pub link: usize,
    pub series: usize,
    pub function: SeriesSource,
}

/// Data Group C: fractions, stack discretization, and solids forcing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolidsConfig {
    pub fractions: Vec<SolidsFraction>,
    #[serde(default)]
    pub parameters: SolidsParameters,
    pub stack_layers: Vec<StackLayerConfig>,
    pub max_stack: usize,
    #[serde(default = "default_min_volume_factor")]
    pub min_volume_factor: f64,
    #[serde(default = "default_max_volume_factor")]
    pub max_volume_factor: f64,
    #[serde(default)]
    pub collapse_overland: bool,
    #[serde(default)]
    pub collapse_channel: bool,
    #[serde(default)]
    pub update_elevations: bool,
    /// Initial water-column concentration per fraction (g/m3).
    #[serde(default)]
    pub initial_concentration: Vec<f64>,
    #[serde(default)]
    pub loads: Vec<LoadConfig>,
    #[serde(default)]
    pub boundaries: Vec<BoundaryConfig>,
}

fn default_min_volume_factor() -> f64 {
    0.5
}

fn default_max_volume_factor() -> f64 {
    1.5
}

/// Data Group D: species, yields, and chemical forcing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChemicalsConfig {
    pub species: Vec<ChemicalSpecies>,
    #[serde(default)]
    pub parameters: ChemicalParameters,
    #[serde(default)]
    pub yields: Vec<ChemicalYield>,
    /// Initial water-column concentration per species (g/m3).
    #[serde(default)]
    pub initial_concentration: Vec<f64>,
    #[serde(default)]
    pub loads: Vec<LoadConfig>,
    #[serde(default)]
    pub boundaries: Vec<BoundaryConfig>,
}

/// Data Group E: environmental property time functions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub air_temperature: SeriesSource,
    #[serde(default)]
    pub water_temperature: SeriesSource,
    #[serde(default)]
    pub bed_temperature: SeriesSource,
    #[serde(default)]
    pub doc: SeriesSource,
    #[serde(default)]
    pub ph: SeriesSource,
    #[serde(default)]
    pub hardness: SeriesSource,
    #[serde(default)]
    pub oxidant: SeriesSource,
    #[serde(default)]
    pub bacteria: SeriesSource,
    #[serde(default)]
    pub extinction: SeriesSource,
    #[serde(default)]
    pub user_property: SeriesSource,
    #[serde(default)]
    pub wind: SeriesSource,
    #[serde(default)]
    pub cloud_cover: SeriesSource,
    /// Particulate organic carbon fraction per solids fraction (0-1).
    #[serde(default)]
    pub fpoc: Vec<f64>,
}

/// Data Group F: output schedules, stations, and restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputsConfig {
    pub directory: PathBuf,
    #[serde(default = "default_tabular_interval")]
    pub tabular_interval_hours: f64,
    #[serde(default = "default_grid_interval")]
    pub grid_interval_hours: f64,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
    #[serde(default)]
    pub bed_chem_mg_kg: bool,
}

fn default_tabular_interval() -> f64 {
    0.25
}

fn default_grid_interval() -> f64 {
    1.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StationConfig {
    pub name: String,
    #[serde(default)]
    pub row: Option<usize>,
    #[serde(default)]
    pub col: Option<usize>,
    #[serde(default)]
    pub link: Option<usize>,
    #[serde(default)]
    pub node: Option<usize>,
}

/// The complete simulation configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub general: GeneralConfig,
    pub hydrology: HydrologyConfig,
    #[serde(default)]
    pub solids: Option<SolidsConfig>,
    #[serde(default)]
    pub chemicals: Option<ChemicalsConfig>,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    pub outputs: OutputsConfig,
}

impl SimulationConfig {
    /// Load the YAML configuration document.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| TrexError::io(path, e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| TrexError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| TrexError::Config(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| TrexError::io(path, e))
    }

    /// Range and consistency checks that must fail before the loop.
    pub fn validate(&self) -> Result<()> {
        if self.general.end_hours <= self.general.start_hours {
            return Err(TrexError::Validation(
                "end time must be after start time".to_string(),
            ));
        }
        if self.hydrology.land_use.is_empty() || self.hydrology.soils.is_empty() {
            return Err(TrexError::Validation(
                "at least one land-use and one soil class are required".to_string(),
            ));
        }
        if let Some(solids) = &self.solids {
            if solids.fractions.is_empty() {
                return Err(TrexError::Validation(
                    "solids enabled with no fractions".to_string(),
                ));
            }
            if solids.stack_layers.is_empty() {
                return Err(TrexError::Validation(
                    "solids enabled with no stack layers".to_string(),
                ));
            }
            if solids.max_stack < solids.stack_layers.len() {
                return Err(TrexError::Validation(
                    "max_stack smaller than the initial layer count".to_string(),
                ));
            }
            for layer in &solids.stack_layers {
                if layer.solids.len() != solids.fractions.len() {
                    return Err(TrexError::Validation(
                        "stack layer solids list must match the fraction count".to_string(),
                    ));
                }
            }
        }
        if let Some(chems) = &self.chemicals {
            if chems.species.is_empty() {
                return Err(TrexError::Validation(
                    "chemicals enabled with no species".to_string(),
                ));
            }
            if self.solids.is_none() {
                return Err(TrexError::Validation(
                    "chemical transport requires the solids group".to_string(),
                ));
            }
        }
        for (i, f) in self.environment.fpoc.iter().enumerate() {
            if !(0.0..=1.0).contains(f) {
                return Err(TrexError::Validation(format!(
                    "fpoc[{}] = {} outside [0, 1]",
                    i, f
                )));
            }
        }
        Ok(())
    }

    /// Build the simulation and output configuration. Auxiliary files
    /// resolve relative to `base`.
    pub fn build(&self, base: &Path) -> Result<(Simulation, OutputConfig)> {
        self.validate()?;
        let grid = self.build_grid(base)?;
        let channels = self.build_channels(&grid)?;

        let mut sim = Simulation::new(
            grid,
            channels,
            self.hydrology.land_use.clone(),
            self.hydrology.soils.clone(),
        )?;
        sim.hydro_params = self.hydrology.parameters.clone();
        sim.outlets = self.hydrology.outlets.clone();
        sim.start_hours = self.general.start_hours;
        sim.end_hours = self.general.end_hours;
        sim.time_hours = self.general.start_hours;
        sim.controller = self.general.timestep.build(base)?;
        sim.env.latitude = self.general.latitude;
        sim.env.tzero = self.general.tzero_julian_day;

        if !self.hydrology.rainfall.is_empty() {
            let mut rain = EnvField::new(
                self.hydrology.rainfall.load(base)?,
                sim.grid.cell_count(),
            );
            if self.hydrology.rainfall_multiplier.file.is_some()
                || self.hydrology.rainfall_multiplier.uniform.is_some()
            {
                let mult = self
                    .hydrology
                    .rainfall_multiplier
                    .load(base, &sim.grid, 1.0)?;
                rain.multiplier = Some(mult.data().to_vec());
            }
            sim.rain = rain;
        }
        for inflow in &self.hydrology.channel_inflows {
            sim.channel_inflows.push(ChannelInflow {
                link: inflow.link,
                function: inflow.series.load(base)?,
            });
        }

        self.apply_environment(base, &mut sim)?;

        if let Some(solids_cfg) = &self.solids {
            let n_species = self.chemicals.as_ref().map_or(0, |c| c.species.len());
            let layer_specs: Vec<Layer> = solids_cfg
                .stack_layers
                .iter()
                .map(|l| {
                    Layer::spec(
                        l.thickness,
                        0.0,
                        0.0,
                        l.porosity,
                        l.solids.clone(),
                        if l.chems.is_empty() {
                            vec![0.0; n_species]
                        } else {
                            l.chems.clone()
                        },
                    )
                })
                .collect();
            sim.install_uniform_stacks(
                &layer_specs,
                solids_cfg.max_stack,
                solids_cfg.min_volume_factor,
                solids_cfg.max_volume_factor,
            )?;

            let mut state = SolidsState::new(
                solids_cfg.fractions.clone(),
                sim.grid.cell_count(),
                sim.channels.node_count().max(1),
                solids_cfg.max_stack + 1,
            );
            for (f, conc) in solids_cfg.initial_concentration.iter().enumerate() {
                for (r, c) in sim.grid.iter_domain() {
                    state.conc_ov.current.set(f, sim.grid.index(r, c), *conc);
                }
                for (_, _, loc) in sim.channels.iter_nodes() {
                    state.conc_ch.current.set(f, loc, *conc);
                }
            }
            sim.solids_params = solids_cfg.parameters.clone();
            sim.collapse_overland = solids_cfg.collapse_overland;
            sim.collapse_channel = solids_cfg.collapse_channel;
            sim.update_elevations = solids_cfg.update_elevations;
            for load in &solids_cfg.loads {
                sim.solids_loads.push(load.build(base)?);
            }
            for bc in &solids_cfg.boundaries {
                sim.solids_boundary.push(BoundaryConcentration {
                    link: bc.link,
                    series: bc.series,
                    function: bc.function.load(base)?,
                });
            }
            sim.enable_solids(state)?;
        }

        if let Some(chem_cfg) = &self.chemicals {
            let n_fractions = self.solids.as_ref().map_or(0, |s| s.fractions.len());
            let max_stack = self.solids.as_ref().map_or(1, |s| s.max_stack);
            let mut state = ChemicalState::new(
                chem_cfg.species.clone(),
                sim.grid.cell_count(),
                sim.channels.node_count().max(1),
                max_stack + 1,
                n_fractions,
            );
            for (s, conc) in chem_cfg.initial_concentration.iter().enumerate() {
                for (r, c) in sim.grid.iter_domain() {
                    state.conc_ov.current.set(s, sim.grid.index(r, c), *conc);
                }
                for (_, _, loc) in sim.channels.iter_nodes() {
                    state.conc_ch.current.set(s, loc, *conc);
                }
            }
            sim.chem_params = chem_cfg.parameters.clone();
            sim.yields = chem_cfg.yields.clone();
            for load in &chem_cfg.loads {
                sim.chem_loads.push(load.build(base)?);
            }
            for bc in &chem_cfg.boundaries {
                sim.chem_boundary.push(BoundaryConcentration {
                    link: bc.link,
                    series: bc.series,
                    function: bc.function.load(base)?,
                });
            }
            sim.enable_chemicals(state)?;
        }

        let mut output = OutputConfig::new(&self.outputs.directory);
        output.tabular = IntervalSchedule::constant(self.outputs.tabular_interval_hours);
        output.grids = IntervalSchedule::constant(self.outputs.grid_interval_hours);
        output.bed_chem_mg_kg = self.outputs.bed_chem_mg_kg;
        for station in &self.outputs.stations {
            let location = match (station.row, station.col, station.link, station.node) {
                (Some(row), Some(col), None, None) => LoadLocation::Cell { row, col },
                (None, None, Some(link), Some(node)) => LoadLocation::Node { link, node },
                _ => {
                    return Err(TrexError::Validation(format!(
                        "station '{}' needs either row/col or link/node",
                        station.name
                    )))
                }
            };
            output.stations.push(Station {
                name: station.name.clone(),
                location,
            });
        }

        Ok((sim, output))
    }

    /// A copy of this configuration with solids and chemicals removed,
    /// for the hydraulics-only relaunch pass.
    pub fn hydrology_only(&self) -> Self {
        let mut cfg = self.clone();
        cfg.solids = None;
        cfg.chemicals = None;
        cfg
    }

    fn build_grid(&self, base: &Path) -> Result<Grid> {
        let h = &self.hydrology;
        let mut grid = Grid::uniform(h.rows, h.cols, h.cell_size, 0.0);
        grid.elevation = h.elevation.load(base, &grid, 0.0)?;
        grid.slope = h.slope.load(base, &grid, 0.0)?;
        grid.aspect = h.aspect.load(base, &grid, 0.0)?;
        grid.sky_view = h.sky_view.load(base, &grid, 1.0)?;
        grid.albedo = h.albedo.load(base, &grid, 0.2)?;

        let mask = h.mask.load(base, &grid, 1.0)?;
        for r in 0..h.rows {
            for c in 0..h.cols {
                let value = mask.get(r, c);
                let cell = if value == grid.nodata || value <= 0.0 {
                    CellMask::OutOfDomain
                } else if value >= 2.0 {
                    CellMask::Channel
                } else {
                    CellMask::Overland
                };
                grid.mask.set(r, c, cell);
            }
        }

        let land = h.land_use_grid.load(base, &grid, 0.0)?;
        let soil = h.soil_grid.load(base, &grid, 0.0)?;
        for r in 0..h.rows {
            for c in 0..h.cols {
                let l = land.get(r, c).max(0.0) as usize;
                if l >= h.land_use.len() {
                    return Err(TrexError::Validation(format!(
                        "land-use id {} at ({}, {}) out of range",
                        l, r, c
                    )));
                }
                grid.land_use.set(r, c, l);
                let s = soil.get(r, c).max(0.0) as usize;
                if s >= h.soils.len() {
                    return Err(TrexError::Validation(format!(
                        "soil id {} at ({}, {}) out of range",
                        s, r, c
                    )));
                }
                grid.soil_type.set(r, c, s);
            }
        }
        Ok(grid)
    }

    fn build_channels(&self, grid: &Grid) -> Result<ChannelNetwork> {
        if self.hydrology.channels.is_empty() {
            return Ok(ChannelNetwork::empty());
        }
        let mut links = Vec::with_capacity(self.hydrology.channels.len());
        for link_cfg in &self.hydrology.channels {
            let mut nodes = Vec::with_capacity(link_cfg.nodes.len());
            let mut cells = Vec::with_capacity(link_cfg.nodes.len());
            for node in &link_cfg.nodes {
                let ground = grid.elevation.get(node.row, node.col);
                nodes.push(NodeGeometry {
                    bottom_width: node.bottom_width,
                    bank_height: node.bank_height,
                    side_slope: node.side_slope,
                    length: node.length,
                    manning_n: node.manning_n,
                    bed_slope: node.bed_slope,
                    bed_elevation: ground - node.bank_height,
                    sediment_type: node.sediment_type,
                });
                cells.push((node.row, node.col));
            }
            links.push(Link {
                nodes,
                cells,
                upstream: link_cfg
                    .upstream
                    .iter()
                    .map(|&(link, node)| Connection { link, node })
                    .collect(),
                downstream: link_cfg
                    .downstream
                    .iter()
                    .map(|&(link, node)| Connection { link, node })
                    .collect(),
            });
        }
        Ok(ChannelNetwork::new(links))
    }

    fn apply_environment(&self, base: &Path, sim: &mut Simulation) -> Result<()> {
        let env_cfg = &self.environment;
        let n_cells = sim.grid.cell_count();
        let n_nodes = sim.channels.node_count().max(1);
        let env = &mut sim.env;
        let mut apply =
            |source: &SeriesSource, ov: &mut EnvField, ch: &mut EnvField| -> Result<()> {
                if !source.is_empty() {
                    *ov = EnvField::new(source.load(base)?, n_cells);
                    *ch = EnvField::new(source.load(base)?, n_nodes);
                }
                Ok(())
            };
        apply(
            &env_cfg.air_temperature,
            &mut env.overland.air_temp,
            &mut env.channel.air_temp,
        )?;
        apply(
            &env_cfg.water_temperature,
            &mut env.overland.water_temp,
            &mut env.channel.water_temp,
        )?;
        apply(
            &env_cfg.bed_temperature,
            &mut env.overland.bed_temp,
            &mut env.channel.bed_temp,
        )?;
        apply(&env_cfg.doc, &mut env.overland.doc, &mut env.channel.doc)?;
        apply(&env_cfg.ph, &mut env.overland.ph, &mut env.channel.ph)?;
        apply(
            &env_cfg.hardness,
            &mut env.overland.hardness,
            &mut env.channel.hardness,
        )?;
        apply(
            &env_cfg.oxidant,
            &mut env.overland.oxidant,
            &mut env.channel.oxidant,
        )?;
        apply(
            &env_cfg.bacteria,
            &mut env.overland.bacteria,
            &mut env.channel.bacteria,
        )?;
        apply(
            &env_cfg.extinction,
            &mut env.overland.extinction,
            &mut env.channel.extinction,
        )?;
        apply(
            &env_cfg.user_property,
            &mut env.overland.user,
            &mut env.channel.user,
        )?;
        apply(&env_cfg.wind, &mut env.overland.wind, &mut env.channel.wind)?;
        apply(
            &env_cfg.cloud_cover,
            &mut env.overland.cloud,
            &mut env.channel.cloud,
        )?;
        if !env_cfg.fpoc.is_empty() {
            env.fpoc = env_cfg.fpoc.clone();
        } else if let Some(solids) = &self.solids {
            env.fpoc = vec![0.0; solids.fractions.len()];
        }
        Ok(())
    }
}
