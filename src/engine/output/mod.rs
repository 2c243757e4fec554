// ABOUTME: Output subsystem: tabular and grid schedules, end-of-run grids, mass-balance
// ABOUTME: ledger, summary and statistics files, restart set, and the simulation error file

pub mod ascii_grid;
pub mod restart;

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::engine::core::error::{Result, TrexError};
use crate::engine::core::grid::GridMap;
use crate::engine::core::timefunc::IntervalSchedule;
use crate::engine::core::units::g_m3_to_mg_kg;
use crate::engine::physics::forcing::LoadLocation;
use crate::engine::sim::{Simulation, StepSink};
use self::ascii_grid::{write_grid, GridHeader};

/// A reporting station bound to a cell or channel node.
#[derive(Clone, Debug)]
pub struct Station {
    pub name: String,
    pub location: LoadLocation,
}

/// Output configuration: two independent print schedules plus the
/// end-of-run artifact set.
#[derive(Clone, Debug)]
pub struct OutputConfig {
    pub directory: PathBuf,
    /// Tabular (time-series) print interval sequence (hours).
    pub tabular: IntervalSchedule,
    /// Grid print interval sequence (hours).
    pub grids: IntervalSchedule,
    pub stations: Vec<Station>,
    /// Report bed chemical concentrations as mg/kg instead of g/m3.
    pub bed_chem_mg_kg: bool,
    /// Restart grid prefix; None disables restart writing.
    pub restart_prefix: Option<PathBuf>,
}

impl OutputConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            tabular: IntervalSchedule::constant(0.25),
            grids: IntervalSchedule::constant(1.0),
            stations: Vec::new(),
            bed_chem_mg_kg: false,
            restart_prefix: None,
        }
    }
}

/// Streams the run's outputs on their schedules and emits the
/// end-of-run artifact set.
pub struct OutputWriter {
    config: OutputConfig,
    next_tabular: f64,
    next_grid: f64,
    grid_sequence: usize,
    water_series: Option<csv::Writer<fs::File>>,
    solids_series: Option<csv::Writer<fs::File>>,
    chem_series: Option<csv::Writer<fs::File>>,
    initial_bed_elevation: Option<GridMap<f64>>,
}

impl OutputWriter {
    pub fn new(config: OutputConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory)
            .map_err(|e| TrexError::io(&config.directory, e))?;
        Ok(Self {
            config,
            next_tabular: 0.0,
            next_grid: 0.0,
            grid_sequence: 0,
            water_series: None,
            solids_series: None,
            chem_series: None,
            initial_bed_elevation: None,
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.config.directory.join(name)
    }

    fn open_series(
        &self,
        name: &str,
        header: &[String],
    ) -> Result<csv::Writer<fs::File>> {
        let path = self.path(name);
        let file = fs::File::create(&path).map_err(|e| TrexError::io(&path, e))?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(header)
            .map_err(|e| TrexError::Config(format!("writing {}: {}", name, e)))?;
        Ok(writer)
    }

    fn write_tabular(&mut self, sim: &Simulation) -> Result<()> {
        let boundary = crate::engine::core::grid::Source::Boundary.index();
        if self.water_series.is_none() {
            let mut header = vec!["time_hours".to_string()];
            for s in &self.config.stations {
                header.push(format!("{}_depth_m", s.name));
                header.push(format!("{}_discharge_m3s", s.name));
            }
            self.water_series = Some(self.open_series("water.csv", &header)?);
            if sim.solids.is_some() {
                let mut header = vec!["time_hours".to_string()];
                let solids = sim.solids.as_ref().unwrap();
                for s in &self.config.stations {
                    for f in &solids.fractions {
                        header.push(format!("{}_{}_gm3", s.name, f.name));
                    }
                }
                self.solids_series = Some(self.open_series("solids.csv", &header)?);
            }
            if sim.chems.is_some() {
                let mut header = vec!["time_hours".to_string()];
                let chems = sim.chems.as_ref().unwrap();
                for s in &self.config.stations {
                    for c in &chems.species {
                        header.push(format!("{}_{}_total_gm3", s.name, c.name));
                        header.push(format!("{}_{}_dissolved_gm3", s.name, c.name));
                    }
                }
                self.chem_series = Some(self.open_series("chemicals.csv", &header)?);
            }
        }

        let mut row = vec![format!("{:.6}", sim.time_hours)];
        for station in &self.config.stations {
            let (depth, discharge) = match station.location {
                LoadLocation::Cell { row: r, col: c } => {
                    let loc = sim.grid.index(r, c);
                    (
                        sim.ov_water.depth.get(r, c),
                        sim.ov_water.outflow.sum(loc),
                    )
                }
                LoadLocation::Node { link, node } => {
                    let loc = sim.channels.node_index(link, node);
                    (
                        sim.ch_water.depth[loc],
                        sim.ch_water.outflow.get(loc, crate::engine::core::grid::Source::South.index())
                            + sim.ch_water.outflow.get(loc, boundary),
                    )
                }
            };
            row.push(format!("{:.6e}", depth));
            row.push(format!("{:.6e}", discharge));
        }
        let writer = self.water_series.as_mut().unwrap();
        writer
            .write_record(&row)
            .and_then(|_| writer.flush().map_err(csv::Error::from))
            .map_err(|e| TrexError::Config(format!("writing water.csv: {}", e)))?;

        if let (Some(solids), Some(writer)) = (&sim.solids, self.solids_series.as_mut()) {
            let mut row = vec![format!("{:.6}", sim.time_hours)];
            for station in &self.config.stations {
                let loc = station_loc_of(sim, station);
                for f in 0..solids.n_fractions() {
                    let conc = match station.location {
                        LoadLocation::Cell { .. } => solids.conc_ov.current.get(f, loc),
                        LoadLocation::Node { .. } => solids.conc_ch.current.get(f, loc),
                    };
                    row.push(format!("{:.6e}", conc));
                }
            }
            writer
                .write_record(&row)
                .and_then(|_| writer.flush().map_err(csv::Error::from))
                .map_err(|e| TrexError::Config(format!("writing solids.csv: {}", e)))?;
        }

        if let (Some(chems), Some(writer)) = (&sim.chems, self.chem_series.as_mut()) {
            let mut row = vec![format!("{:.6}", sim.time_hours)];
            for station in &self.config.stations {
                let loc = station_loc_of(sim, station);
                for s in 0..chems.n_species() {
                    let (total, dissolved) = match station.location {
                        LoadLocation::Cell { .. } => (
                            chems.conc_ov.current.get(s, loc),
                            chems.conc_ov.current.get(s, loc) * chems.phase_ov.dissolved(s, loc, 0),
                        ),
                        LoadLocation::Node { .. } => (
                            chems.conc_ch.current.get(s, loc),
                            chems.conc_ch.current.get(s, loc) * chems.phase_ch.dissolved(s, loc, 0),
                        ),
                    };
                    row.push(format!("{:.6e}", total));
                    row.push(format!("{:.6e}", dissolved));
                }
            }
            writer
                .write_record(&row)
                .and_then(|_| writer.flush().map_err(csv::Error::from))
                .map_err(|e| TrexError::Config(format!("writing chemicals.csv: {}", e)))?;
        }

        Ok(())
    }

    fn write_grids(&mut self, sim: &Simulation) -> Result<()> {
        self.grid_sequence += 1;
        let seq = self.grid_sequence;
        let header = GridHeader::of(&sim.grid);

        write_grid(&self.path(&format!("depth{}.asc", seq)), &header, &sim.ov_water.depth)?;

        if let Some(solids) = &sim.solids {
            let groups = group_count(solids.fractions.iter().map(|f| f.group));
            for g in 0..groups {
                let mut map = GridMap::new(sim.grid.rows, sim.grid.cols, sim.grid.nodata);
                for (r, c) in sim.grid.iter_domain() {
                    let loc = sim.grid.index(r, c);
                    let total: f64 = solids
                        .fractions
                        .iter()
                        .enumerate()
                        .filter(|(_, f)| f.group == g)
                        .map(|(i, _)| solids.conc_ov.current.get(i, loc))
                        .sum();
                    map.set(r, c, total);
                }
                write_grid(
                    &self.path(&format!("solids_g{}_{}.asc", g, seq)),
                    &header,
                    &map,
                )?;
            }
        }

        if let Some(chems) = &sim.chems {
            let groups = group_count(chems.species.iter().map(|s| s.group));
            for g in 0..groups {
                let mut water = GridMap::new(sim.grid.rows, sim.grid.cols, sim.grid.nodata);
                let mut bed = GridMap::new(sim.grid.rows, sim.grid.cols, sim.grid.nodata);
                for (r, c) in sim.grid.iter_domain() {
                    let loc = sim.grid.index(r, c);
                    let total: f64 = chems
                        .species
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.group == g)
                        .map(|(i, _)| chems.conc_ov.current.get(i, loc))
                        .sum();
                    water.set(r, c, total);
                    let surface = sim.stacks_ov[loc].surface();
                    let bed_total: f64 = chems
                        .species
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.group == g)
                        .map(|(i, _)| surface.chems[i])
                        .sum();
                    let value = if self.config.bed_chem_mg_kg {
                        g_m3_to_mg_kg(bed_total, surface.total_solids())
                    } else {
                        bed_total
                    };
                    bed.set(r, c, value);
                }
                write_grid(
                    &self.path(&format!("chem_g{}_water_{}.asc", g, seq)),
                    &header,
                    &water,
                )?;
                write_grid(
                    &self.path(&format!("chem_g{}_bed_{}.asc", g, seq)),
                    &header,
                    &bed,
                )?;
            }
        }

        Ok(())
    }

    fn write_end_grids(&self, sim: &Simulation) -> Result<()> {
        let Some(solids) = &sim.solids else {
            return Ok(());
        };
        let header = GridHeader::of(&sim.grid);
        let nodata = sim.grid.nodata;

        // net elevation change of the soil surface
        let mut elev_change = GridMap::new(sim.grid.rows, sim.grid.cols, nodata);
        if let Some(initial) = &self.initial_bed_elevation {
            for (r, c) in sim.grid.iter_domain() {
                let loc = sim.grid.index(r, c);
                elev_change.set(
                    r,
                    c,
                    sim.stacks_ov[loc].bed_elevation() - initial.get(r, c),
                );
            }
        }
        write_grid(&self.path("net_elevation_change.asc"), &header, &elev_change)?;

        let groups = group_count(solids.fractions.iter().map(|f| f.group));
        for g in 0..groups {
            let mut erosion = GridMap::new(sim.grid.rows, sim.grid.cols, nodata);
            let mut deposition = GridMap::new(sim.grid.rows, sim.grid.cols, nodata);
            let mut net = GridMap::new(sim.grid.rows, sim.grid.cols, nodata);
            for (r, c) in sim.grid.iter_domain() {
                let loc = sim.grid.index(r, c);
                let mut ers = 0.0;
                let mut dep = 0.0;
                for (f, fraction) in solids.fractions.iter().enumerate() {
                    if fraction.group != g {
                        continue;
                    }
                    for k in 0..=sim.stacks_ov[loc].max_stack() {
                        ers += solids.ledgers_ov.ers.outmass(f, loc, k);
                        dep += solids.ledgers_ov.dep.inmass(f, loc, k);
                    }
                }
                erosion.set(r, c, ers);
                deposition.set(r, c, dep);
                net.set(r, c, dep - ers);
            }
            write_grid(&self.path(&format!("gross_erosion_g{}.asc", g)), &header, &erosion)?;
            write_grid(
                &self.path(&format!("gross_deposition_g{}.asc", g)),
                &header,
                &deposition,
            )?;
            write_grid(&self.path(&format!("net_accumulation_g{}.asc", g)), &header, &net)?;
        }
        Ok(())
    }

    fn write_mass_balance(&self, sim: &Simulation) -> Result<()> {
        let mut out = String::new();
        out.push_str(&format!(
            "# mass balance ledger, written {}\n",
            chrono::Utc::now().to_rfc3339()
        ));
        out.push_str(
            "series,initial_kg,final_kg,external_in_kg,external_out_kg,reaction_in_kg,reaction_out_kg,residual_kg,relative_residual\n",
        );
        let mut lines = Vec::new();
        if let Some(solids) = &sim.solids {
            for f in 0..solids.n_fractions() {
                lines.push(sim.solids_balance_line(f));
            }
        }
        if let Some(chems) = &sim.chems {
            for s in 0..chems.n_species() {
                lines.push(sim.chem_balance_line(s));
            }
        }
        for line in &lines {
            if line.relative_residual() > 1.0e-3 {
                warn!(
                    "mass balance residual for {} exceeds tolerance: {:.3e} relative",
                    line.name,
                    line.relative_residual()
                );
            }
            out.push_str(&format!(
                "{},{:.6e},{:.6e},{:.6e},{:.6e},{:.6e},{:.6e},{:.6e},{:.6e}\n",
                line.name,
                line.initial_kg,
                line.final_kg,
                line.external_in_kg,
                line.external_out_kg,
                line.reaction_in_kg,
                line.reaction_out_kg,
                line.residual(),
                line.relative_residual(),
            ));
        }
        let path = self.path("massbalance.csv");
        fs::write(&path, out).map_err(|e| TrexError::io(&path, e))
    }

    fn write_summary(&self, sim: &Simulation) -> Result<()> {
        let mut out = String::new();
        out.push_str(&format!(
            "run finished {}\nsteps {}\nend time {:.6} h\n",
            chrono::Utc::now().to_rfc3339(),
            sim.steps_taken,
            sim.time_hours
        ));
        out.push_str(&format!(
            "peak outlet discharge {:.6e} m3/s at {:.4} h\n",
            sim.stats.peak_outlet_discharge.peak, sim.stats.peak_outlet_discharge.time
        ));
        out.push_str(&format!(
            "peak overland depth {:.6e} m at {:.4} h\n",
            sim.stats.peak_overland_depth.peak, sim.stats.peak_overland_depth.time
        ));
        out.push_str(&format!(
            "peak channel depth {:.6e} m at {:.4} h\n",
            sim.stats.peak_channel_depth.peak, sim.stats.peak_channel_depth.time
        ));
        if let Some(solids) = &sim.solids {
            for (f, fraction) in solids.fractions.iter().enumerate() {
                let peak = &sim.stats.peak_solids_conc[f];
                out.push_str(&format!(
                    "peak {} concentration {:.6e} g/m3 at {:.4} h\n",
                    fraction.name, peak.peak, peak.time
                ));
            }
        }
        if let Some(chems) = &sim.chems {
            for (s, species) in chems.species.iter().enumerate() {
                let peak = &sim.stats.peak_chem_conc[s];
                out.push_str(&format!(
                    "peak {} concentration {:.6e} g/m3 at {:.4} h\n",
                    species.name, peak.peak, peak.time
                ));
            }
        }
        for event in &sim.stack_events {
            out.push_str(&format!(
                "stack collapse at {} (time {:.4} h)\n",
                event.location, event.time_hours
            ));
        }
        let path = self.path("summary.txt");
        fs::write(&path, out).map_err(|e| TrexError::io(&path, e))
    }

    fn write_statistics(&self, sim: &Simulation) -> Result<()> {
        let mut out = String::new();
        out.push_str("variable,min,max\n");
        out.push_str(&format!(
            "overland_depth_m,{:.6e},{:.6e}\n",
            sim.ov_water.depth.min(),
            sim.ov_water.depth.max()
        ));
        if let Some(solids) = &sim.solids {
            for (f, fraction) in solids.fractions.iter().enumerate() {
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                for (r, c) in sim.grid.iter_domain() {
                    let v = solids.conc_ov.current.get(f, sim.grid.index(r, c));
                    min = min.min(v);
                    max = max.max(v);
                }
                out.push_str(&format!("{}_gm3,{:.6e},{:.6e}\n", fraction.name, min, max));
            }
        }
        let path = self.path("statistics.csv");
        fs::write(&path, out).map_err(|e| TrexError::io(&path, e))
    }

    fn write_dump(&self, sim: &Simulation) -> Result<()> {
        let mut out = String::new();
        out.push_str(&format!("# state dump at {:.6} h\n", sim.time_hours));
        for station in &self.config.stations {
            let loc = station_loc_of(sim, station);
            out.push_str(&format!("station {} (loc {})\n", station.name, loc));
            match station.location {
                LoadLocation::Cell { row, col } => {
                    out.push_str(&format!(
                        "  depth {:.6e} m, swe {:.6e} m, infiltration {:.6e} m\n",
                        sim.ov_water.depth.get(row, col),
                        sim.ov_water.swe.get(row, col),
                        sim.ov_water.infiltration_depth.get(row, col)
                    ));
                    let stack = &sim.stacks_ov[loc];
                    for k in (1..=stack.nstack()).rev() {
                        let layer = stack.layer(k);
                        out.push_str(&format!(
                            "  layer {}: volume {:.6e} m3, thickness {:.6e} m\n",
                            k, layer.volume, layer.thickness
                        ));
                    }
                }
                LoadLocation::Node { .. } => {
                    out.push_str(&format!("  depth {:.6e} m\n", sim.ch_water.depth[loc]));
                }
            }
        }
        let path = self.path("dump.txt");
        fs::write(&path, out).map_err(|e| TrexError::io(&path, e))
    }
}

impl OutputWriter {
    /// Step-length trace, reusable as the replay input of a later run.
    fn write_dt_trace(&self, sim: &Simulation) -> Result<()> {
        let mut out = String::with_capacity(sim.controller.trace().len() * 16);
        for (step, dt) in sim.controller.trace().iter().enumerate() {
            out.push_str(&format!("{},{:e}\n", step, dt));
        }
        let path = self.path("dt_trace.csv");
        fs::write(&path, out).map_err(|e| TrexError::io(&path, e))
    }
}

fn station_loc_of(sim: &Simulation, station: &Station) -> usize {
    match station.location {
        LoadLocation::Cell { row, col } => sim.grid.index(row, col),
        LoadLocation::Node { link, node } => sim.channels.node_index(link, node),
    }
}

fn group_count(groups: impl Iterator<Item = usize>) -> usize {
    groups.max().map_or(0, |g| g + 1)
}

impl StepSink for OutputWriter {
    fn on_step(&mut self, sim: &Simulation) -> Result<()> {
        if self.initial_bed_elevation.is_none() && sim.solids.is_some() {
            let mut initial = GridMap::new(sim.grid.rows, sim.grid.cols, sim.grid.nodata);
            for (r, c) in sim.grid.iter_domain() {
                initial.set(r, c, sim.stacks_ov[sim.grid.index(r, c)].bed_elevation());
            }
            self.initial_bed_elevation = Some(initial);
        }
        if sim.time_hours + 1.0e-9 >= self.next_tabular {
            self.write_tabular(sim)?;
            self.config.tabular.advance(sim.time_hours);
            self.next_tabular += self.config.tabular.current();
        }
        if sim.time_hours + 1.0e-9 >= self.next_grid {
            self.write_grids(sim)?;
            self.config.grids.advance(sim.time_hours);
            self.next_grid += self.config.grids.current();
        }
        Ok(())
    }

    fn on_finish(&mut self, sim: &Simulation) -> Result<()> {
        self.write_end_grids(sim)?;
        self.write_mass_balance(sim)?;
        self.write_summary(sim)?;
        self.write_statistics(sim)?;
        self.write_dump(sim)?;
        self.write_dt_trace(sim)?;
        if let Some(prefix) = self.config.restart_prefix.clone() {
            restart::write_restart(&prefix, sim)?;
        }
        Ok(())
    }
}

/// Write the simulation error file: the diagnostic plus run context.
pub fn write_error_file(path: &Path, err: &TrexError, time_hours: f64, dt: f64) {
    let body = format!(
        "simulation error at {:.6} h (dt {:.6} s)\n{}\n",
        time_hours, dt, err
    );
    if let Err(io_err) = fs::write(path, body) {
        warn!("could not write error file {}: {}", path.display(), io_err);
    }
}
