// ABOUTME: Restart serialization: per-layer state variables as ESRI ASCII grids
// ABOUTME: One grid per layer per variable; channel node values ride on their host cells

use std::path::{Path, PathBuf};

use crate::engine::core::error::Result;
use crate::engine::core::grid::GridMap;
use crate::engine::output::ascii_grid::{read_grid_checked, write_grid, GridHeader};
use crate::engine::sim::Simulation;

/// What to read back at startup. Restart files are always written at
/// the end of a run that asked for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartMode {
    /// Read nothing; write restart files at the end.
    WriteOnly,
    /// Read soil/sediment state only (no surface water).
    BedOnly,
    /// Read the full state including surface water.
    Full,
}

fn grid_path(prefix: &Path, var: &str) -> PathBuf {
    let mut name = prefix.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    name.push('_');
    name.push_str(var);
    name.push_str(".asc");
    prefix.with_file_name(name)
}

/// Write the complete restart grid set.
pub fn write_restart(prefix: &Path, sim: &Simulation) -> Result<()> {
    let grid = &sim.grid;
    let header = GridHeader::of(grid);

    write_grid(&grid_path(prefix, "ov_depth"), &header, &sim.ov_water.depth)?;
    write_grid(&grid_path(prefix, "ov_swe"), &header, &sim.ov_water.swe)?;
    write_grid(
        &grid_path(prefix, "ov_infiltration"),
        &header,
        &sim.ov_water.infiltration_depth,
    )?;

    if !sim.channels.is_empty() {
        let mut depth = GridMap::new(grid.rows, grid.cols, grid.nodata);
        for (l, n, loc) in sim.channels.iter_nodes() {
            let (r, c) = sim.channels.cell_of(l, n);
            depth.set(r, c, sim.ch_water.depth[loc]);
        }
        write_grid(&grid_path(prefix, "ch_depth"), &header, &depth)?;
    }

    if let Some(solids) = &sim.solids {
        for f in 0..solids.n_fractions() {
            let mut ov = GridMap::new(grid.rows, grid.cols, grid.nodata);
            for (r, c) in grid.iter_domain() {
                ov.set(r, c, solids.conc_ov.current.get(f, grid.index(r, c)));
            }
            write_grid(&grid_path(prefix, &format!("ov_solids_{}", f)), &header, &ov)?;
            if !sim.channels.is_empty() {
                let mut chg = GridMap::new(grid.rows, grid.cols, grid.nodata);
                for (l, n, loc) in sim.channels.iter_nodes() {
                    let (r, c) = sim.channels.cell_of(l, n);
                    chg.set(r, c, solids.conc_ch.current.get(f, loc));
                }
                write_grid(&grid_path(prefix, &format!("ch_solids_{}", f)), &header, &chg)?;
            }
        }
        write_stacks(prefix, sim, "soil", true, &header)?;
        if !sim.channels.is_empty() {
            write_stacks(prefix, sim, "sed", false, &header)?;
        }
    }

    if let Some(chems) = &sim.chems {
        for s in 0..chems.n_species() {
            let mut ov = GridMap::new(grid.rows, grid.cols, grid.nodata);
            for (r, c) in grid.iter_domain() {
                ov.set(r, c, chems.conc_ov.current.get(s, grid.index(r, c)));
            }
            write_grid(&grid_path(prefix, &format!("ov_chem_{}", s)), &header, &ov)?;
            if !sim.channels.is_empty() {
                let mut chg = GridMap::new(grid.rows, grid.cols, grid.nodata);
                for (l, n, loc) in sim.channels.iter_nodes() {
                    let (r, c) = sim.channels.cell_of(l, n);
                    chg.set(r, c, chems.conc_ch.current.get(s, loc));
                }
                write_grid(&grid_path(prefix, &format!("ch_chem_{}", s)), &header, &chg)?;
            }
        }
    }

    Ok(())
}

fn write_stacks(
    prefix: &Path,
    sim: &Simulation,
    tag: &str,
    overland: bool,
    header: &GridHeader,
) -> Result<()> {
    let grid = &sim.grid;
    let n_fractions = sim.solids.as_ref().map_or(0, |s| s.n_fractions());
    let n_species = sim.chems.as_ref().map_or(0, |c| c.n_species());
    let max_stack = stacks_of(sim, overland)
        .iter()
        .map(|s| s.max_stack())
        .max()
        .unwrap_or(1);

    let mut nstack = GridMap::new(grid.rows, grid.cols, grid.nodata);
    for_each_column(sim, overland, |r, c, stack| {
        nstack.set(r, c, stack.nstack() as f64);
    });
    write_grid(&grid_path(prefix, &format!("{}_nstack", tag)), header, &nstack)?;

    for k in 1..=max_stack {
        let mut volume = GridMap::new(grid.rows, grid.cols, grid.nodata);
        for_each_column(sim, overland, |r, c, stack| {
            if k <= stack.nstack() {
                volume.set(r, c, stack.layer(k).volume);
            }
        });
        write_grid(
            &grid_path(prefix, &format!("{}_vol_l{}", tag, k)),
            header,
            &volume,
        )?;
        for f in 0..n_fractions {
            let mut conc = GridMap::new(grid.rows, grid.cols, grid.nodata);
            for_each_column(sim, overland, |r, c, stack| {
                if k <= stack.nstack() {
                    conc.set(r, c, stack.layer(k).solids[f]);
                }
            });
            write_grid(
                &grid_path(prefix, &format!("{}_solids_{}_l{}", tag, f, k)),
                header,
                &conc,
            )?;
        }
        for s in 0..n_species {
            let mut conc = GridMap::new(grid.rows, grid.cols, grid.nodata);
            for_each_column(sim, overland, |r, c, stack| {
                if k <= stack.nstack() {
                    conc.set(r, c, stack.layer(k).chems[s]);
                }
            });
            write_grid(
                &grid_path(prefix, &format!("{}_chem_{}_l{}", tag, s, k)),
                header,
                &conc,
            )?;
        }
    }
    Ok(())
}

fn stacks_of(sim: &Simulation, overland: bool) -> &[crate::engine::core::stack::StackColumn] {
    if overland {
        &sim.stacks_ov
    } else {
        &sim.stacks_ch
    }
}

fn for_each_column<F: FnMut(usize, usize, &crate::engine::core::stack::StackColumn)>(
    sim: &Simulation,
    overland: bool,
    mut f: F,
) {
    if overland {
        for (r, c) in sim.grid.iter_domain() {
            f(r, c, &sim.stacks_ov[sim.grid.index(r, c)]);
        }
    } else {
        for (l, n, loc) in sim.channels.iter_nodes() {
            let (r, c) = sim.channels.cell_of(l, n);
            f(r, c, &sim.stacks_ch[loc]);
        }
    }
}

/// Read restart grids back into an initialized simulation. Bed state is
/// always read; surface water only in full mode.
pub fn read_restart(prefix: &Path, sim: &mut Simulation, mode: RestartMode) -> Result<()> {
    if mode == RestartMode::WriteOnly {
        return Ok(());
    }

    let n_fractions = sim.solids.as_ref().map_or(0, |s| s.n_fractions());
    let n_species = sim.chems.as_ref().map_or(0, |c| c.n_species());

    if sim.solids.is_some() {
        read_stacks(prefix, sim, "soil", true, n_fractions, n_species)?;
        if !sim.channels.is_empty() {
            read_stacks(prefix, sim, "sed", false, n_fractions, n_species)?;
        }
    }

    if mode == RestartMode::Full {
        let depth = read_grid_checked(&grid_path(prefix, "ov_depth"), &sim.grid)?;
        let swe = read_grid_checked(&grid_path(prefix, "ov_swe"), &sim.grid)?;
        let inf = read_grid_checked(&grid_path(prefix, "ov_infiltration"), &sim.grid)?;
        for (r, c) in sim.grid.iter_domain() {
            sim.ov_water.depth.set(r, c, depth.get(r, c).max(0.0));
            sim.ov_water.swe.set(r, c, swe.get(r, c).max(0.0));
            sim.ov_water
                .infiltration_depth
                .set(r, c, inf.get(r, c).max(0.0));
        }
        if !sim.channels.is_empty() {
            let ch_depth = read_grid_checked(&grid_path(prefix, "ch_depth"), &sim.grid)?;
            for (l, n, loc) in sim.channels.iter_nodes() {
                let (r, c) = sim.channels.cell_of(l, n);
                sim.ch_water.depth[loc] = ch_depth.get(r, c).max(0.0);
            }
        }
        for f in 0..n_fractions {
            let ov = read_grid_checked(&grid_path(prefix, &format!("ov_solids_{}", f)), &sim.grid)?;
            let solids = sim.solids.as_mut().expect("solids enabled");
            for r in 0..ov.rows() {
                for c in 0..ov.cols() {
                    let loc = r * ov.cols() + c;
                    let v = ov.get(r, c);
                    if v != sim.grid.nodata {
                        solids.conc_ov.current.set(f, loc, v.max(0.0));
                    }
                }
            }
            if !sim.channels.is_empty() {
                let chg =
                    read_grid_checked(&grid_path(prefix, &format!("ch_solids_{}", f)), &sim.grid)?;
                let solids = sim.solids.as_mut().expect("solids enabled");
                for (l, n, loc) in sim.channels.iter_nodes() {
                    let (r, c) = sim.channels.cell_of(l, n);
                    solids.conc_ch.current.set(f, loc, chg.get(r, c).max(0.0));
                }
            }
        }
        for s in 0..n_species {
            let ov = read_grid_checked(&grid_path(prefix, &format!("ov_chem_{}", s)), &sim.grid)?;
            let chems = sim.chems.as_mut().expect("chemicals enabled");
            for r in 0..ov.rows() {
                for c in 0..ov.cols() {
                    let loc = r * ov.cols() + c;
                    let v = ov.get(r, c);
                    if v != sim.grid.nodata {
                        chems.conc_ov.current.set(s, loc, v.max(0.0));
                    }
                }
            }
            if !sim.channels.is_empty() {
                let chg =
                    read_grid_checked(&grid_path(prefix, &format!("ch_chem_{}", s)), &sim.grid)?;
                let chems = sim.chems.as_mut().expect("chemicals enabled");
                for (l, n, loc) in sim.channels.iter_nodes() {
                    let (r, c) = sim.channels.cell_of(l, n);
                    chems.conc_ch.current.set(s, loc, chg.get(r, c).max(0.0));
                }
            }
        }
    }

    Ok(())
}

fn read_stacks(
    prefix: &Path,
    sim: &mut Simulation,
    tag: &str,
    overland: bool,
    n_fractions: usize,
    n_species: usize,
) -> Result<()> {
    let nstack_grid = read_grid_checked(&grid_path(prefix, &format!("{}_nstack", tag)), &sim.grid)?;
    let max_stack = if overland {
        sim.stacks_ov.iter().map(|s| s.max_stack()).max().unwrap_or(1)
    } else {
        sim.stacks_ch.iter().map(|s| s.max_stack()).max().unwrap_or(1)
    };

    let mut volumes = Vec::with_capacity(max_stack);
    let mut solids_grids = Vec::with_capacity(max_stack);
    let mut chem_grids = Vec::with_capacity(max_stack);
    for k in 1..=max_stack {
        volumes.push(read_grid_checked(
            &grid_path(prefix, &format!("{}_vol_l{}", tag, k)),
            &sim.grid,
        )?);
        let mut per_fraction = Vec::with_capacity(n_fractions);
        for f in 0..n_fractions {
            per_fraction.push(read_grid_checked(
                &grid_path(prefix, &format!("{}_solids_{}_l{}", tag, f, k)),
                &sim.grid,
            )?);
        }
        solids_grids.push(per_fraction);
        let mut per_species = Vec::with_capacity(n_species);
        for s in 0..n_species {
            per_species.push(read_grid_checked(
                &grid_path(prefix, &format!("{}_chem_{}_l{}", tag, s, k)),
                &sim.grid,
            )?);
        }
        chem_grids.push(per_species);
    }

    let nodata = sim.grid.nodata;
    if overland {
        let cells: Vec<(usize, usize)> = sim.grid.iter_domain().collect();
        for (r, c) in cells {
            let loc = sim.grid.index(r, c);
            restore_column(
                &mut sim.stacks_ov[loc],
                r,
                c,
                nodata,
                &nstack_grid,
                &volumes,
                &solids_grids,
                &chem_grids,
            );
        }
    } else {
        let nodes: Vec<(usize, usize, usize)> = sim.channels.iter_nodes().collect();
        for (l, n, loc) in nodes {
            let (r, c) = sim.channels.cell_of(l, n);
            restore_column(
                &mut sim.stacks_ch[loc],
                r,
                c,
                nodata,
                &nstack_grid,
                &volumes,
                &solids_grids,
                &chem_grids,
            );
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn restore_column(
    stack: &mut crate::engine::core::stack::StackColumn,
    r: usize,
    c: usize,
    nodata: f64,
    nstack_grid: &GridMap<f64>,
    volumes: &[GridMap<f64>],
    solids_grids: &[Vec<GridMap<f64>>],
    chem_grids: &[Vec<GridMap<f64>>],
) {
    let nstack = nstack_grid.get(r, c);
    if nstack == nodata || nstack < 1.0 {
        return;
    }
    let nstack = (nstack as usize).min(stack.max_stack());
    let mut vols = Vec::with_capacity(nstack);
    let mut sols = Vec::with_capacity(nstack);
    let mut chms = Vec::with_capacity(nstack);
    for k in 1..=nstack {
        vols.push(volumes[k - 1].get(r, c).max(0.0));
        sols.push(
            solids_grids[k - 1]
                .iter()
                .map(|g| g.get(r, c).max(0.0))
                .collect(),
        );
        chms.push(
            chem_grids[k - 1]
                .iter()
                .map(|g| g.get(r, c).max(0.0))
                .collect(),
        );
    }
    stack.restore(&vols, &sols, &chms);
}
