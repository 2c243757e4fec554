// ABOUTME: Solids transport: deposition, erosion (USLE / excess shear / transport capacity),
// ABOUTME: advection, dispersion, floodplain transfer, and the solids concentration balance

use serde::{Deserialize, Serialize};

use crate::engine::core::channel::ChannelNetwork;
use crate::engine::core::error::{Location, Result, TrexError};
use crate::engine::core::grid::{Grid, Source};
use crate::engine::core::stack::StackColumn;
use crate::engine::core::units::{kg_per_day_to_g_per_second, WATER_DENSITY_G_M3};
use crate::engine::physics::forcing::{BoundaryConcentration, LoadKind, LoadLocation, MassLoad};
use crate::engine::physics::hydrology::{LandClass, MIN_DEPTH};
use crate::engine::physics::solids::{BedMaterial, ErosionScheme, SolidsState};
use crate::engine::physics::water::{ChannelWater, OverlandWater};

/// Tiny water volume below which a column is treated as dried out (m3).
const MIN_VOLUME: f64 = 1.0e-9;
/// Concentrations below this magnitude are clamped instead of fatal.
const CONC_TOLERANCE: f64 = 1.0e-9;

/// Stage-wide solids transport parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolidsParameters {
    /// Scale factor on every advective flux.
    #[serde(default = "default_one")]
    pub advection_scale: f64,
    /// Overland dispersion coefficient (m2/s).
    #[serde(default)]
    pub dispersion_overland: f64,
    /// Channel longitudinal dispersion coefficient (m2/s).
    #[serde(default)]
    pub dispersion_channel: f64,
    /// USLE detachment coefficient (g/m2/s at 1 mm/h intensity).
    #[serde(default)]
    pub usle_alpha: f64,
    /// Exponent on rainfall intensity in the USLE detachment rate.
    #[serde(default = "default_usle_beta")]
    pub usle_beta: f64,
}

fn default_one() -> f64 {
    1.0
}

fn default_usle_beta() -> f64 {
    2.0
}

impl Default for SolidsParameters {
    fn default() -> Self {
        Self {
            advection_scale: 1.0,
            dispersion_overland: 0.0,
            dispersion_channel: 0.0,
            usle_alpha: 0.0,
            usle_beta: 2.0,
        }
    }
}

/// Static references threaded through the solids stages.
pub struct SolidsContext<'a> {
    pub grid: &'a Grid,
    pub channels: &'a ChannelNetwork,
    pub land: &'a [LandClass],
    pub soils: &'a [BedMaterial],
    pub params: &'a SolidsParameters,
}

/// Probability of deposition: the shear correction on the quiescent
/// settling velocity.
fn p_dep(shear: f64, tau_cd: f64) -> f64 {
    if tau_cd > 0.0 {
        (1.0 - shear / tau_cd).max(0.0)
    } else {
        1.0
    }
}

/// Excess-shear erosion rate (g/m2/s) for one fraction.
fn excess_shear_rate(
    material: &BedMaterial,
    tau: f64,
    tau_ce: f64,
    aging: f64,
) -> f64 {
    if tau_ce <= 0.0 || tau <= tau_ce {
        return 0.0;
    }
    material.erosion_yield * (tau / tau_ce - 1.0).powf(material.erosion_exponent) * aging
}

/// Compute all solids transport rates for the step from current-state
/// concentrations and the water-transport flows.
#[allow(clippy::too_many_arguments)]
pub fn solids_transport(
    ctx: &SolidsContext,
    solids: &mut SolidsState,
    stacks_ov: &[StackColumn],
    stacks_ch: &[StackColumn],
    ov: &OverlandWater,
    ch: &ChannelWater,
    loads: &mut [MassLoad],
    boundary: &mut [BoundaryConcentration],
    time_hours: f64,
    dt: f64,
) {
    solids.ledgers_ov.clear_fluxes();
    solids.ledgers_ch.clear_fluxes();

    apply_loads(ctx, solids, ov, loads, time_hours);
    apply_boundary_concentrations(ctx, solids, ch, boundary, time_hours);
    overland_advection(ctx, solids, ov);
    overland_dispersion(ctx, solids, ov);
    overland_deposition_erosion(ctx, solids, stacks_ov, ov, time_hours, dt);
    if !ctx.channels.is_empty() {
        channel_advection(ctx, solids, ch);
        channel_dispersion(ctx, solids, ch);
        channel_deposition_erosion(ctx, solids, stacks_ch, ch, time_hours, dt);
        floodplain_transfer(ctx, solids, ov, ch);
    }
}

fn apply_loads(
    ctx: &SolidsContext,
    solids: &mut SolidsState,
    ov: &OverlandWater,
    loads: &mut [MassLoad],
    time_hours: f64,
) {
    let grid = ctx.grid;
    for load in loads.iter_mut() {
        let value = load.value(time_hours);
        if value <= 0.0 {
            continue;
        }
        match load.location {
            LoadLocation::Cell { row, col } => {
                let loc = grid.index(row, col);
                let rate = match load.kind {
                    LoadKind::MassRate => kg_per_day_to_g_per_second(value),
                    LoadKind::Concentration => {
                        value * ov.net_rain_rate.get(row, col) * grid.cell_area()
                    }
                };
                solids
                    .ledgers_ov
                    .load
                    .add_influx(load.series, loc, Source::Point.index(), rate);
            }
            LoadLocation::Node { link, node } => {
                let loc = ctx.channels.node_index(link, node);
                let rate = match load.kind {
                    LoadKind::MassRate => kg_per_day_to_g_per_second(value),
                    LoadKind::Concentration => 0.0,
                };
                solids
                    .ledgers_ch
                    .load
                    .add_influx(load.series, loc, Source::Point.index(), rate);
            }
        }
    }
}

fn apply_boundary_concentrations(
    ctx: &SolidsContext,
    solids: &mut SolidsState,
    ch: &ChannelWater,
    boundary: &mut [BoundaryConcentration],
    time_hours: f64,
) {
    if ctx.channels.is_empty() {
        return;
    }
    for bc in boundary.iter_mut() {
        let conc = bc.value(time_hours);
        let loc = ctx.channels.node_index(bc.link, 0);
        let q = ch.inflow.get(loc, Source::Boundary.index());
        if q > 0.0 && conc > 0.0 {
            solids
                .ledgers_ch
                .adv
                .add_influx(bc.series, loc, Source::Boundary.index(), q * conc);
        }
    }
}

fn overland_advection(ctx: &SolidsContext, solids: &mut SolidsState, ov: &OverlandWater) {
    let grid = ctx.grid;
    let scale = ctx.params.advection_scale;
    let n_fractions = solids.n_fractions();
    for (r, c) in grid.iter_domain() {
        let loc = grid.index(r, c);
        for s in 0..n_fractions {
            let conc = solids.conc_ov.current.get(s, loc);
            if conc <= 0.0 {
                continue;
            }
            for dir in Source::COMPASS {
                let q = ov.outflow.get(loc, dir.index());
                if q > 0.0 {
                    let flux = q * conc * scale;
                    solids.ledgers_ov.adv.add_outflux(s, loc, dir.index(), flux);
                    if let Some((nr, nc)) = grid.neighbor(r, c, dir) {
                        solids.ledgers_ov.adv.add_influx(
                            s,
                            grid.index(nr, nc),
                            dir.opposite().index(),
                            flux,
                        );
                    }
                }
            }
            let qb = ov.outflow.get(loc, Source::Boundary.index());
            if qb > 0.0 {
                solids
                    .ledgers_ov
                    .adv
                    .add_outflux(s, loc, Source::Boundary.index(), qb * conc * scale);
            }
        }
    }
}

/// Forward half of the compass, so each neighbor pair is visited once.
const FORWARD: [Source; 4] = [
    Source::East,
    Source::Southeast,
    Source::South,
    Source::Southwest,
];

fn overland_dispersion(ctx: &SolidsContext, solids: &mut SolidsState, ov: &OverlandWater) {
    let d = ctx.params.dispersion_overland;
    if d <= 0.0 {
        return;
    }
    let grid = ctx.grid;
    let w = grid.cell_size;
    for (r, c) in grid.iter_domain() {
        let loc = grid.index(r, c);
        let depth = ov.depth.get(r, c);
        if depth <= MIN_DEPTH {
            continue;
        }
        for dir in FORWARD {
            let Some((nr, nc)) = grid.neighbor(r, c, dir) else {
                continue;
            };
            let nbr = grid.index(nr, nc);
            let nbr_depth = ov.depth.get(nr, nc);
            if nbr_depth <= MIN_DEPTH {
                continue;
            }
            let dist = w * dir.distance_factor();
            let interface = 0.5 * (depth + nbr_depth) * (w / dir.distance_factor());
            for s in 0..solids.n_fractions() {
                let delta = solids.conc_ov.current.get(s, loc)
                    - solids.conc_ov.current.get(s, nbr);
                let flux = d * delta / dist * interface;
                if flux > 0.0 {
                    solids.ledgers_ov.dsp.add_outflux(s, loc, dir.index(), flux);
                    solids
                        .ledgers_ov
                        .dsp
                        .add_influx(s, nbr, dir.opposite().index(), flux);
                } else if flux < 0.0 {
                    solids
                        .ledgers_ov
                        .dsp
                        .add_outflux(s, nbr, dir.opposite().index(), -flux);
                    solids.ledgers_ov.dsp.add_influx(s, loc, dir.index(), -flux);
                }
            }
        }
    }
}

fn overland_deposition_erosion(
    ctx: &SolidsContext,
    solids: &mut SolidsState,
    stacks: &[StackColumn],
    ov: &OverlandWater,
    time_hours: f64,
    dt: f64,
) {
    let grid = ctx.grid;
    let area = grid.cell_area();
    for (r, c) in grid.iter_domain() {
        let loc = grid.index(r, c);
        let depth = ov.depth.get(r, c);
        let shear = ov.shear.get(r, c);
        let stack = &stacks[loc];
        let surface_layer = stack.nstack();
        let surface = stack.surface();
        let material = &ctx.soils[grid.soil_type.get(r, c)];

        solids.aging_ov.update_peak(loc, shear, time_hours);

        // deposition: effective settling under the shear correction
        if depth > MIN_DEPTH {
            let water_volume = depth * area;
            for (s, fraction) in solids.fractions.iter().enumerate() {
                let conc = solids.conc_ov.current.get(s, loc);
                if conc <= 0.0 {
                    continue;
                }
                let rate = fraction.settling_velocity * p_dep(shear, fraction.tau_cd);
                let flux = (rate * conc * area).min(conc * water_volume / dt);
                if flux > 0.0 {
                    solids.ledgers_ov.dep.add_outflux(s, loc, 0, flux);
                    solids
                        .ledgers_ov
                        .dep
                        .add_influx(s, loc, surface_layer, flux);
                }
            }
        }

        // erosion per the material's scheme, partitioned over fractions
        // by the surface layer's grain-size distribution
        let total_surface = surface.total_solids();
        if total_surface <= 0.0 {
            continue;
        }
        let detachment = match material.erosion_scheme {
            ErosionScheme::Usle => {
                let intensity_mmh = ov.net_rain_rate.get(r, c) * 3.6e6;
                if intensity_mmh <= 0.0 || ctx.params.usle_alpha <= 0.0 {
                    0.0
                } else {
                    let land = &ctx.land[grid.land_use.get(r, c)];
                    ctx.params.usle_alpha
                        * material.usle_k
                        * land.usle_c
                        * land.usle_p
                        * intensity_mmh.powf(ctx.params.usle_beta)
                }
            }
            _ => 0.0,
        };

        for (s, fraction) in solids.fractions.iter().enumerate() {
            let share = surface.solids[s] / total_surface;
            if share <= 0.0 {
                continue;
            }
            let rate = match material.erosion_scheme {
                ErosionScheme::Usle => detachment,
                ErosionScheme::ExcessShear => {
                    let aging = solids.aging_ov.factor(loc, fraction.aging_rate, time_hours);
                    excess_shear_rate(material, shear, fraction.tau_ce, aging)
                }
                ErosionScheme::TransportCapacity => {
                    if depth <= MIN_DEPTH || fraction.settling_velocity <= 0.0 {
                        0.0
                    } else {
                        let velocity =
                            compass_outflow(ov, loc) / (depth * grid.cell_size).max(1.0e-12);
                        let capacity = material.transport_capacity_coeff
                            * velocity
                            * ov.friction_slope.get(r, c)
                            / fraction.settling_velocity;
                        let deficit = capacity - solids.conc_ov.current.get(s, loc);
                        (deficit * fraction.settling_velocity).max(0.0)
                    }
                }
            };
            if rate <= 0.0 {
                continue;
            }
            let available = surface.solids[s] * surface.volume / dt;
            let flux = (rate * area * share).min(available);
            if flux > 0.0 {
                solids
                    .ledgers_ov
                    .ers
                    .add_outflux(s, loc, surface_layer, flux);
                solids.ledgers_ov.ers.add_influx(s, loc, 0, flux);
            }
        }
    }
}

fn compass_outflow(ov: &OverlandWater, loc: usize) -> f64 {
    Source::COMPASS
        .iter()
        .map(|d| ov.outflow.get(loc, d.index()))
        .sum()
}

fn channel_advection(ctx: &SolidsContext, solids: &mut SolidsState, ch: &ChannelWater) {
    let scale = ctx.params.advection_scale;
    for (l, link) in ctx.channels.links.iter().enumerate() {
        for n_idx in 0..link.nodes.len() {
            let loc = ctx.channels.node_index(l, n_idx);
            for s in 0..solids.n_fractions() {
                let conc = solids.conc_ch.current.get(s, loc);
                if conc <= 0.0 {
                    continue;
                }
                let q_down = ch.outflow.get(loc, Source::South.index());
                if q_down > 0.0 {
                    let flux = q_down * conc * scale;
                    solids
                        .ledgers_ch
                        .adv
                        .add_outflux(s, loc, Source::South.index(), flux);
                    if n_idx + 1 < link.nodes.len() {
                        let next = ctx.channels.node_index(l, n_idx + 1);
                        solids
                            .ledgers_ch
                            .adv
                            .add_influx(s, next, Source::North.index(), flux);
                    } else {
                        let share = flux / link.downstream.len().max(1) as f64;
                        for conn in &link.downstream {
                            let next = ctx.channels.node_index(conn.link, conn.node);
                            solids
                                .ledgers_ch
                                .adv
                                .add_influx(s, next, Source::North.index(), share);
                        }
                    }
                }
                let q_out = ch.outflow.get(loc, Source::Boundary.index());
                if q_out > 0.0 {
                    solids.ledgers_ch.adv.add_outflux(
                        s,
                        loc,
                        Source::Boundary.index(),
                        q_out * conc * scale,
                    );
                }
            }
        }
    }
}

fn channel_dispersion(ctx: &SolidsContext, solids: &mut SolidsState, ch: &ChannelWater) {
    let d = ctx.params.dispersion_channel;
    if d <= 0.0 {
        return;
    }
    for (l, link) in ctx.channels.links.iter().enumerate() {
        for n_idx in 0..link.nodes.len().saturating_sub(1) {
            let loc = ctx.channels.node_index(l, n_idx);
            let next = ctx.channels.node_index(l, n_idx + 1);
            let node = &link.nodes[n_idx];
            let next_node = &link.nodes[n_idx + 1];
            if ch.depth[loc] <= MIN_DEPTH || ch.depth[next] <= MIN_DEPTH {
                continue;
            }
            let interface =
                0.5 * (node.flow_area(ch.depth[loc]) + next_node.flow_area(ch.depth[next]));
            let dist = 0.5 * (node.length + next_node.length);
            for s in 0..solids.n_fractions() {
                let delta =
                    solids.conc_ch.current.get(s, loc) - solids.conc_ch.current.get(s, next);
                let flux = d * delta / dist * interface;
                if flux > 0.0 {
                    solids
                        .ledgers_ch
                        .dsp
                        .add_outflux(s, loc, Source::South.index(), flux);
                    solids
                        .ledgers_ch
                        .dsp
                        .add_influx(s, next, Source::North.index(), flux);
                } else if flux < 0.0 {
                    solids
                        .ledgers_ch
                        .dsp
                        .add_outflux(s, next, Source::North.index(), -flux);
                    solids
                        .ledgers_ch
                        .dsp
                        .add_influx(s, loc, Source::South.index(), -flux);
                }
            }
        }
    }
}

fn channel_deposition_erosion(
    ctx: &SolidsContext,
    solids: &mut SolidsState,
    stacks: &[StackColumn],
    ch: &ChannelWater,
    time_hours: f64,
    dt: f64,
) {
    for (l, n_idx, loc) in ctx.channels.iter_nodes() {
        let node = ctx.channels.node(l, n_idx);
        let depth = ch.depth[loc];
        let shear = ch.shear[loc];
        let stack = &stacks[loc];
        let surface_layer = stack.nstack();
        let surface = stack.surface();
        let material = &ctx.soils[node.sediment_type];
        let bed_area = surface.area;

        solids.aging_ch.update_peak(loc, shear, time_hours);

        if depth > MIN_DEPTH {
            let water_volume = node.water_volume(depth);
            for (s, fraction) in solids.fractions.iter().enumerate() {
                let conc = solids.conc_ch.current.get(s, loc);
                if conc <= 0.0 {
                    continue;
                }
                let rate = fraction.settling_velocity * p_dep(shear, fraction.tau_cd);
                let flux = (rate * conc * bed_area).min(conc * water_volume / dt);
                if flux > 0.0 {
                    solids.ledgers_ch.dep.add_outflux(s, loc, 0, flux);
                    solids
                        .ledgers_ch
                        .dep
                        .add_influx(s, loc, surface_layer, flux);
                }
            }
        }

        let total_surface = surface.total_solids();
        if total_surface <= 0.0 {
            continue;
        }
        for (s, fraction) in solids.fractions.iter().enumerate() {
            let share = surface.solids[s] / total_surface;
            if share <= 0.0 {
                continue;
            }
            let rate = match material.erosion_scheme {
                // rainfall detachment has no channel counterpart; treat
                // USLE-configured bed types as shear-driven
                ErosionScheme::Usle | ErosionScheme::ExcessShear => {
                    let aging = solids.aging_ch.factor(loc, fraction.aging_rate, time_hours);
                    excess_shear_rate(material, shear, fraction.tau_ce, aging)
                }
                ErosionScheme::TransportCapacity => {
                    if depth <= MIN_DEPTH || fraction.settling_velocity <= 0.0 {
                        0.0
                    } else {
                        let flow_area = node.flow_area(depth);
                        let velocity = ch.outflow.get(loc, Source::South.index())
                            .max(ch.outflow.get(loc, Source::Boundary.index()))
                            / flow_area.max(1.0e-12);
                        let capacity = material.transport_capacity_coeff
                            * velocity
                            * ch.friction_slope[loc]
                            / fraction.settling_velocity;
                        let deficit = capacity - solids.conc_ch.current.get(s, loc);
                        (deficit * fraction.settling_velocity).max(0.0)
                    }
                }
            };
            if rate <= 0.0 {
                continue;
            }
            let available = surface.solids[s] * surface.volume / dt;
            let flux = (rate * bed_area * share).min(available);
            if flux > 0.0 {
                solids
                    .ledgers_ch
                    .ers
                    .add_outflux(s, loc, surface_layer, flux);
                solids.ledgers_ch.ers.add_influx(s, loc, 0, flux);
            }
        }
    }
}

fn floodplain_transfer(
    ctx: &SolidsContext,
    solids: &mut SolidsState,
    ov: &OverlandWater,
    ch: &ChannelWater,
) {
    let fp = Source::Floodplain.index();
    for (l, n_idx, loc) in ctx.channels.iter_nodes() {
        let (r, c) = ctx.channels.cell_of(l, n_idx);
        let cell_loc = ctx.grid.index(r, c);
        let q_to_channel = ov.outflow.get(cell_loc, fp);
        let q_to_plain = ch.outflow.get(loc, fp);
        for s in 0..solids.n_fractions() {
            if q_to_channel > 0.0 {
                let flux = q_to_channel * solids.conc_ov.current.get(s, cell_loc);
                if flux > 0.0 {
                    solids.ledgers_ov.adv.add_outflux(s, cell_loc, fp, flux);
                    solids.ledgers_ch.adv.add_influx(s, loc, fp, flux);
                }
            }
            if q_to_plain > 0.0 {
                let flux = q_to_plain * solids.conc_ch.current.get(s, loc);
                if flux > 0.0 {
                    solids.ledgers_ch.adv.add_outflux(s, loc, fp, flux);
                    solids.ledgers_ov.adv.add_influx(s, cell_loc, fp, flux);
                }
            }
        }
    }
}

/// Assemble the new water-column concentrations and surface-layer
/// volumes from the step's fluxes, then fold the fluxes into the
/// cumulative mass ledgers.
#[allow(clippy::too_many_arguments)]
pub fn solids_balance(
    ctx: &SolidsContext,
    solids: &mut SolidsState,
    stacks_ov: &mut [StackColumn],
    stacks_ch: &mut [StackColumn],
    ov: &OverlandWater,
    ch: &ChannelWater,
    time_hours: f64,
    dt: f64,
) -> Result<()> {
    let grid = ctx.grid;
    let area = grid.cell_area();

    for (r, c) in grid.iter_domain() {
        let loc = grid.index(r, c);
        let volume = ov.depth.get(r, c) * area;
        let new_volume = ov.depth_new.get(r, c) * area;
        let location = Location::Cell { row: r, col: c };
        column_balance(
            solids,
            DomainSide::Overland,
            loc,
            volume,
            new_volume,
            &mut stacks_ov[loc],
            location,
            time_hours,
            dt,
        )?;
    }

    for (l, n_idx, loc) in ctx.channels.iter_nodes() {
        let node = ctx.channels.node(l, n_idx);
        let volume = node.water_volume(ch.depth[loc]);
        let new_volume = node.water_volume(ch.depth_new[loc]);
        let (row, col) = ctx.channels.cell_of(l, n_idx);
        let location = Location::Node {
            link: l,
            node: n_idx,
            row,
            col,
        };
        column_balance(
            solids,
            DomainSide::Channel,
            loc,
            volume,
            new_volume,
            &mut stacks_ch[loc],
            location,
            time_hours,
            dt,
        )?;
    }

    solids.ledgers_ov.settle(dt);
    solids.ledgers_ch.settle(dt);
    Ok(())
}

#[derive(Clone, Copy)]
enum DomainSide {
    Overland,
    Channel,
}

#[allow(clippy::too_many_arguments)]
fn column_balance(
    solids: &mut SolidsState,
    side: DomainSide,
    loc: usize,
    volume: f64,
    new_volume: f64,
    stack: &mut StackColumn,
    location: Location,
    time_hours: f64,
    dt: f64,
) -> Result<()> {
    let n_fractions = solids.fractions.len();
    let surface_layer = stack.nstack();
    let (conc, ledgers) = match side {
        DomainSide::Overland => (&mut solids.conc_ov, &mut solids.ledgers_ov),
        DomainSide::Channel => (&mut solids.conc_ch, &mut solids.ledgers_ch),
    };

    // water column (layer 0)
    for s in 0..n_fractions {
        let influx = ledgers.adv.influx_sum(s, loc)
            + ledgers.dsp.influx_sum(s, loc)
            + ledgers.load.influx_sum(s, loc)
            + ledgers.ers.influx(s, loc, 0);
        let outflux = ledgers.adv.outflux_sum(s, loc)
            + ledgers.dsp.outflux_sum(s, loc)
            + ledgers.dep.outflux(s, loc, 0)
            + ledgers.tns.outflux(s, loc, 0);
        let mut mass = conc.current.get(s, loc) * volume + (influx - outflux) * dt;

        if mass < 0.0 {
            if mass > -CONC_TOLERANCE * volume.max(1.0) {
                mass = 0.0;
            } else {
                return Err(TrexError::NegativeConcentration {
                    kind: "solids",
                    series: s,
                    layer: 0,
                    value: mass / volume.max(MIN_VOLUME),
                    location,
                    time: time_hours,
                    dt,
                });
            }
        }

        if new_volume > MIN_VOLUME {
            conc.next.set(s, loc, mass / new_volume);
        } else {
            // the column dried out: the residue settles onto the bed
            conc.next.set(s, loc, 0.0);
            if mass > 0.0 {
                let rate = mass / dt;
                ledgers.dep.add_outflux(s, loc, 0, rate);
                ledgers.dep.add_influx(s, loc, surface_layer, rate);
            }
        }
    }

    // surface stack layer: mass and bulk volume change together
    let surface = stack.surface();
    let layer_volume = surface.volume;
    let porosity = surface.porosity;
    let mut volume_change = 0.0;
    let mut new_mass = vec![0.0; n_fractions];
    for s in 0..n_fractions {
        let delta = (ledgers.dep.influx(s, loc, surface_layer)
            - ledgers.ers.outflux(s, loc, surface_layer)
            - ledgers.tns.outflux(s, loc, surface_layer))
            * dt;
        new_mass[s] = surface.solids[s] * layer_volume + delta;
        let particle_density = solids.fractions[s].specific_gravity * WATER_DENSITY_G_M3;
        volume_change += delta / ((1.0 - porosity) * particle_density);
    }
    let new_layer_volume = (layer_volume + volume_change).max(0.0);

    let surface = stack.surface_mut();
    surface.new_volume = new_layer_volume;
    for s in 0..n_fractions {
        if new_mass[s] < 0.0 {
            if new_mass[s] > -CONC_TOLERANCE * layer_volume.max(1.0) {
                new_mass[s] = 0.0;
            } else {
                return Err(TrexError::NegativeConcentration {
                    kind: "solids",
                    series: s,
                    layer: surface_layer,
                    value: new_mass[s] / layer_volume.max(MIN_VOLUME),
                    location,
                    time: time_hours,
                    dt,
                });
            }
        }
        surface.solids_new[s] = if new_layer_volume > MIN_VOLUME {
            new_mass[s] / new_layer_volume
        } else {
            0.0
        };
    }

    // subsurface layers are untouched by the water column
    for k in 1..surface_layer {
        let layer = stack.layer_mut(k);
        for s in 0..n_fractions {
            layer.solids_new[s] = layer.solids[s];
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::core::stack::Layer;
    use crate::engine::core::timefunc::TimeFunction;
    use crate::engine::physics::solids::SolidsFraction;

    fn one_fraction() -> Vec<SolidsFraction> {
        vec![SolidsFraction {
            name: "fines".to_string(),
            diameter: 1.0e-5,
            settling_velocity: 1.0e-4,
            specific_gravity: 2.65,
            dstar: 0.0,
            cohesive: true,
            tau_cd: 1.0,
            tau_ce: 0.5,
            aging_rate: 0.0,
            group: 0,
        }]
    }

    fn still_pond() -> (Grid, ChannelNetwork, Vec<LandClass>, Vec<BedMaterial>) {
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
            erosion_scheme: ErosionScheme::ExcessShear,
            porosity: 0.4,
            usle_k: 0.0,
            erosion_yield: 10.0,
            erosion_exponent: 1.0,
            transport_capacity_coeff: 0.0,
            hydraulic_conductivity: 0.0,
            capillary_suction: 0.0,
            moisture_deficit: 0.0,
        }];
        (grid, channels, land, soils)
    }

    fn pond_stack(area: f64) -> StackColumn {
        StackColumn::new(
            vec![Layer::spec(0.1, area, 10.0, 0.4, vec![1.0e6], vec![])],
            0.0,
            3,
            0.1,
            10.0,
        )
    }

    #[test]
    fn test_still_pond_settling_decay() {
        let (grid, channels, land, soils) = still_pond();
        let params = SolidsParameters::default();
        let ctx = SolidsContext {
            grid: &grid,
            channels: &channels,
            land: &land,
            soils: &soils,
            params: &params,
        };
        let mut solids = SolidsState::new(one_fraction(), 1, 0, 4);
        solids.conc_ov.current.set(0, 0, 100.0);
        let mut stacks_ov = vec![pond_stack(100.0)];
        let mut stacks_ch: Vec<StackColumn> = vec![];
        let mut ov = OverlandWater::new(&grid);
        ov.depth.fill(1.0);
        ov.depth_new.fill(1.0);
        let ch = ChannelWater::new(0);

        let dt = 60.0;
        let mut loads: Vec<MassLoad> = vec![];
        let mut bcs: Vec<BoundaryConcentration> = vec![];
        let hours = 1.0;
        let steps = (hours * 3600.0 / dt) as usize;
        let initial_bed_mass = stacks_ov[0].total_solid_mass(0);
        for step in 0..steps {
            let t = step as f64 * dt / 3600.0;
            solids_transport(
                &ctx, &mut solids, &stacks_ov, &stacks_ch, &ov, &ch, &mut loads, &mut bcs, t, dt,
            );
            solids_balance(
                &ctx, &mut solids, &mut stacks_ov, &mut stacks_ch, &ov, &ch, t, dt,
            )
            .unwrap();
            solids.advance();
            stacks_ov[0].advance();
        }

        // tau = 0 so P_dep = 1: C(t) = C0 exp(-w t / h)
        let expected = 100.0 * (-1.0e-4 * 3600.0 / 1.0f64).exp();
        let got = solids.conc_ov.current.get(0, 0);
        assert!(
            (got - expected).abs() < 0.05 * expected,
            "settling decay: got {} expected {}",
            got,
            expected
        );

        // the water column's loss landed on the bed
        let bed_gain = stacks_ov[0].total_solid_mass(0) - initial_bed_mass;
        let column_loss = (100.0 - got) * 100.0;
        assert!(
            (bed_gain - column_loss).abs() < 1.0e-6 * column_loss,
            "bed gain {} vs column loss {}",
            bed_gain,
            column_loss
        );
    }

    #[test]
    fn test_no_deposition_above_critical_shear() {
        assert_eq!(p_dep(2.0, 1.0), 0.0);
        assert!((p_dep(0.5, 1.0) - 0.5).abs() < 1.0e-12);
        assert_eq!(p_dep(5.0, 0.0), 1.0);
    }

    #[test]
    fn test_excess_shear_needs_threshold() {
        let (_, _, _, soils) = still_pond();
        assert_eq!(excess_shear_rate(&soils[0], 0.4, 0.5, 1.0), 0.0);
        let rate = excess_shear_rate(&soils[0], 1.0, 0.5, 1.0);
        assert!((rate - 10.0).abs() < 1.0e-12);
        // aging scales the rate down
        assert!((excess_shear_rate(&soils[0], 1.0, 0.5, 0.5) - 5.0).abs() < 1.0e-12);
    }

    #[test]
    fn test_loads_charge_point_slot() {
        let (grid, channels, land, soils) = still_pond();
        let params = SolidsParameters::default();
        let ctx = SolidsContext {
            grid: &grid,
            channels: &channels,
            land: &land,
            soils: &soils,
            params: &params,
        };
        let mut solids = SolidsState::new(one_fraction(), 1, 0, 4);
        let ov = OverlandWater::new(&grid);
        let mut loads = vec![MassLoad {
            series: 0,
            location: LoadLocation::Cell { row: 0, col: 0 },
            kind: LoadKind::MassRate,
            function: TimeFunction::constant(86.4),
            scale: 1.0,
        }];
        apply_loads(&ctx, &mut solids, &ov, &mut loads, 0.0);
        // 86.4 kg/day = 1 g/s
        assert!(
            (solids.ledgers_ov.load.influx(0, 0, Source::Point.index()) - 1.0).abs() < 1.0e-12
        );
    }
}
