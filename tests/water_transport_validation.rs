// ABOUTME: End-to-end water transport scenarios: rainfall ponding, infiltration drawdown,
// ABOUTME: outlet drainage, and channel conveyance, each checked against the water budget

use trex::engine::core::channel::{ChannelNetwork, Link, NodeGeometry};
use trex::engine::core::grid::{CellMask, Grid};
use trex::engine::core::timefunc::{IntervalSchedule, TimeFunction};
use trex::engine::physics::environment::EnvField;
use trex::engine::physics::hydrology::{HydrologyParameters, LandClass, OverlandOutlet};
use trex::engine::physics::solids::BedMaterial;
use trex::engine::sim::{NullSink, Simulation, TimestepController};

fn open_land() -> Vec<LandClass> {
    vec![LandClass {
        name: "open".to_string(),
        manning_n: 0.03,
        interception_depth: 0.0,
        usle_c: 0.0,
        usle_p: 1.0,
    }]
}

fn loam(hydraulic_conductivity: f64) -> Vec<BedMaterial> {
    vec![BedMaterial {
        name: "loam".to_string(),
        erosion_scheme: Default::default(),
        porosity: 0.4,
        usle_k: 0.0,
        erosion_yield: 0.0,
        erosion_exponent: 1.0,
        transport_capacity_coeff: 0.0,
        hydraulic_conductivity,
        capillary_suction: 0.0,
        moisture_deficit: 0.3,
    }]
}

/// One hour of 50 mm/h rain on a flat 100 m cell ponds 50 mm.
#[test]
fn rainfall_ponds_on_flat_cell() {
    let grid = Grid::uniform(1, 1, 100.0, 100.0);
    let mut sim = Simulation::new(grid, ChannelNetwork::empty(), open_land(), loam(0.0)).unwrap();
    sim.rain = EnvField::new(
        TimeFunction::new(vec![0.0, 1.0, 1.001], vec![50.0, 50.0, 0.0]).unwrap(),
        1,
    );
    sim.end_hours = 1.0;
    sim.controller = TimestepController::schedule(IntervalSchedule::constant(10.0));
    sim.initialize();
    let summary = sim.run(&mut NullSink).unwrap();

    assert!((sim.ov_water.depth.get(0, 0) - 0.050).abs() < 1.0e-6);
    assert!((sim.budget.rainfall - 500.0).abs() < 0.5);
    assert!(summary.water_residual_m3.abs() < 1.0e-6);
}

/// The same storm with an outlet: the 500 m3 of rain eventually leaves
/// across the boundary.
#[test]
fn outlet_discharge_integrates_the_storm() {
    let grid = Grid::uniform(1, 1, 100.0, 100.0);
    let mut sim = Simulation::new(grid, ChannelNetwork::empty(), open_land(), loam(0.0)).unwrap();
    sim.rain = EnvField::new(
        TimeFunction::new(vec![0.0, 1.0, 1.001], vec![50.0, 50.0, 0.0]).unwrap(),
        1,
    );
    sim.outlets = vec![OverlandOutlet {
        row: 0,
        col: 0,
        slope: 0.005,
    }];
    sim.end_hours = 12.0;
    sim.controller = TimestepController::schedule(IntervalSchedule::constant(10.0));
    sim.initialize();
    let summary = sim.run(&mut NullSink).unwrap();

    let remaining = sim.ov_water.total_volume(&sim.grid);
    // everything that fell either left or is still ponded
    assert!(
        (sim.budget.outlet_outflow + remaining - 500.0).abs() < 0.5,
        "outflow {} + storage {} should equal rainfall",
        sim.budget.outlet_outflow,
        remaining
    );
    assert!(sim.budget.outlet_outflow > 450.0);
    assert!(summary.water_residual_m3.abs() < 1.0e-6);
    assert!(sim.stats.peak_outlet_discharge.peak > 0.0);
}

/// Green-Ampt at a constant 10 mm/h against 50 mm/h rain leaves 40 mm
/// ponded after one hour.
#[test]
fn infiltration_reduces_ponding() {
    let grid = Grid::uniform(1, 1, 100.0, 100.0);
    let mut sim = Simulation::new(
        grid,
        ChannelNetwork::empty(),
        open_land(),
        loam(10.0 / 1000.0 / 3600.0),
    )
    .unwrap();
    sim.hydro_params = HydrologyParameters {
        infiltration: true,
        ..Default::default()
    };
    sim.rain = EnvField::constant(50.0, 1);
    sim.end_hours = 1.0;
    sim.controller = TimestepController::schedule(IntervalSchedule::constant(10.0));
    sim.initialize();
    let summary = sim.run(&mut NullSink).unwrap();

    assert!((sim.ov_water.depth.get(0, 0) - 0.040).abs() < 1.0e-5);
    // 10 mm over the 10000 m2 cell
    assert!((sim.budget.infiltration_overland - 100.0).abs() < 0.1);
    assert!(summary.water_residual_m3.abs() < 1.0e-6);
}

/// Rain on a channel cell drains into the node and leaves through the
/// terminal boundary; the budget still closes.
#[test]
fn channel_conveys_to_the_boundary() {
    let mut grid = Grid::uniform(1, 2, 10.0, 100.0);
    grid.mask.set(0, 1, CellMask::Channel);
    grid.elevation.set(0, 0, 100.1);
    let link = Link {
        nodes: vec![NodeGeometry {
            bottom_width: 2.0,
            bank_height: 1.0,
            side_slope: 0.0,
            length: 10.0,
            manning_n: 0.03,
            bed_slope: 0.002,
            bed_elevation: 99.0,
            sediment_type: 0,
        }],
        cells: vec![(0, 1)],
        upstream: vec![],
        downstream: vec![],
    };
    let channels = ChannelNetwork::new(vec![link]);
    let mut sim = Simulation::new(grid, channels, open_land(), loam(0.0)).unwrap();
    sim.rain = EnvField::new(
        TimeFunction::new(vec![0.0, 0.5, 0.501], vec![36.0, 36.0, 0.0]).unwrap(),
        2,
    );
    sim.end_hours = 6.0;
    sim.controller = TimestepController::schedule(IntervalSchedule::constant(5.0));
    sim.initialize();
    let summary = sim.run(&mut NullSink).unwrap();

    assert!(sim.budget.outlet_outflow > 0.0, "terminal node discharged");
    assert!(summary.water_residual_m3.abs() < 1.0e-6);
    // no negative state anywhere at the end of the run
    for (r, c) in [(0usize, 0usize), (0, 1)] {
        assert!(sim.ov_water.depth.get(r, c) >= 0.0);
    }
    assert!(sim.ch_water.depth[0] >= 0.0);
}
