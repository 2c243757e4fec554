// ABOUTME: Multi-step multi-process runs checked against the cumulative mass-balance ledger
// ABOUTME: initial + inputs - outputs - final must close within a tenth of a percent

use trex::engine::core::channel::ChannelNetwork;
use trex::engine::core::grid::Grid;
use trex::engine::core::stack::Layer;
use trex::engine::core::timefunc::{IntervalSchedule, TimeFunction};
use trex::engine::physics::chemical::{ChemicalSpecies, ChemicalState};
use trex::engine::physics::environment::EnvField;
use trex::engine::physics::forcing::{LoadKind, LoadLocation, MassLoad};
use trex::engine::physics::hydrology::{LandClass, OverlandOutlet};
use trex::engine::physics::kinetics::Reaction;
use trex::engine::physics::solids::{BedMaterial, ErosionScheme, SolidsFraction, SolidsState};
use trex::engine::sim::{NullSink, Simulation, TimestepController};

fn catchment(erosion_yield: f64) -> Simulation {
    let mut grid = Grid::uniform(1, 2, 10.0, 100.0);
    grid.elevation.set(0, 1, 99.9);
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
        erosion_yield,
        erosion_exponent: 1.0,
        transport_capacity_coeff: 0.0,
        hydraulic_conductivity: 0.0,
        capillary_suction: 0.0,
        moisture_deficit: 0.0,
    }];
    let mut sim = Simulation::new(grid, ChannelNetwork::empty(), land, soils).unwrap();
    sim.install_uniform_stacks(
        &[
            Layer::spec(0.1, 0.0, 0.0, 0.4, vec![1.0e6], vec![5.0]),
            Layer::spec(0.05, 0.0, 0.0, 0.4, vec![1.0e6], vec![5.0]),
        ],
        4,
        0.01,
        100.0,
    )
    .unwrap();
    let mut solids = SolidsState::new(
        vec![SolidsFraction {
            name: "fines".to_string(),
            diameter: 1.0e-5,
            settling_velocity: 5.0e-5,
            specific_gravity: 2.65,
            dstar: 0.0,
            cohesive: true,
            tau_cd: 2.0,
            tau_ce: 0.05,
            aging_rate: 0.0,
            group: 0,
        }],
        2,
        0,
        5,
    );
    solids.conc_ov.current.set(0, 0, 20.0);
    solids.conc_ov.current.set(0, 1, 20.0);
    sim.enable_solids(solids).unwrap();
    sim.rain = EnvField::new(
        TimeFunction::new(vec![0.0, 1.0, 1.001], vec![25.0, 25.0, 0.0]).unwrap(),
        2,
    );
    sim.outlets = vec![OverlandOutlet {
        row: 0,
        col: 1,
        slope: 0.002,
    }];
    sim.end_hours = 2.0;
    sim.controller = TimestepController::schedule(IntervalSchedule::constant(5.0));
    sim
}

/// Rain, routing, settling, erosion, a point load, and outlet export:
/// the per-fraction ledger closes.
#[test]
fn solids_ledger_closes_with_all_processes_active() {
    let mut sim = catchment(0.5);
    sim.solids_loads.push(MassLoad {
        series: 0,
        location: LoadLocation::Cell { row: 0, col: 0 },
        kind: LoadKind::MassRate,
        function: TimeFunction::new(vec![0.0, 1.0, 1.001], vec![86.4, 86.4, 0.0]).unwrap(),
        scale: 1.0,
    });
    sim.initialize();
    sim.run(&mut NullSink).unwrap();

    let line = sim.solids_balance_line(0);
    // roughly 1 g/s of load ran for an hour
    assert!(
        line.external_in_kg > 3.0,
        "load delivered {} kg",
        line.external_in_kg
    );
    assert!(
        line.relative_residual() < 1.0e-3,
        "solids residual {} (line {:?})",
        line.relative_residual(),
        line
    );
}

/// A partitioning, biodegrading species through the same storm: the
/// species ledger closes and the reaction loss is visible.
#[test]
fn chemical_ledger_closes_with_kinetics() {
    let mut sim = catchment(0.1);
    let mut chems = ChemicalState::new(
        vec![ChemicalSpecies {
            name: "atrazine".to_string(),
            kb: 0.0,
            kp: 1.0e-4,
            koc: 0.0,
            nux: 0.0,
            fdoc_effect: 1.0,
            reactions: vec![Reaction::Biodegradation {
                k_water: 0.5,
                k_bed: 0.05,
                second_order: false,
            }],
            group: 0,
        }],
        2,
        0,
        5,
        1,
    );
    chems.conc_ov.current.set(0, 0, 50.0);
    chems.conc_ov.current.set(0, 1, 50.0);
    sim.enable_chemicals(chems).unwrap();
    sim.initialize();
    sim.run(&mut NullSink).unwrap();

    let line = sim.chem_balance_line(0);
    assert!(line.reaction_out_kg > 0.0, "biodegradation consumed mass");
    assert!(
        line.relative_residual() < 1.0e-3,
        "chemical residual {} (line {:?})",
        line.relative_residual(),
        line
    );

    // every depth and concentration is non-negative at the end
    let chems = sim.chems.as_ref().unwrap();
    for loc in 0..2 {
        assert!(chems.conc_ov.current.get(0, loc) >= 0.0);
        assert!(sim.solids.as_ref().unwrap().conc_ov.current.get(0, loc) >= 0.0);
    }
}

/// Heavy erosion keeps the ledger and the stack bounds intact, and the
/// domain only loses mass through the outlet.
#[test]
fn ledger_closes_under_heavy_erosion() {
    let mut sim = catchment(2.0);
    sim.initialize();
    let initial = sim.total_solid_mass(0);
    sim.run(&mut NullSink).unwrap();

    let line = sim.solids_balance_line(0);
    assert!(
        line.relative_residual() < 1.0e-3,
        "residual {} after reindexing",
        line.relative_residual()
    );
    // stack bounds held everywhere
    for loc in 0..2 {
        let stack = &sim.stacks_ov[loc];
        assert!(stack.nstack() >= 1 && stack.nstack() <= stack.max_stack());
    }
    // the domain only lost mass through the outlet
    let final_mass = sim.total_solid_mass(0);
    assert!(final_mass <= initial + line.external_in_kg + 1.0e-9);
}
