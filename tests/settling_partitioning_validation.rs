// ABOUTME: Still-pond scenarios: exponential settling decay with bed mass gain, equilibrium
// ABOUTME: phase partitioning, and phase-fraction closure across every cell and layer

use trex::engine::core::channel::ChannelNetwork;
use trex::engine::core::grid::Grid;
use trex::engine::core::stack::Layer;
use trex::engine::core::timefunc::IntervalSchedule;
use trex::engine::physics::chemical::{ChemicalSpecies, ChemicalState};
use trex::engine::physics::hydrology::LandClass;
use trex::engine::physics::solids::{BedMaterial, SolidsFraction, SolidsState};
use trex::engine::sim::{NullSink, Simulation, TimestepController};

fn still_pond(settling_velocity: f64, tau_cd: f64) -> Simulation {
    let grid = Grid::uniform(1, 1, 10.0, 100.0);
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
    let mut sim = Simulation::new(grid, ChannelNetwork::empty(), land, soils).unwrap();
    sim.install_uniform_stacks(
        &[Layer::spec(0.1, 0.0, 0.0, 0.4, vec![1.0e6], vec![0.0])],
        3,
        0.1,
        10.0,
    )
    .unwrap();
    let mut solids = SolidsState::new(
        vec![SolidsFraction {
            name: "fines".to_string(),
            diameter: 1.0e-5,
            settling_velocity,
            specific_gravity: 2.65,
            dstar: 0.0,
            cohesive: true,
            tau_cd,
            tau_ce: 10.0,
            aging_rate: 0.0,
            group: 0,
        }],
        1,
        0,
        4,
    );
    solids.conc_ov.current.set(0, 0, 100.0);
    sim.enable_solids(solids).unwrap();
    sim.ov_water.depth.fill(1.0);
    sim.end_hours = 1.0;
    sim.controller = TimestepController::schedule(IntervalSchedule::constant(60.0));
    sim
}

/// A quiescent pond settles as C(t) = C0 exp(-w t / h); the bed gains
/// exactly what the column loses.
#[test]
fn settling_decays_exponentially() {
    let mut sim = still_pond(1.0e-4, 1.0);
    sim.initialize();
    let initial_bed = sim.stacks_ov[0].total_solid_mass(0);
    sim.run(&mut NullSink).unwrap();

    let expected = 100.0 * (-1.0e-4 * 3600.0 / 1.0f64).exp();
    let got = sim.solids.as_ref().unwrap().conc_ov.current.get(0, 0);
    assert!(
        (got - expected).abs() < 0.05 * expected,
        "got {} expected {}",
        got,
        expected
    );

    let bed_gain = sim.stacks_ov[0].total_solid_mass(0) - initial_bed;
    let column_loss = (100.0 - got) * 100.0;
    assert!(
        (bed_gain - column_loss).abs() < 1.0e-6 * column_loss,
        "bed gain {} vs column loss {}",
        bed_gain,
        column_loss
    );

    // the run-level ledger closes to well under a tenth of a percent
    let line = sim.solids_balance_line(0);
    assert!(line.relative_residual() < 1.0e-3, "residual {}", line.relative_residual());
}

/// K_p = 1e-3 m3/g against 100 g/m3 of solids gives the f_p = 0.0909,
/// f_d = 0.9091 split, and the fractions close to one everywhere.
#[test]
fn partitioning_matches_equilibrium() {
    let mut sim = still_pond(0.0, 0.0);
    let chems = {
        let mut state = ChemicalState::new(
            vec![ChemicalSpecies {
                name: "x".to_string(),
                kb: 0.0,
                kp: 1.0e-3,
                koc: 0.0,
                nux: 0.0,
                fdoc_effect: 1.0,
                reactions: vec![],
                group: 0,
            }],
            1,
            0,
            4,
            1,
        );
        state.conc_ov.current.set(0, 0, 10.0);
        state
    };
    sim.enable_chemicals(chems).unwrap();
    sim.end_hours = 0.1;
    sim.initialize();
    sim.run(&mut NullSink).unwrap();

    let chems = sim.chems.as_ref().unwrap();
    let fd = chems.phase_ov.dissolved(0, 0, 0);
    let fp = chems.phase_ov.particulate(0, 0, 0, 0);
    assert!((fp - 0.0909).abs() < 1.0e-4, "fp {}", fp);
    assert!((fd - 0.9091).abs() < 1.0e-4, "fd {}", fd);
    assert_eq!(chems.phase_ov.bound(0, 0, 0), 0.0);

    // phase closure in the water column and in every bed layer
    for layer in 0..=sim.stacks_ov[0].nstack() {
        let total = chems.phase_ov.dissolved(0, 0, layer)
            + chems.phase_ov.bound(0, 0, layer)
            + chems.phase_ov.particulate(0, 0, layer, 0);
        assert!(
            (total - 1.0).abs() < 1.0e-5,
            "phase closure at layer {}: {}",
            layer,
            total
        );
    }
}

/// Deposition above the critical shear stops: tau >= tau_cd zeroes the
/// effective settling (still water keeps tau at zero, so settling runs).
#[test]
fn no_negative_state_after_settling_run() {
    let mut sim = still_pond(1.0e-4, 0.0);
    sim.initialize();
    sim.run(&mut NullSink).unwrap();
    let solids = sim.solids.as_ref().unwrap();
    assert!(solids.conc_ov.current.get(0, 0) >= 0.0);
    assert!(sim.ov_water.depth.get(0, 0) >= 0.0);
    for k in 1..=sim.stacks_ov[0].nstack() {
        assert!(sim.stacks_ov[0].layer(k).solids[0] >= 0.0);
        let layer = sim.stacks_ov[0].layer(k);
        // volume-area-thickness consistency held through the run
        assert!((layer.volume - layer.area * layer.thickness).abs() <= 1.0e-4 * layer.volume);
    }
}
