// ABOUTME: Transport physics: water, solids, and chemical stages plus their forcings
// ABOUTME: Each stage reads current-state buffers and writes rates; balances write new buffers

pub mod chemical;
pub mod chemical_transport;
pub mod environment;
pub mod forcing;
pub mod hydrology;
pub mod kinetics;
pub mod solids;
pub mod solids_transport;
pub mod water;

pub use chemical::{ChemicalSpecies, ChemicalState};
pub use chemical_transport::{chemical_balance, chemical_transport, ChemicalParameters};
pub use environment::EnvironmentState;
pub use hydrology::{water_balance, water_transport, HydrologyParameters, LandClass};
pub use kinetics::{ChemicalYield, Reaction};
pub use solids::{BedMaterial, SolidsFraction, SolidsState};
pub use solids_transport::{solids_balance, solids_transport, SolidsParameters};
pub use water::{ChannelWater, OverlandWater, WaterBudget};
