//! Time primitives shared across the umbra simulator.
//!
//! Use [`SimulationTime`](simulation_time::SimulationTime) for a span of
//! simulated time and [`EmulatedTime`](emulated_time::EmulatedTime) for an
//! instant on the simulated timeline.

pub mod emulated_time;
pub mod simulation_time;
