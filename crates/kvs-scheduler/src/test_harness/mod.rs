//! Test harness: mock southbound, a simulated dataplane and a randomized
//! simulator

pub mod dataplane;
pub mod mock;
pub mod simulator;

pub use dataplane::Dataplane;
pub use mock::{wait_for_state, MockDescriptor, MockMetadata, MockSouthbound, MockValue, SbCall};
pub use simulator::{run_simulator, SimulationReport, SimulatorConfig};

use crate::error::SchedulerError;

/// Runs the simulator over several seeds
pub struct TestHarness;

impl TestHarness {
    /// Simulate `seeds` runs of `operations` each; returns the failing reports
    ///
    /// # Errors
    /// Scheduler errors of any run.
    pub async fn run_seeds(seeds: u64, operations: u64) -> Result<Vec<SimulationReport>, SchedulerError> {
        let mut failed = Vec::new();
        for seed in 0..seeds {
            let report = run_simulator(SimulatorConfig {
                seed,
                total_operations: operations,
                ..SimulatorConfig::default()
            })
            .await?;
            if !report.passed() {
                failed.push(report);
            }
        }
        Ok(failed)
    }
}
