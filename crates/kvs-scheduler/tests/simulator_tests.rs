use kvs_scheduler::test_harness::{run_simulator, SimulatorConfig, TestHarness};

#[tokio::test]
async fn test_simulator_default_seed() {
    let report = run_simulator(SimulatorConfig::default()).await.unwrap();
    assert!(report.passed(), "{}", report.generate_text());
}

#[tokio::test]
async fn test_simulator_without_failures() {
    let report = run_simulator(SimulatorConfig {
        seed: 7,
        failure_rate: 0.0,
        total_operations: 100,
        ..SimulatorConfig::default()
    })
    .await
    .unwrap();
    assert!(report.passed(), "{}", report.generate_text());
}

#[tokio::test]
async fn test_simulator_small_key_space() {
    let report = run_simulator(SimulatorConfig {
        seed: 3,
        keys: 4,
        max_batch: 6,
        failure_rate: 0.2,
        worker_pool_size: 1,
        ..SimulatorConfig::default()
    })
    .await
    .unwrap();
    assert!(report.passed(), "{}", report.generate_text());
}

#[tokio::test]
async fn test_several_seeds() {
    let failed = TestHarness::run_seeds(5, 50).await.unwrap();
    assert!(failed.is_empty(), "{}", failed[0].generate_text());
}
