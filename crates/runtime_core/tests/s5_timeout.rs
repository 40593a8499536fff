//! S5 from spec §8: a non-yielding handler is interrupted at the timeout,
//! reported as `Timeout`, and leaves the isolate marked `corrupted` so pool
//! metrics reflect it restoring `total` back to `base_size` shortly after.

mod support;

use std::time::{Duration, Instant};

use support::{base_request, build_engine, Scenario, StubMetadataStore};

#[tokio::test]
async fn busy_loop_handler_is_terminated_at_deadline() {
    let scenario = Scenario::single_file(br#"module.exports = (req, res) => { while (true) {} };"#);
    let metadata_store =
        StubMetadataStore::default().with_function(scenario.function_metadata("fn1", "proj1"));

    let mut config = support::small_test_config();
    config.function_timeout = Duration::from_millis(200);
    let (engine, _dns) = build_engine(config, metadata_store, scenario.archive.clone()).await;

    let start = Instant::now();
    let err = engine.execute("fn1", base_request("GET", "/")).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, rt_errors::RuntimeError::Timeout));
    assert!(elapsed < Duration::from_millis(250), "elapsed={elapsed:?}");

    let mut restored = false;
    for _ in 0..100 {
        let metrics = engine.pool_metrics();
        if metrics.corrupted >= 1 && metrics.total == 1 {
            restored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(restored, "pool did not top back up to base_size within budget");
}
