//! Testable Property 1 (spec §8): concurrent calls cannot observe each
//! other's state. Two functions with distinct env vars are executed
//! concurrently against a pool sized to hand out two isolates at once, and
//! each must only ever see its own injected environment.

mod support;

use std::collections::HashMap;

use support::{base_request, build_engine, small_test_config, Scenario, StubMetadataStore};

#[tokio::test]
async fn concurrent_calls_do_not_observe_each_others_env() {
    let scenario = Scenario::single_file(
        br#"module.exports = (req, res) => res.status(200).json({ value: process.env.SECRET });"#,
    );

    let mut metadata_store = StubMetadataStore::default()
        .with_function(scenario.function_metadata("fn-a", "proj-a"))
        .with_function(scenario.function_metadata("fn-b", "proj-b"));
    metadata_store
        .env
        .insert("fn-a".to_string(), HashMap::from([("SECRET".to_string(), "a-secret".to_string())]));
    metadata_store
        .env
        .insert("fn-b".to_string(), HashMap::from([("SECRET".to_string(), "b-secret".to_string())]));

    let mut config = small_test_config();
    config.base_size = 2;
    config.max_isolates = 2;
    let (engine, _dns) = build_engine(config, metadata_store, scenario.archive.clone()).await;

    let (a, b) = tokio::join!(
        engine.execute("fn-a", base_request("GET", "/")),
        engine.execute("fn-b", base_request("GET", "/")),
    );

    assert_eq!(a.unwrap().body, br#"{"value":"a-secret"}"#);
    assert_eq!(b.unwrap().body, br#"{"value":"b-secret"}"#);
}
