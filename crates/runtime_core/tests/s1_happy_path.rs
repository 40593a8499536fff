//! S1 from spec §8: status/json round trip through the full `Engine::execute`
//! path, backed by real package extraction and a real isolate.

mod support;

use std::collections::HashMap;

use support::{base_request, build_engine, small_test_config, Scenario, StubMetadataStore};

#[tokio::test]
async fn status_and_json_body_come_back_as_set() {
    let scenario = Scenario::single_file(
        br#"module.exports = (req, res) => res.status(201).json({ hello: req.query.name });"#,
    );
    let metadata_store =
        StubMetadataStore::default().with_function(scenario.function_metadata("fn1", "proj1"));
    let (engine, _dns) = build_engine(small_test_config(), metadata_store, scenario.archive.clone()).await;

    let mut request = base_request("GET", "/");
    request.query = HashMap::from([("name".to_string(), "world".to_string())]);

    let response = engine.execute("fn1", request).await.unwrap();

    assert_eq!(response.status_code, 201);
    assert_eq!(
        response.headers.get("content-type"),
        Some(&vec!["application/json".to_string()])
    );
    assert_eq!(response.body, br#"{"hello":"world"}"#);
}

#[tokio::test]
async fn unknown_function_id_is_function_not_found() {
    let metadata_store = StubMetadataStore::default();
    let (engine, _dns) = build_engine(small_test_config(), metadata_store, Vec::new()).await;

    let err = engine.execute("ghost", base_request("GET", "/")).await.unwrap_err();
    assert!(matches!(err, rt_errors::RuntimeError::FunctionNotFound { .. }));
}
