//! S2 from spec §8: a handler that tries an outbound `https.get` to a host
//! no rule allows observes a connection error and, since it swallows it,
//! still returns the default `200 {}`.

mod support;

use net_policy::{Action, NetworkRule, TargetType};
use support::{base_request, build_engine, small_test_config, Scenario, StubMetadataStore};

#[tokio::test]
async fn denied_host_surfaces_as_guest_side_error() {
    let scenario = Scenario::single_file(
        br#"
module.exports = (req, res) => {
  return new Promise((resolve) => {
    const https = require("https");
    https.get("https://evil.test", () => {}).on("error", (err) => {
      console.error(err.message);
      resolve(res.status(200).json({}));
    });
  });
};
"#,
    );
    let allow_example_com = NetworkRule {
        action: Action::Allow,
        target_type: TargetType::Domain,
        target_value: "*.example.com".to_string(),
        priority: 1,
        description: None,
    };
    let metadata_store = StubMetadataStore::default()
        .with_function(scenario.function_metadata("fn1", "proj1"))
        .with_global_rules(vec![allow_example_com]);
    let (engine, _dns) = build_engine(small_test_config(), metadata_store, scenario.archive.clone()).await;

    let response = engine.execute("fn1", base_request("GET", "/")).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert!(response
        .logs
        .iter()
        .any(|entry| entry.message.contains("Network policy blocked connection to evil.test")));
}
