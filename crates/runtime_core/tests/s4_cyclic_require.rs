//! S4 from spec §8: a `require` cycle observes the partially-populated
//! `module.exports` on the back edge, not the finished one.

mod support;

use support::{base_request, build_engine, small_test_config, Scenario, StubMetadataStore};

#[tokio::test]
async fn cyclic_require_sees_partial_exports_on_back_edge() {
    let scenario = Scenario::files(&[
        (
            "index.js",
            br#"
require("./a");
const b = require("./b");
module.exports = (req, res) => res.status(200).json({ seenX: b.seenX });
"#,
        ),
        ("a.js", b"exports.x = 1; require('./b'); exports.x = 2;"),
        ("b.js", b"const a = require('./a'); exports.seenX = a.x;"),
    ]);
    let metadata_store =
        StubMetadataStore::default().with_function(scenario.function_metadata("fn1", "proj1"));
    let (engine, _dns) = build_engine(small_test_config(), metadata_store, scenario.archive.clone()).await;

    let response = engine.execute("fn1", base_request("GET", "/")).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, br#"{"seenX":1}"#);
}
