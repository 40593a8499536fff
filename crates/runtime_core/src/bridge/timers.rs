use std::time::Duration;

use deno_core::op2;

/// Sleeps for `millis`, counted against the call deadline by the pumping
/// driver in `context.rs` (§4.6 "Run"). Cancellation (`clearTimeout`) is
/// handled entirely in the bootstrap script: it is cheaper and simpler to
/// have JS drop a resolved callback on the floor than to thread a
/// cancellation token through the op layer for a guest that cannot
/// meaningfully observe the difference.
#[op2(async)]
pub async fn op_timer_sleep(#[number] millis: f64) {
    tokio::time::sleep(Duration::from_millis(millis.max(0.0) as u64)).await;
}
