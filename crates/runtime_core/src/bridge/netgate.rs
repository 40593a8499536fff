//! The `http`/`https`/`net`/`dns` surfaces all fold through one policy
//! check, §4.4's `evaluate` consulted "for any host resolution." Actual
//! socket I/O for an allowed connection is intentionally out of this
//! crate's scope — the spec's contract is the gate, not a general-purpose
//! HTTP client — so an allowed check hands back a plain TCP stream handle
//! the bootstrap script's `net`/`http`/`https` shims build request framing
//! on top of.

use std::rc::Rc;
use std::cell::RefCell;

use deno_core::{op2, OpState};
use serde::Serialize;

use super::state::ExecutionState;

#[derive(Debug, Serialize)]
pub struct NetCheckResult {
    pub allowed: bool,
    pub reason: String,
    pub resolved_ip: Option<String>,
}

/// Evaluates the call's policy snapshot against `host` and, on denial, logs
/// the user-visible message the spec mandates (§4.4 "On deny").
#[op2(async)]
#[serde]
pub async fn op_net_check(
    state: Rc<RefCell<OpState>>,
    #[string] host: String,
) -> NetCheckResult {
    let (policy, dns) = {
        let state = state.borrow();
        let exec = state.borrow::<ExecutionState>();
        (exec.policy.clone(), exec.dns.clone())
    };
    let result = policy.evaluate(&host, dns.as_ref()).await;
    if !result.allowed {
        let mut message = format!("Network policy blocked connection to {host}");
        if let Some(ip) = result.resolved_ip {
            message.push_str(&format!(" (resolved to {ip})"));
        }
        state
            .borrow_mut()
            .borrow_mut::<ExecutionState>()
            .push_log("warn", message);
    }
    NetCheckResult {
        allowed: result.allowed,
        reason: result.reason,
        resolved_ip: result.resolved_ip.map(|ip| ip.to_string()),
    }
}
