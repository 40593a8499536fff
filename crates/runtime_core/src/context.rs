//! Per-call execution lifecycle, §4.6: `Created → Bootstrapped → Running →
//! Finished → Disposed`.
//!
//! One [`ExecutionContext`] drives exactly one call over a [`LeasedIsolate`]
//! borrowed from the pool and always returns it on the way out, `healthy`
//! unless the call corrupted the isolate (§7 "Propagation policy").

use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};

use net_policy::{DnsResolver, PolicyEngine};
use rt_errors::RuntimeError;
use serde::{Deserialize, Serialize};

use crate::{
    bridge::{ExecutionState, KvStore, LogEntry, ResponseState},
    isolate::Corruption,
    module_loader::ModuleLoader,
    pool::LeasedIsolate,
    vfs::{Vfs, MOUNT_POINT},
};

/// Input to `Engine::execute`, §6 "Request envelope". Field names match what
/// the bootstrap script's `__createReq` hands the guest verbatim.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub url: String,
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
    pub ip: String,
    pub hostname: String,
    pub protocol: String,
}

/// Output of `Engine::execute`, §6 "Response envelope".
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub logs: Vec<LogEntry>,
}

/// Everything `Bootstrap` needs beyond what's already baked into the
/// isolate at creation time.
pub struct ContextInputs {
    pub vfs: Arc<Vfs>,
    pub env: HashMap<String, String>,
    pub policy: Arc<PolicyEngine>,
    pub dns: Arc<dyn DnsResolver>,
    pub kv: Arc<dyn KvStore>,
    pub kv_namespace: String,
    pub loader: Arc<ModuleLoader>,
    pub function_id: String,
    pub package_hash: String,
}

/// Owns a leased isolate for exactly one call.
pub struct ExecutionContext {
    leased: LeasedIsolate,
}

impl ExecutionContext {
    pub fn new(leased: LeasedIsolate) -> Self {
        Self { leased }
    }

    /// Runs the full lifecycle and always releases the isolate back to the
    /// pool, `corrupted` iff the call hit a timeout, memory limit, or bridge
    /// panic (§7).
    pub async fn run(
        mut self,
        inputs: ContextInputs,
        request: RequestEnvelope,
        deadline_at: Instant,
    ) -> Result<ResponseEnvelope, RuntimeError> {
        let mut corrupted = false;
        let result = self.run_inner(inputs, request, deadline_at, &mut corrupted).await;
        self.leased.release(corrupted);
        result
    }

    async fn run_inner(
        &mut self,
        inputs: ContextInputs,
        request: RequestEnvelope,
        deadline_at: Instant,
        corrupted: &mut bool,
    ) -> Result<ResponseEnvelope, RuntimeError> {
        let env = inputs.env;

        // Bootstrap: install per-call bridge state. The bootstrap script
        // itself was already run once at isolate creation (§4.1
        // "Pre-compilation"); only data is injected per call.
        let exec_state = ExecutionState {
            vfs: inputs.vfs,
            policy: inputs.policy,
            dns: inputs.dns,
            kv: inputs.kv,
            kv_namespace: inputs.kv_namespace,
            logs: Vec::new(),
            response: ResponseState::new(),
            deadline: deadline_at,
            loader: inputs.loader,
            function_id: inputs.function_id,
            package_hash: inputs.package_hash,
        };
        let isolate = self.leased.isolate_mut();
        isolate.runtime_mut().op_state().borrow_mut().put(exec_state);

        let env_assignment = format!(
            "globalThis.process.env = Object.freeze({});",
            serde_json::to_string(&env).map_err(|e| RuntimeError::internal(format!("env serialize: {e}")))?
        );
        isolate
            .runtime_mut()
            .execute_script("runtime:env.js", env_assignment)
            .map_err(|e| RuntimeError::internal(format!("env injection failed: {e}")))?;

        // Setup request + Run: build req/res, load the entry module, and
        // invoke it with (req, res) in one script so the handler's return
        // value (possibly a Promise) comes back as a single global to await.
        let request_json = serde_json::to_string(&request)
            .map_err(|e| RuntimeError::internal(format!("request serialize: {e}")))?;
        let request_literal = serde_json::to_string(&request_json)
            .map_err(|e| RuntimeError::internal(format!("request literal encode: {e}")))?;
        let entry_path = format!("{MOUNT_POINT}/index.js");
        let driver = format!(
            r#"(function() {{
  globalThis.__resetModuleCache();
  const req = globalThis.__createReq({request_literal});
  const res = globalThis.__createRes();
  const mod = globalThis.__loadEntryModule({entry_literal});
  const handler = (mod && typeof mod.default === "function") ? mod.default : mod;
  if (typeof handler !== "function") {{
    throw new TypeError("module.exports must export a function");
  }}
  return Promise.resolve(handler(req, res));
}})()"#,
            entry_literal = serde_json::to_string(&entry_path).expect("string always serializes"),
        );

        // `execute_script` runs the driver synchronously to the handler's
        // first suspension point, so a handler that never yields (`while
        // (true) {}`) blocks this call, not just the later `resolve_value`
        // await. A watchdog racing the deadline on the thread-safe
        // `IsolateHandle` is what actually interrupts it, the same division
        // of labor as `v8::IsolateHandle::terminate_execution` is built for.
        let watchdog_handle = isolate.handle();
        let watchdog_deadline = deadline_at.saturating_duration_since(Instant::now());
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(watchdog_deadline).await;
            watchdog_handle.terminate(Corruption::Timeout);
        });

        let invocation_result = isolate.runtime_mut().execute_script("runtime:invoke.js", driver);
        watchdog.abort();

        // §7 "Propagation policy": only isolate-damaging failures force
        // `corrupted` on release; a plain uncaught throw or rejection from
        // guest code is a normal negative-path result and leaves the isolate
        // reusable. `classify_invocation_error` below derives the right
        // variant from the isolate's own corruption state and
        // `RuntimeError::forces_corrupted_isolate` decides the flag.
        let invocation = match invocation_result {
            Ok(v) => v,
            Err(e) => {
                let err = classify_invocation_error(isolate.handle().corruption(), e.to_string());
                *corrupted = err.forces_corrupted_isolate();
                return Err(err);
            },
        };

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let resolved = tokio::time::timeout(remaining, isolate.runtime_mut().resolve_value(invocation)).await;

        match resolved {
            Err(_elapsed) => {
                isolate.handle().terminate(Corruption::Timeout);
                *corrupted = true;
                return Err(RuntimeError::Timeout);
            },
            Ok(Err(e)) => {
                let err = classify_invocation_error(isolate.handle().corruption(), e.to_string());
                *corrupted = err.forces_corrupted_isolate();
                return Err(err);
            },
            Ok(Ok(_)) => {},
        }

        if isolate.handle().corruption().is_some() || !isolate.is_healthy() {
            *corrupted = true;
        }

        // Harvest.
        let mut op_state = isolate.runtime_mut().op_state();
        let exec_state: ExecutionState = op_state.borrow_mut().take();
        drop(op_state);

        let mut response = exec_state.response;
        if !response.responded {
            response
                .headers
                .entry("content-type".to_string())
                .or_insert_with(|| vec!["application/json".to_string()]);
            response.body.get_or_insert_with(|| b"{}".to_vec());
        }

        Ok(ResponseEnvelope {
            status_code: response.status_code,
            headers: response.headers,
            body: response.body.unwrap_or_default(),
            logs: exec_state.logs,
        })
    }
}

/// Maps a V8 failure to the §7 taxonomy using the isolate's own corruption
/// state, since `deno_core`'s error type doesn't distinguish "terminated by
/// us" from "guest threw" on its own.
fn classify_invocation_error(corruption: Option<Corruption>, message: String) -> RuntimeError {
    match corruption {
        Some(Corruption::Timeout) => RuntimeError::Timeout,
        Some(Corruption::MemoryLimit) => RuntimeError::MemoryLimit,
        _ => RuntimeError::HandlerError { message, stack: None },
    }
}
