//! Thin wrapper over `deno_core::JsRuntime`, following the shape of the
//! grounding codebase's `Isolate<RT>`: a termination handle that can be
//! poked from another thread, a heap limit, and a "has this isolate seen
//! anything that makes it unsafe to reuse" flag.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use deno_core::{JsRuntime, RuntimeOptions};
use parking_lot::Mutex;

use crate::bridge;

/// Why an isolate can no longer be returned to the pool healthy. Mirrors
/// the grounding codebase's `IsolateNotClean`, narrowed to this system's
/// failure modes (§5 "Cancellation / timeouts").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    Timeout,
    MemoryLimit,
    BridgeException,
}

struct HandleInner {
    corrupted: Option<Corruption>,
}

/// A cloneable, thread-safe handle that can terminate the isolate's current
/// script from outside the thread driving it, the same role the grounding
/// codebase's `IsolateHandle` plays over `v8::IsolateHandle`.
#[derive(Clone)]
pub struct IsolateHandle {
    v8_handle: deno_core::v8::IsolateHandle,
    inner: Arc<Mutex<HandleInner>>,
}

impl IsolateHandle {
    fn new(v8_handle: deno_core::v8::IsolateHandle) -> Self {
        Self {
            v8_handle,
            inner: Arc::new(Mutex::new(HandleInner { corrupted: None })),
        }
    }

    /// Forcibly stops whatever script is currently executing. Safe to call
    /// from any thread, any number of times.
    pub fn terminate(&self, reason: Corruption) {
        self.v8_handle.terminate_execution();
        let mut inner = self.inner.lock();
        if inner.corrupted.is_none() {
            inner.corrupted = Some(reason);
        }
    }

    pub fn mark_corrupted(&self, reason: Corruption) {
        let mut inner = self.inner.lock();
        if inner.corrupted.is_none() {
            inner.corrupted = Some(reason);
        }
    }

    pub fn corruption(&self) -> Option<Corruption> {
        self.inner.lock().corrupted
    }
}

/// One V8 isolate plus the host-side bookkeeping needed to run exactly one
/// call's worth of guest code at a time.
pub struct Isolate {
    runtime: JsRuntime,
    handle: IsolateHandle,
    healthy_on_create: AtomicBool,
    heap_ctx_ptr: *mut IsolateHandle,
}

impl Isolate {
    /// Creates a fresh isolate with the builtin bridge extensions installed
    /// and the bootstrap script pre-compiled, per §4.1 "Pre-compilation".
    pub fn new(heap_limit_bytes: usize) -> anyhow::Result<Self> {
        let create_params =
            deno_core::v8::CreateParams::default().heap_limits(1 << 16, heap_limit_bytes);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: bridge::extensions(),
            create_params: Some(create_params),
            ..Default::default()
        });

        let v8_handle = runtime.v8_isolate().thread_safe_handle();
        let handle = IsolateHandle::new(v8_handle);

        let heap_ctx_ptr = Box::into_raw(Box::new(handle.clone()));
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            heap_ctx_ptr as *mut std::ffi::c_void,
        );

        runtime
            .execute_script("runtime:bootstrap.js", bridge::BOOTSTRAP_SCRIPT)
            .map_err(|e| anyhow::anyhow!("bootstrap script failed: {e}"))?;

        Ok(Self {
            runtime,
            handle,
            healthy_on_create: AtomicBool::new(true),
            heap_ctx_ptr,
        })
    }

    pub fn handle(&self) -> IsolateHandle {
        self.handle.clone()
    }

    pub fn runtime_mut(&mut self) -> &mut JsRuntime {
        &mut self.runtime
    }

    pub fn is_healthy(&self) -> bool {
        self.handle.corruption().is_none() && self.healthy_on_create.load(Ordering::Relaxed)
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        // SAFETY: this pointer was produced by `Box::into_raw` in `new` and
        // is only ever read by the near-heap-limit callback, which cannot
        // fire after the owning isolate is gone.
        unsafe {
            drop(Box::from_raw(self.heap_ctx_ptr));
        }
    }
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` was produced by `Box::into_raw` in `Isolate::new` and
    // outlives the isolate that owns this callback.
    let handle = unsafe { &*(data as *const IsolateHandle) };
    handle.terminate(Corruption::MemoryLimit);
    // Grant extra headroom so V8 can unwind cleanly on the way to honoring
    // the termination request above, instead of aborting the process.
    current_heap_limit * 2
}
