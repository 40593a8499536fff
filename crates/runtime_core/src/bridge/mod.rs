//! The guest-facing bridge: bootstrap script plus the `op2` surface it
//! calls into, §4.3 and §4.6.

mod codec;
mod console;
mod fsmod;
mod kv;
mod netgate;
mod response;
pub mod state;
mod timers;

pub use state::{ExecutionState, KvStore, LogEntry, ResponseState};

/// Installed once per isolate (§4.1 "Pre-compilation"), before any guest
/// module is loaded. Defines `console`, timers, `TextEncoder`/`TextDecoder`,
/// the CommonJS `require`, `kv`, and the `req`/`res` factories the execution
/// context calls into per request.
pub const BOOTSTRAP_SCRIPT: &str = include_str!("bootstrap.js");

deno_core::extension!(
    runtime_bridge,
    ops = [
        console::op_console_message,
        console::op_console_clear,
        timers::op_timer_sleep,
        codec::op_text_encode,
        codec::op_text_decode,
        netgate::op_net_check,
        kv::op_kv_get,
        kv::op_kv_set,
        kv::op_kv_delete,
        kv::op_kv_clear,
        kv::op_kv_has,
        response::op_res_status,
        response::op_res_set_header,
        response::op_res_append_header,
        response::op_res_get_header,
        response::op_res_remove_header,
        response::op_res_send,
        response::op_res_end,
        response::op_res_send_file,
        fsmod::op_fs_read_file,
        fsmod::op_fs_write_file,
        fsmod::op_fs_exists,
        fsmod::op_module_resolve,
        fsmod::op_module_read,
    ],
);

/// The `deno_core::Extension` list an isolate is created with. Split out as
/// a function (rather than inlined at the call site) so `isolate.rs` stays
/// agnostic to how many extensions the bridge is made of.
pub fn extensions() -> Vec<deno_core::Extension> {
    vec![runtime_bridge::init_ops()]
}
