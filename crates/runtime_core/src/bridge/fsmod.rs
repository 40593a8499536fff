//! `require('fs')` / `require('path')` (read-only, VFS-routed) and the
//! module-resolution ops backing the bootstrap script's `require`, §4.2 and
//! §4.3.

use std::{cell::RefCell, path::Path, rc::Rc};

use deno_core::{op2, OpState, ToJsBuffer};

use super::state::ExecutionState;

#[op2(async)]
#[buffer]
pub async fn op_fs_read_file(
    state: Rc<RefCell<OpState>>,
    #[string] path: String,
) -> Result<ToJsBuffer, anyhow::Error> {
    let vfs = {
        let state = state.borrow();
        state.borrow::<ExecutionState>().vfs.clone()
    };
    Ok(vfs.read(Path::new(&path)).await?.into())
}

/// `fs` is read-only; any write attempt fails with `PermissionDenied`
/// rather than silently no-op'ing, per §4.3.
#[op2(fast)]
pub fn op_fs_write_file(#[string] _path: String) -> Result<(), anyhow::Error> {
    anyhow::bail!("PermissionDenied: the guest filesystem mount is read-only")
}

#[op2(fast)]
pub fn op_fs_exists(state: &mut OpState, #[string] path: String) -> bool {
    let exec = state.borrow::<ExecutionState>();
    exec.vfs.exists(Path::new(&path))
}

/// Resolves `specifier` against `caller_dir`. Returns the absolute path as
/// a string; throws `ModuleNotFound`-shaped errors the bootstrap script
/// surfaces as a regular JS exception.
#[op2]
#[string]
pub fn op_module_resolve(
    state: &mut OpState,
    #[string] caller_dir: String,
    #[string] specifier: String,
) -> Result<String, anyhow::Error> {
    let exec = state.borrow::<ExecutionState>();
    let resolved = exec
        .loader
        .resolve(&exec.vfs, Path::new(&caller_dir), &specifier)?;
    Ok(resolved.display().to_string())
}

/// Returns the wrapped CommonJS source for an already-resolved absolute
/// path, transparently consulting the cross-execution cache (§4.2). Kept
/// synchronous so the guest's `require()` stays synchronous end to end,
/// matching real CommonJS semantics; see `module_loader.rs`.
#[op2]
#[string]
pub fn op_module_read(
    state: &mut OpState,
    #[string] absolute_path: String,
) -> Result<String, anyhow::Error> {
    let exec = state.borrow::<ExecutionState>();
    let wrapped =
        exec.loader
            .load_wrapped(&exec.vfs, &exec.function_id, &exec.package_hash, Path::new(&absolute_path))?;
    Ok((*wrapped).clone())
}
