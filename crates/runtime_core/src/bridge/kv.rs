use std::{cell::RefCell, rc::Rc};

use deno_core::{op2, OpState, ToJsBuffer};

use super::state::ExecutionState;

#[op2(async)]
pub async fn op_kv_get(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
) -> Result<Option<ToJsBuffer>, anyhow::Error> {
    let (kv, namespace) = {
        let state = state.borrow();
        let exec = state.borrow::<ExecutionState>();
        (exec.kv.clone(), exec.kv_namespace.clone())
    };
    Ok(kv.get(&namespace, &key).await?.map(|v| v.into()))
}

#[op2(async)]
pub async fn op_kv_set(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
    #[buffer] value: &[u8],
) -> Result<(), anyhow::Error> {
    let (kv, namespace) = {
        let state = state.borrow();
        let exec = state.borrow::<ExecutionState>();
        (exec.kv.clone(), exec.kv_namespace.clone())
    };
    kv.set(&namespace, &key, value.to_vec()).await
}

#[op2(async)]
pub async fn op_kv_delete(state: Rc<RefCell<OpState>>, #[string] key: String) -> Result<(), anyhow::Error> {
    let (kv, namespace) = {
        let state = state.borrow();
        let exec = state.borrow::<ExecutionState>();
        (exec.kv.clone(), exec.kv_namespace.clone())
    };
    kv.delete(&namespace, &key).await
}

#[op2(async)]
pub async fn op_kv_clear(state: Rc<RefCell<OpState>>) -> Result<(), anyhow::Error> {
    let (kv, namespace) = {
        let state = state.borrow();
        let exec = state.borrow::<ExecutionState>();
        (exec.kv.clone(), exec.kv_namespace.clone())
    };
    kv.clear(&namespace).await
}

#[op2(async)]
pub async fn op_kv_has(state: Rc<RefCell<OpState>>, #[string] key: String) -> Result<bool, anyhow::Error> {
    let (kv, namespace) = {
        let state = state.borrow();
        let exec = state.borrow::<ExecutionState>();
        (exec.kv.clone(), exec.kv_namespace.clone())
    };
    kv.has(&namespace, &key).await
}
