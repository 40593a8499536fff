use deno_core::{op2, OpState};

use super::state::ExecutionState;

#[op2(fast)]
pub fn op_console_message(state: &mut OpState, #[string] level: String, #[string] message: String) {
    state.borrow_mut::<ExecutionState>().push_log(level, message);
}

#[op2(fast)]
pub fn op_console_clear(state: &mut OpState) {
    state.borrow_mut::<ExecutionState>().logs.clear();
}
