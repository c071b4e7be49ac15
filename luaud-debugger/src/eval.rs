//! Expression evaluation in the environment of a paused frame.
//!
//! The evaluator synthesizes a fresh environment table mirroring the
//! frame: free names fall through to the function's own environment via
//! `__index`, and the frame's locals and upvalues are copied in by
//! name. Expressions are compiled as `return <expr>` first so bare
//! expressions yield values; statements fall back to compiling the raw
//! source.

use luaud_vm::{ScriptVm, ThreadId, Value, VmError};
use tracing::debug;

use crate::error::DebuggerError;

/// Build the synthetic environment for the frame at `level`.
pub fn build_frame_env(
    vm: &dyn ScriptVm,
    thread: ThreadId,
    level: u32,
) -> Result<Value, DebuggerError> {
    let info = vm
        .frame_info(thread, level)
        .ok_or(DebuggerError::UnknownFrame(i64::from(level)))?;

    let env = vm.new_table();
    if let Some(function) = &info.function {
        if let Some(fenv) = vm.function_env(function) {
            vm.set_index_metatable(&env, &fenv)?;
        }
    }

    let mut index = 1;
    while let Some((name, value)) = vm.get_local(thread, level, index) {
        vm.raw_set(&env, &Value::String(name), &value)?;
        index += 1;
    }

    if let Some(function) = &info.function {
        let mut index = 1;
        while let Some((name, value)) = vm.get_upvalue(function, index) {
            vm.raw_set(&env, &Value::String(name), &value)?;
            index += 1;
        }
    }

    Ok(env)
}

/// Evaluate `expression` in the environment of `thread`'s frame at
/// `level`, returning every result of the protected call.
pub fn evaluate(
    vm: &dyn ScriptVm,
    thread: ThreadId,
    level: u32,
    expression: &str,
) -> Result<Vec<Value>, DebuggerError> {
    let env = build_frame_env(vm, thread, level)?;
    let function = compile_expression(vm, expression)?;
    vm.set_function_env(&function, &env)?;
    vm.call(thread, &function, &[])
        .map_err(|e| DebuggerError::Eval(e.to_string()))
}

/// Evaluate a breakpoint condition in the innermost frame.
///
/// The condition must produce exactly one boolean; anything else is an
/// evaluation error (the stop still happens, with a diagnostic).
pub fn evaluate_condition(
    vm: &dyn ScriptVm,
    thread: ThreadId,
    condition: &str,
) -> Result<bool, DebuggerError> {
    let results = evaluate(vm, thread, 0, condition)?;
    match results.as_slice() {
        [Value::Boolean(b)] => Ok(*b),
        _ => Err(DebuggerError::Eval(
            "breakpoint condition must return a boolean value".to_string(),
        )),
    }
}

/// Compile `return <expr>`, falling back to the raw source so
/// statements (`x = 1`) still work in the REPL.
fn compile_expression(vm: &dyn ScriptVm, expression: &str) -> Result<Value, DebuggerError> {
    match vm.compile(&format!("return {expression}"), expression) {
        Ok(function) => Ok(function),
        Err(VmError::Compile(first)) => {
            debug!("expression form rejected, retrying as statement: {first}");
            vm.compile(expression, expression)
                .map_err(|e| DebuggerError::Eval(e.to_string()))
        }
        Err(other) => Err(DebuggerError::Eval(other.to_string())),
    }
}
