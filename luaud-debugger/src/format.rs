//! Display formatting of script values.
//!
//! Scalars render the way the VM's `tostring` renders them; compound
//! values render as `<typename>: 0x<pointer>`, extended with the result
//! of a `__tostring` metamethod when one exists.

use luaud_vm::{ScriptVm, ThreadId, Value};

/// Human-readable rendering of `value` for variable panes and the REPL.
pub fn display_value(vm: &dyn ScriptVm, thread: ThreadId, value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => s.clone(),
        Value::Vector([x, y, z]) => format!("({x}, {y}, {z})"),
        Value::Thread(id) => format!("thread: {id}"),
        Value::LightUserData(ptr) => format!("lightuserdata: 0x{ptr:x}"),
        Value::Table(id) | Value::Function(id) | Value::UserData(id) | Value::Buffer(id) => {
            let mut text = format!("{}: {id}", value.type_name());
            if let Some(extra) = meta_tostring(vm, thread, value) {
                text.push_str(&format!(" ({extra})"));
            }
            text
        }
    }
}

/// `tostring` for numbers: integral values print without a fraction,
/// everything else uses the shortest round-trip form.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Rendering of a table key in a variable row.
pub fn display_key(vm: &dyn ScriptVm, thread: ThreadId, key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => display_value(vm, thread, other),
    }
}

fn meta_tostring(vm: &dyn ScriptVm, thread: ThreadId, value: &Value) -> Option<String> {
    let tostring = vm.get_metafield(value, "__tostring")?;
    let results = vm.call(thread, &tostring, &[value.clone()]).ok()?;
    match results.first() {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(display_value(vm, thread, other)),
        None => None,
    }
}
