//! Scope, variable and evaluation behavior against a paused frame:
//! the three scopes per frame, upvalue and global mutation, vector
//! literals, metamethod-driven expansion and display.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::Harness;
use luaud_testing::{DapClient, Op, ProgramExpr, Proto, SimVm};
use luaud_vm::{ScriptVm, Value};

fn scope_refs(client: &mut DapClient, frame_id: i64) -> (i64, i64, i64) {
    let response = client.request("scopes", json!({ "frameId": frame_id }));
    assert!(response.success, "scopes failed: {response:?}");
    let body = response.body.expect("scopes body");
    let scopes = body["scopes"].as_array().expect("scopes array");
    let names: Vec<&str> = scopes
        .iter()
        .map(|scope| scope["name"].as_str().expect("scope name"))
        .collect();
    assert_eq!(names, ["Local", "Upvalues", "Globals"]);
    let reference = |index: usize| scopes[index]["variablesReference"].as_i64().expect("ref");
    (reference(0), reference(1), reference(2))
}

fn variable_rows(client: &mut DapClient, reference: i64) -> Vec<serde_json::Value> {
    let response = client.request("variables", json!({ "variablesReference": reference }));
    assert!(response.success, "variables failed: {response:?}");
    response.body.expect("variables body")["variables"]
        .as_array()
        .expect("variables array")
        .clone()
}

fn find_row<'a>(rows: &'a [serde_json::Value], name: &str) -> &'a serde_json::Value {
    rows.iter()
        .find(|row| row["name"] == name)
        .unwrap_or_else(|| panic!("no variable named {name} in {rows:?}"))
}

#[test]
fn upvalue_global_and_vector_mutation() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/scopes.lua")
            .upvalue("u", Value::Number(10.0))
            .stmt(
                1,
                Op::Assign("v".into(), ProgramExpr::Const(Value::Vector([1.0, 2.0, 3.0]))),
            )
            .stmt(
                2,
                Op::AssignGlobal("g".into(), ProgramExpr::Const(Value::Number(5.0))),
            )
            .stmt(3, Op::Nop)
            .stmt(4, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/scopes.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/scopes.lua", &[(3, None)]).success);
    harness.release();

    client.wait_event("stopped");
    let (locals, upvalues, globals) = scope_refs(&mut client, 0);

    // Upvalues: read, then write through the adapter.
    let rows = variable_rows(&mut client, upvalues);
    let row = find_row(&rows, "u");
    assert_eq!(row["value"], "10");
    assert_eq!(row["type"], "number");

    let response = client.request(
        "setVariable",
        json!({ "variablesReference": upvalues, "name": "u", "value": "42" }),
    );
    assert!(response.success, "setVariable failed: {response:?}");
    assert_eq!(response.body.expect("body")["value"], "42");
    client.wait_event("invalidated");
    let rows = variable_rows(&mut client, upvalues);
    assert_eq!(find_row(&rows, "u")["value"], "42");

    // Watch evaluation resolves the upvalue through the frame env.
    let response = client.request(
        "evaluate",
        json!({ "expression": "u + 1", "context": "watch", "frameId": 0 }),
    );
    assert!(response.success, "evaluate failed: {response:?}");
    let body = response.body.expect("evaluate body");
    assert_eq!(body["result"], "43");
    assert_eq!(body["variablesReference"], 0);

    // Globals scope shows the written global and accepts writes.
    let rows = variable_rows(&mut client, globals);
    assert_eq!(find_row(&rows, "g")["value"], "5");
    let response = client.request(
        "setVariable",
        json!({ "variablesReference": globals, "name": "g", "value": "7" }),
    );
    assert!(response.success, "setVariable failed: {response:?}");
    client.wait_event("invalidated");
    let rows = variable_rows(&mut client, globals);
    assert_eq!(find_row(&rows, "g")["value"], "7");

    // Vector local: display and literal construction on write.
    let rows = variable_rows(&mut client, locals);
    let row = find_row(&rows, "v");
    assert_eq!(row["value"], "(1, 2, 3)");
    assert_eq!(row["type"], "vector");
    let response = client.request(
        "setVariable",
        json!({ "variablesReference": locals, "name": "v", "value": "(4, 5, 6)" }),
    );
    assert!(response.success, "setVariable failed: {response:?}");
    assert_eq!(response.body.expect("body")["value"], "(4, 5, 6)");

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");

    // The upvalue write reached the closure itself.
    let function = vm.instantiate("main").expect("instance");
    let (name, value) = vm.get_upvalue(&function, 1).expect("upvalue slot");
    assert_eq!(name, "u");
    assert_eq!(value, Value::Number(42.0));
    let globals_table = vm.globals(vm.main_thread());
    assert_eq!(
        vm.raw_get(&globals_table, &Value::String("g".into())).unwrap(),
        Value::Number(7.0)
    );
}

#[test]
fn iter_metamethod_drives_expansion_and_tostring_display() {
    let vm = SimVm::new();

    // Custom iteration sequence surfaced through `__iter`.
    let sequence: Arc<Vec<(Value, Value)>> = Arc::new(vec![
        (Value::String("first".into()), Value::Number(10.0)),
        (Value::String("second".into()), Value::Number(20.0)),
    ]);
    let next_fn = {
        let sequence = Arc::clone(&sequence);
        vm.register_builtin(Arc::new(move |_vm, args: &[Value]| {
            let control = args.get(1).cloned().unwrap_or(Value::Nil);
            let position = match &control {
                Value::Nil => 0,
                key => sequence
                    .iter()
                    .position(|(k, _)| k == key)
                    .map_or(sequence.len(), |p| p + 1),
            };
            Ok(match sequence.get(position) {
                Some((key, value)) => vec![key.clone(), value.clone()],
                None => vec![Value::Nil],
            })
        }))
    };
    let iter_fn = {
        let next_fn = next_fn.clone();
        vm.register_builtin(Arc::new(move |_vm, _args: &[Value]| {
            Ok(vec![next_fn.clone(), Value::Nil, Value::Nil])
        }))
    };
    let tostring_fn = vm.register_builtin(Arc::new(|_vm, _args: &[Value]| {
        Ok(vec![Value::String("two points".into())])
    }));

    let metatable = vm.create_table(vec![
        (Value::String("__iter".into()), iter_fn),
        (Value::String("__tostring".into()), tostring_fn),
    ]);
    let table = vm.create_table(vec![(Value::String("hidden".into()), Value::Number(0.0))]);
    vm.set_metatable(&table, &metatable).expect("metatable");

    vm.register_proto(
        Proto::new("main", "@/scripts/iter.lua")
            .stmt(1, Op::Assign("p".into(), ProgramExpr::Const(table.clone())))
            .stmt(2, Op::Nop)
            .stmt(3, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/iter.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/iter.lua", &[(2, None)]).success);
    harness.release();

    client.wait_event("stopped");
    let (locals, _upvalues, _globals) = scope_refs(&mut client, 0);

    // Compound display carries the `__tostring` result.
    let rows = variable_rows(&mut client, locals);
    let row = find_row(&rows, "p");
    let display = row["value"].as_str().expect("display");
    assert!(display.starts_with("table: 0x"), "got {display}");
    assert!(display.ends_with("(two points)"), "got {display}");
    let reference = row["variablesReference"].as_i64().expect("child ref");
    assert_ne!(reference, 0);

    // Expansion follows `__iter`, not raw iteration.
    let rows = variable_rows(&mut client, reference);
    let names: Vec<&str> = rows
        .iter()
        .map(|row| row["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names, ["first", "second"]);
    assert_eq!(find_row(&rows, "first")["value"], "10");
    assert_eq!(find_row(&rows, "second")["value"], "20");

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
}

#[test]
fn entry_breakpoint_sequence_yields_one_stop_each() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/seq.lua")
            .stmt(1, Op::Assign("x".into(), ProgramExpr::Const(Value::Number(1.0))))
            .stmt(2, Op::Nop)
            .stmt(3, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/seq.lua", true);
    harness.release();

    let mut client = DapClient::connect(harness.port).expect("connect");
    let response = client.request("initialize", json!({"adapterID": "luaud"}));
    assert!(response.success);
    client.wait_event("initialized");
    assert!(client.request("attach", json!({})).success);
    assert!(client.set_breakpoints("/scripts/seq.lua", &[(2, None)]).success);
    assert!(client.request("configurationDone", json!({})).success);

    let stopped = client.wait_event("stopped");
    assert_eq!(stopped.body.expect("body")["reason"], "entry");
    assert!(client.request("continue", json!({})).success);

    let stopped = client.wait_event("stopped");
    assert_eq!(stopped.body.expect("body")["reason"], "breakpoint");
    assert!(client.request("continue", json!({})).success);

    assert!(client.assert_quiet("stopped", Duration::from_millis(300)));
    harness.join_vm().expect("script completes");
}

#[test]
fn scopes_exist_for_every_stack_frame() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("outer", "@/scripts/frames.lua")
            .stmt(1, Op::Call("inner".into()))
            .stmt(2, Op::Return),
    );
    vm.register_proto(
        Proto::new("inner", "@/scripts/frames.lua")
            .stmt(10, Op::Assign("n".into(), ProgramExpr::Const(Value::Number(1.0))))
            .stmt(11, Op::Nop)
            .stmt(12, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "outer", "@/scripts/frames.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/frames.lua", &[(11, None)]).success);
    harness.release();

    client.wait_event("stopped");
    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    let frames = response.body.expect("body")["stackFrames"]
        .as_array()
        .expect("frames")
        .clone();
    assert_eq!(frames.len(), 2);

    // Every reported frame id addresses a valid scope triple, and the
    // local scopes of different frames are distinct handles.
    let mut local_refs = Vec::new();
    for frame in &frames {
        let id = frame["id"].as_i64().expect("frame id");
        let (locals, _, _) = scope_refs(&mut client, id);
        local_refs.push(locals);
    }
    assert_ne!(local_refs[0], local_refs[1]);

    // An out-of-range frame is a request error, not a crash.
    let response = client.request("scopes", json!({ "frameId": 99 }));
    assert!(!response.success);

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
}

#[test]
fn not_paused_requests_fail_fast() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/fast.lua")
            .stmt(1, Op::Assign("i".into(), ProgramExpr::Const(Value::Number(0.0))))
            .stmt(2, Op::Nop)
            .stmt(
                3,
                Op::JumpIfLess {
                    local: "i".into(),
                    limit: 1.0,
                    target: 1,
                },
            )
            .stmt(4, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/fast.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    harness.release();

    // Running state: paused-only requests return errors, stackTrace is
    // empty, threads still answers.
    let response = client.request("variables", json!({ "variablesReference": 1 }));
    assert!(!response.success);
    let response = client.request("continue", json!({}));
    assert!(!response.success);
    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    assert!(response.success);
    assert_eq!(
        response.body.expect("body")["stackFrames"]
            .as_array()
            .expect("frames")
            .len(),
        0
    );
    let response = client.request("threads", json!({}));
    assert!(response.success);

    // Unblock the spin loop so the program can finish.
    assert!(client.request("pause", json!({})).success);
    client.wait_event("stopped");
    let response = client.request("scopes", json!({ "frameId": 0 }));
    assert!(response.success);
    let body = response.body.expect("body");
    let locals = body["scopes"][0]["variablesReference"]
        .as_i64()
        .expect("locals ref");
    assert!(client
        .request(
            "setVariable",
            json!({ "variablesReference": locals, "name": "i", "value": "9" })
        )
        .success);
    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
}

#[test]
fn breakpoint_snaps_to_next_executable_line() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/gaps.lua")
            .stmt(1, Op::Assign("x".into(), ProgramExpr::Const(Value::Number(1.0))))
            // Lines 2-4 hold no executable statements.
            .stmt(5, Op::Nop)
            .stmt(6, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/gaps.lua", true);
    harness.release();

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    client.wait_event("stopped");

    // Paused: the update applies synchronously and reports the line the
    // VM actually instrumented.
    let response = client.set_breakpoints("/scripts/gaps.lua", &[(2, None)]);
    assert!(response.success);
    let body = response.body.clone().expect("body");
    assert_eq!(body["breakpoints"][0]["verified"], true);
    assert_eq!(body["breakpoints"][0]["line"], 5);

    assert!(client.request("continue", json!({})).success);
    let stopped = client.wait_event("stopped");
    assert_eq!(stopped.body.expect("body")["reason"], "breakpoint");
    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    let frames = response.body.expect("body")["stackFrames"]
        .as_array()
        .expect("frames")
        .clone();
    assert_eq!(frames[0]["line"], 5);

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
}
