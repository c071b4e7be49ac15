//! End-to-end scenarios over a real TCP session: simulated VM on its
//! own thread, DAP client on the test thread.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::Harness;
use luaud_testing::{DapClient, Op, ProgramExpr, Proto, SimVm};
use luaud_vm::{ScriptVm, Value};

fn global_of(vm: &SimVm, name: &str) -> Value {
    let globals = vm.globals(vm.main_thread());
    vm.raw_get(&globals, &Value::String(name.to_string()))
        .expect("globals is a table")
}

/// Find a scope's variables reference by name in a `scopes` response.
fn scope_ref(client: &mut DapClient, frame_id: i64, name: &str) -> i64 {
    let response = client.request("scopes", json!({ "frameId": frame_id }));
    assert!(response.success, "scopes failed: {response:?}");
    let body = response.body.expect("scopes body");
    body["scopes"]
        .as_array()
        .expect("scopes array")
        .iter()
        .find(|scope| scope["name"] == name)
        .unwrap_or_else(|| panic!("no scope named {name}"))["variablesReference"]
        .as_i64()
        .expect("variablesReference")
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

// ── scenario: stop on entry ──────────────────────────────────────────────

#[test]
fn stop_on_entry_then_run_to_completion() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/main.lua")
            .stmt(1, Op::Assign("x".into(), ProgramExpr::Const(Value::Number(1.0))))
            .stmt(2, Op::Assign("x".into(), ProgramExpr::Add("x".into(), 2.0)))
            .stmt(3, Op::AssignGlobal("finished".into(), ProgramExpr::Var("x".into())))
            .stmt(4, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/main.lua", true);
    harness.release();

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();

    let stopped = client.wait_event("stopped");
    let body = stopped.body.expect("stopped body");
    assert_eq!(body["reason"], "entry");
    assert_eq!(body["threadId"], 1);

    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    assert!(response.success);
    let frames = response.body.expect("stackTrace body")["stackFrames"]
        .as_array()
        .expect("frames")
        .clone();
    assert_eq!(frames[0]["id"], 0);
    assert_eq!(frames[0]["line"], 1);
    assert_eq!(frames[0]["source"]["path"], "/scripts/main.lua");

    let response = client.request("continue", json!({ "threadId": 1 }));
    assert!(response.success);
    assert_eq!(
        response.body.expect("continue body")["allThreadsContinued"],
        true
    );

    harness.join_vm().expect("script completes");
    assert_eq!(global_of(&vm, "finished"), Value::Number(3.0));
}

// ── scenario: conditional breakpoint in a loop ───────────────────────────

#[test]
fn conditional_breakpoint_stops_once() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/loop.lua")
            .stmt(1, Op::Assign("i".into(), ProgramExpr::Const(Value::Number(0.0))))
            .stmt(2, Op::Assign("i".into(), ProgramExpr::Add("i".into(), 1.0)))
            .stmt(3, Op::Nop)
            .stmt(
                4,
                Op::JumpIfLess {
                    local: "i".into(),
                    limit: 5.0,
                    target: 1,
                },
            )
            .stmt(5, Op::AssignGlobal("total".into(), ProgramExpr::Var("i".into())))
            .stmt(6, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/loop.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    let response = client.set_breakpoints("/scripts/loop.lua", &[(3, Some("i == 3"))]);
    assert!(response.success);

    harness.release();

    let stopped = client.wait_event("stopped");
    assert_eq!(stopped.body.expect("stopped body")["reason"], "breakpoint");

    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    let frames = response.body.expect("body")["stackFrames"]
        .as_array()
        .expect("frames")
        .clone();
    assert_eq!(frames[0]["line"], 3);

    let locals = scope_ref(&mut client, 0, "Local");
    let rows = variable_rows(&mut client, locals);
    let row = find_row(&rows, "i");
    assert_eq!(row["value"], "3");
    assert_eq!(row["type"], "number");
    assert_eq!(row["variablesReference"], 0);

    assert!(client.request("continue", json!({})).success);
    // The condition only holds once; no further stops.
    assert!(client.assert_quiet("stopped", Duration::from_millis(300)));

    harness.join_vm().expect("script completes");
    assert_eq!(global_of(&vm, "total"), Value::Number(5.0));
}

// ── scenario: setVariable on a string local ──────────────────────────────

#[test]
fn set_variable_updates_local_and_invalidates() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/strings.lua")
            .stmt(
                1,
                Op::Assign("x".into(), ProgramExpr::Const(Value::String("lo".into()))),
            )
            .stmt(2, Op::Nop)
            .stmt(3, Op::AssignGlobal("seen".into(), ProgramExpr::Var("x".into())))
            .stmt(4, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/strings.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/strings.lua", &[(2, None)]).success);
    harness.release();

    client.wait_event("stopped");
    let locals = scope_ref(&mut client, 0, "Local");
    let rows = variable_rows(&mut client, locals);
    assert_eq!(find_row(&rows, "x")["value"], "lo");

    let response = client.request(
        "setVariable",
        json!({ "variablesReference": locals, "name": "x", "value": "\"hi\"" }),
    );
    assert!(response.success, "setVariable failed: {response:?}");
    let body = response.body.expect("setVariable body");
    assert_eq!(body["value"], "hi");
    assert_eq!(body["variablesReference"], 0);

    let invalidated = client.wait_event("invalidated");
    assert_eq!(
        invalidated.body.expect("invalidated body")["areas"][0],
        "variables"
    );

    let rows = variable_rows(&mut client, locals);
    assert_eq!(find_row(&rows, "x")["value"], "hi");

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
    assert_eq!(global_of(&vm, "seen"), Value::String("hi".into()));
}

// ── scenario: stepping across a coroutine ────────────────────────────────

#[test]
fn step_over_stays_in_caller_step_in_enters_coroutine() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/co.lua")
            .stmt(
                1,
                Op::SpawnCoroutine {
                    proto: "worker".into(),
                    local: "co".into(),
                },
            )
            .stmt(2, Op::Resume("co".into()))
            .stmt(3, Op::Resume("co".into()))
            .stmt(
                4,
                Op::AssignGlobal("done".into(), ProgramExpr::Const(Value::Boolean(true))),
            )
            .stmt(5, Op::Return),
    );
    vm.register_proto(
        Proto::new("worker", "@/scripts/co.lua")
            .stmt(10, Op::Assign("a".into(), ProgramExpr::Const(Value::Number(1.0))))
            .stmt(11, Op::Yield)
            .stmt(12, Op::Assign("a".into(), ProgramExpr::Const(Value::Number(2.0))))
            .stmt(13, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/co.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/co.lua", &[(2, None)]).success);
    harness.release();

    client.wait_event("stopped");

    // Step over the resume: the coroutine runs to its yield, the stop
    // lands on the caller's next line.
    assert!(client.request("next", json!({ "threadId": 1 })).success);
    let stopped = client.wait_event("stopped");
    assert_eq!(stopped.body.expect("body")["reason"], "step");
    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    let frames = response.body.expect("body")["stackFrames"]
        .as_array()
        .expect("frames")
        .clone();
    assert_eq!(frames[0]["name"], "main");
    assert_eq!(frames[0]["line"], 3);

    // Step in: execution lands inside the resumed coroutine.
    assert!(client.request("stepIn", json!({ "threadId": 1 })).success);
    client.wait_event("stopped");
    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    let frames = response.body.expect("body")["stackFrames"]
        .as_array()
        .expect("frames")
        .clone();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["name"], "worker");
    assert_eq!(frames[0]["line"], 12);
    assert_eq!(frames[1]["name"], "main");
    assert_eq!(frames[1]["line"], 3);

    // Both script threads are advertised; the main thread is id 1.
    let response = client.request("threads", json!({}));
    let threads = response.body.expect("body")["threads"]
        .as_array()
        .expect("threads")
        .clone();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().any(|t| t["id"] == 1));

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
    assert_eq!(global_of(&vm, "done"), Value::Boolean(true));
}

// ── scenario: evaluate a table in the paused frame ───────────────────────

#[test]
fn evaluate_expands_table_results() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/tables.lua")
            .stmt(
                1,
                Op::Assign(
                    "t".into(),
                    ProgramExpr::Table(vec![
                        (Value::String("a".into()), Value::Number(1.0)),
                        (Value::String("b".into()), Value::Number(2.0)),
                    ]),
                ),
            )
            .stmt(2, Op::Nop)
            .stmt(3, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/tables.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/tables.lua", &[(2, None)]).success);
    harness.release();

    client.wait_event("stopped");

    let response = client.request(
        "evaluate",
        json!({ "expression": "t", "context": "repl", "frameId": 0 }),
    );
    assert!(response.success, "evaluate failed: {response:?}");
    let body = response.body.expect("evaluate body");
    assert_eq!(body["type"], "table");
    let reference = body["variablesReference"].as_i64().expect("reference");
    assert_ne!(reference, 0);
    assert!(body["result"]
        .as_str()
        .expect("result string")
        .starts_with("table: 0x"));

    let rows = variable_rows(&mut client, reference);
    assert_eq!(find_row(&rows, "a")["value"], "1");
    assert_eq!(find_row(&rows, "b")["value"], "2");

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
}

// ── scenario: disconnect while paused ────────────────────────────────────

#[test]
fn disconnect_resumes_the_vm_and_allows_reattach() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/disc.lua")
            .stmt(1, Op::Assign("x".into(), ProgramExpr::Const(Value::Number(1.0))))
            .stmt(2, Op::Nop)
            .stmt(
                3,
                Op::AssignGlobal("ran".into(), ProgramExpr::Const(Value::Boolean(true))),
            )
            .stmt(4, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/disc.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/disc.lua", &[(2, None)]).success);
    harness.release();

    client.wait_event("stopped");
    let response = client.request("disconnect", json!({}));
    assert!(response.success);
    assert!(client.take_queued_event("stopped").is_none());

    harness.join_vm().expect("script completes after disconnect");
    assert_eq!(global_of(&vm, "ran"), Value::Boolean(true));

    // A second client can attach to the same adapter.
    let mut second = DapClient::connect(harness.port).expect("reconnect");
    second.handshake_attach();
    let response = second.request("disconnect", json!({}));
    assert!(response.success);
}

// ── scenario: condition errors stop and report ───────────────────────────

#[test]
fn condition_error_stops_and_emits_diagnostic() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/bad.lua")
            .stmt(1, Op::Assign("x".into(), ProgramExpr::Const(Value::Number(1.0))))
            .stmt(2, Op::Nop)
            .stmt(3, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/bad.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/bad.lua", &[(2, Some("x ~"))]).success);
    harness.release();

    let stopped = client.wait_event("stopped");
    assert_eq!(stopped.body.expect("body")["reason"], "breakpoint");

    let output = client
        .take_queued_event("output")
        .unwrap_or_else(|| client.wait_event("output"));
    let body = output.body.expect("output body");
    assert!(body["output"]
        .as_str()
        .expect("output text")
        .contains("condition"));

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
}

// ── scenario: pause while running ────────────────────────────────────────

#[test]
fn pause_interrupts_a_spinning_program() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/spin.lua")
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
            .stmt(
                4,
                Op::AssignGlobal("exited".into(), ProgramExpr::Const(Value::Boolean(true))),
            )
            .stmt(5, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/spin.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    harness.release();

    // Let the loop spin, then ask for a pause.
    std::thread::sleep(Duration::from_millis(50));
    assert!(client.request("pause", json!({ "threadId": 1 })).success);
    let stopped = client.wait_event("stopped");
    assert_eq!(stopped.body.expect("body")["reason"], "pause");

    // Break the loop by writing the counter, then resume.
    let locals = scope_ref(&mut client, 0, "Local");
    let response = client.request(
        "setVariable",
        json!({ "variablesReference": locals, "name": "i", "value": "5" }),
    );
    assert!(response.success, "setVariable failed: {response:?}");
    assert_eq!(response.body.expect("body")["value"], "5");

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
    assert_eq!(global_of(&vm, "exited"), Value::Boolean(true));
}

// ── stepping within one thread ───────────────────────────────────────────

#[test]
fn step_in_and_out_of_a_function_call() {
    let vm = SimVm::new();
    vm.register_proto(
        Proto::new("main", "@/scripts/calls.lua")
            .stmt(1, Op::Nop)
            .stmt(2, Op::Call("helper".into()))
            .stmt(3, Op::AssignGlobal("after".into(), ProgramExpr::Const(Value::Boolean(true))))
            .stmt(4, Op::Return),
    );
    vm.register_proto(
        Proto::new("helper", "@/scripts/calls.lua")
            .stmt(20, Op::Assign("h".into(), ProgramExpr::Const(Value::Number(7.0))))
            .stmt(21, Op::Return),
    );
    let mut harness = Harness::start(Arc::clone(&vm), "main", "@/scripts/calls.lua", false);

    let mut client = DapClient::connect(harness.port).expect("connect");
    client.handshake_attach();
    assert!(client.set_breakpoints("/scripts/calls.lua", &[(2, None)]).success);
    harness.release();

    client.wait_event("stopped");

    // Step in lands on the first line of the callee.
    assert!(client.request("stepIn", json!({ "threadId": 1 })).success);
    client.wait_event("stopped");
    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    let frames = response.body.expect("body")["stackFrames"]
        .as_array()
        .expect("frames")
        .clone();
    assert_eq!(frames[0]["name"], "helper");
    assert_eq!(frames[0]["line"], 20);

    // Step out returns to the caller.
    assert!(client.request("stepOut", json!({ "threadId": 1 })).success);
    client.wait_event("stopped");
    let response = client.request("stackTrace", json!({ "threadId": 1 }));
    let frames = response.body.expect("body")["stackFrames"]
        .as_array()
        .expect("frames")
        .clone();
    assert_eq!(frames[0]["name"], "main");
    assert_eq!(frames[0]["line"], 3);

    assert!(client.request("continue", json!({})).success);
    harness.join_vm().expect("script completes");
    assert_eq!(global_of(&vm, "after"), Value::Boolean(true));
}
