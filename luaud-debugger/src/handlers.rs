//! DAP request dispatch.
//!
//! One arm per supported request, each translating into a bridge
//! operation and producing the response (plus any follow-up events).
//! Handlers run on the session's read-loop thread; everything that has
//! to execute VM code goes through `DebugBridge::with_vm`.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use luaud_protocol::message::Request;
use luaud_protocol::types::{
    Breakpoint, Capabilities, ContinueResponseBody, DisconnectArguments, EvaluateArguments,
    EvaluateResponseBody, Scope, ScopesArguments, ScopesResponseBody, SetBreakpointsArguments,
    SetBreakpointsResponseBody, SetVariableArguments, SetVariableResponseBody, Source, StackFrame,
    StackTraceResponseBody, ThreadArguments, ThreadsResponseBody, Variable, VariablesArguments,
    VariablesResponseBody,
};

use crate::bridge::{BreakpointSnapshot, DebugBridge};
use crate::error::DebuggerError;
use crate::session::{Session, SessionKind};
use crate::stepping::StepKind;

/// Everything a handler needs.
pub struct HandlerContext {
    pub bridge: Arc<DebugBridge>,
    pub session: Arc<Session>,
    /// Invoked after a `disconnect` response when the session was a
    /// launch; defaults to exiting the process.
    pub terminate: Arc<dyn Fn() + Send + Sync>,
}

/// Handle one request. Returns false when the session should close.
pub fn dispatch(ctx: &HandlerContext, request: &Request) -> bool {
    info!(command = %request.command, seq = request.seq, "request");
    match request.command.as_str() {
        "initialize" => handle_initialize(ctx, request),
        "launch" => handle_session_kind(ctx, request, SessionKind::Launch),
        "attach" => handle_session_kind(ctx, request, SessionKind::Attach),
        "setExceptionBreakpoints" => {
            ctx.session
                .respond(request, Ok(Some(json!({ "breakpoints": [] }))));
            true
        }
        "configurationDone" => {
            ctx.session.respond(request, Ok(None));
            true
        }
        "setBreakpoints" => handle_set_breakpoints(ctx, request),
        "threads" => handle_threads(ctx, request),
        "stackTrace" => handle_stack_trace(ctx, request),
        "scopes" => handle_scopes(ctx, request),
        "variables" => handle_variables(ctx, request),
        "setVariable" => handle_set_variable(ctx, request),
        "evaluate" => handle_evaluate(ctx, request),
        "continue" => handle_continue(ctx, request),
        "next" => handle_step(ctx, request, StepKind::Over),
        "stepIn" => handle_step(ctx, request, StepKind::In),
        "stepOut" => handle_step(ctx, request, StepKind::Out),
        "pause" => {
            // The whole VM pauses; the thread id is advisory.
            let _args: ThreadArguments = parse_args(request).unwrap_or_default();
            ctx.bridge.request_pause();
            ctx.session.respond(request, Ok(None));
            true
        }
        "disconnect" => handle_disconnect(ctx, request),
        other => {
            warn!("unsupported DAP command: {other}");
            ctx.session
                .respond(request, Err(format!("unsupported command: {other}")));
            true
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, String> {
    let arguments = request.arguments.clone().unwrap_or_else(|| json!({}));
    serde_json::from_value(arguments).map_err(|e| format!("invalid arguments: {e}"))
}

fn handle_initialize(ctx: &HandlerContext, request: &Request) -> bool {
    let body = serde_json::to_value(Capabilities::default()).ok();
    ctx.session.respond(request, Ok(body));
    // The entry break waits on the session; connect only after the
    // initialized event is on the wire.
    ctx.session.send_initialized();
    ctx.bridge.on_connect(Arc::clone(&ctx.session));
    true
}

fn handle_session_kind(ctx: &HandlerContext, request: &Request, kind: SessionKind) -> bool {
    ctx.session.set_kind(kind);
    ctx.session.respond(request, Ok(None));
    true
}

fn handle_set_breakpoints(ctx: &HandlerContext, request: &Request) -> bool {
    let args: SetBreakpointsArguments = match parse_args(request) {
        Ok(args) => args,
        Err(e) => {
            ctx.session.respond(request, Err(e));
            return true;
        }
    };
    let Some(path) = args.source.path.clone() else {
        ctx.session
            .respond(request, Err("source has no path".to_string()));
        return true;
    };

    let requested: Option<Vec<(u32, Option<String>)>> = args
        .breakpoints
        .as_ref()
        .map(|list| list.iter().map(|bp| (bp.line, bp.condition.clone())).collect());

    let applied = ctx.bridge.set_breakpoints(&path, requested.clone());

    let rows: Vec<Breakpoint> = match applied {
        Some(snapshots) => snapshots
            .iter()
            .map(|snapshot| to_breakpoint_row(&path, snapshot))
            .collect(),
        // Queued for the next interrupt; report the requested lines.
        None => requested
            .unwrap_or_default()
            .iter()
            .map(|(line, _)| Breakpoint {
                id: Some(i64::from(*line)),
                verified: true,
                message: None,
                source: Some(Source::from_path(path.clone())),
                line: Some(*line),
            })
            .collect(),
    };

    let body = serde_json::to_value(SetBreakpointsResponseBody { breakpoints: rows }).ok();
    ctx.session.respond(request, Ok(body));
    true
}

fn to_breakpoint_row(path: &str, snapshot: &BreakpointSnapshot) -> Breakpoint {
    Breakpoint {
        id: Some(i64::from(snapshot.line)),
        verified: snapshot.verified,
        message: None,
        source: Some(Source::from_path(path.to_string())),
        line: Some(snapshot.target_line),
    }
}

fn handle_threads(ctx: &HandlerContext, request: &Request) -> bool {
    let threads = ctx
        .bridge
        .thread_rows()
        .into_iter()
        .map(|row| luaud_protocol::types::Thread {
            id: row.key,
            name: row.name,
        })
        .collect();
    let body = serde_json::to_value(ThreadsResponseBody { threads }).ok();
    ctx.session.respond(request, Ok(body));
    true
}

fn handle_stack_trace(ctx: &HandlerContext, request: &Request) -> bool {
    let frames: Vec<StackFrame> = ctx
        .bridge
        .stack_frames()
        .into_iter()
        .filter(|frame| !frame.is_native)
        .map(|frame| StackFrame {
            id: i64::from(frame.depth),
            name: frame.name,
            source: if frame.source.is_empty() {
                None
            } else {
                Some(Source::from_path(frame.source))
            },
            line: frame.line,
            column: 0,
        })
        .collect();
    let body = serde_json::to_value(StackTraceResponseBody {
        total_frames: frames.len() as i64,
        stack_frames: frames,
    })
    .ok();
    ctx.session.respond(request, Ok(body));
    true
}

fn handle_scopes(ctx: &HandlerContext, request: &Request) -> bool {
    let args: ScopesArguments = match parse_args(request) {
        Ok(args) => args,
        Err(e) => {
            ctx.session.respond(request, Err(e));
            return true;
        }
    };
    match ctx.bridge.frame_scopes(args.frame_id) {
        Ok(scopes) => {
            let body = serde_json::to_value(ScopesResponseBody {
                scopes: vec![
                    Scope {
                        name: "Local".to_string(),
                        variables_reference: scopes.locals,
                        expensive: false,
                    },
                    Scope {
                        name: "Upvalues".to_string(),
                        variables_reference: scopes.upvalues,
                        expensive: false,
                    },
                    Scope {
                        name: "Globals".to_string(),
                        variables_reference: scopes.globals,
                        expensive: true,
                    },
                ],
            })
            .ok();
            ctx.session.respond(request, Ok(body));
        }
        Err(e) => ctx.session.respond(request, Err(e.to_string())),
    }
    true
}

fn handle_variables(ctx: &HandlerContext, request: &Request) -> bool {
    let args: VariablesArguments = match parse_args(request) {
        Ok(args) => args,
        Err(e) => {
            ctx.session.respond(request, Err(e));
            return true;
        }
    };

    let reference = args.variables_reference;
    let result = ctx
        .bridge
        .with_vm(move |bridge| bridge.variables_on_vm(reference));

    let body = match result {
        Ok(Ok(rows)) => {
            let variables = rows
                .into_iter()
                .map(|row| Variable {
                    name: row.name,
                    value: row.display_value,
                    value_type: Some(row.display_type),
                    variables_reference: row.child,
                })
                .collect();
            Ok(serde_json::to_value(VariablesResponseBody { variables }).ok())
        }
        // Unknown handles produce an empty list rather than a failure:
        // stale requests race with invalidation in every client.
        Ok(Err(DebuggerError::UnknownScope(key))) => {
            warn!("variables request for unknown scope {key}");
            Ok(serde_json::to_value(VariablesResponseBody { variables: Vec::new() }).ok())
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    ctx.session.respond(request, body);
    true
}

fn handle_set_variable(ctx: &HandlerContext, request: &Request) -> bool {
    let args: SetVariableArguments = match parse_args(request) {
        Ok(args) => args,
        Err(e) => {
            ctx.session.respond(request, Err(e));
            return true;
        }
    };

    let reference = args.variables_reference;
    let name = args.name.clone();
    let value = args.value.clone();
    let result = ctx
        .bridge
        .with_vm(move |bridge| bridge.set_variable_on_vm(reference, &name, &value));

    match result {
        Ok(Ok(outcome)) => {
            let body = serde_json::to_value(SetVariableResponseBody {
                value: outcome.display_value,
                value_type: Some(outcome.display_type),
                variables_reference: outcome.child,
            })
            .ok();
            ctx.session.respond(request, Ok(body));
            // A successful mutation stales every expanded snapshot.
            ctx.bridge.invalidate();
        }
        Ok(Err(e)) => {
            respond_vm_error(ctx, request, &e);
        }
        Err(e) => ctx.session.respond(request, Err(e.to_string())),
    }
    true
}

/// A script-side failure: error response plus a console diagnostic.
fn respond_vm_error(ctx: &HandlerContext, request: &Request, error: &DebuggerError) {
    let message = error.to_string();
    ctx.session.respond(request, Err(message.clone()));
    if matches!(error, DebuggerError::Vm(_) | DebuggerError::Eval(_)) {
        ctx.session
            .send_output("console", &format!("{message}\n"), None, None);
    }
}

fn handle_evaluate(ctx: &HandlerContext, request: &Request) -> bool {
    let args: EvaluateArguments = match parse_args(request) {
        Ok(args) => args,
        Err(e) => {
            ctx.session.respond(request, Err(e));
            return true;
        }
    };

    let Some(context) = args.context.clone() else {
        ctx.session
            .respond(request, Err("evaluate request must have a context".to_string()));
        return true;
    };
    if context != "repl" && context != "watch" {
        ctx.session
            .respond(request, Err(format!("invalid evaluate context: {context}")));
        return true;
    }

    let expression = args.expression.clone();
    let frame_id = args.frame_id;
    let result = ctx
        .bridge
        .with_vm(move |bridge| bridge.evaluate_on_vm(&expression, frame_id));

    match result {
        Ok(Ok(outcome)) => {
            let body = serde_json::to_value(EvaluateResponseBody {
                result: outcome.result,
                value_type: outcome.value_type,
                variables_reference: outcome.reference,
            })
            .ok();
            ctx.session.respond(request, Ok(body));
            // REPL statements may assign; force clients to re-read.
            if context == "repl" {
                ctx.bridge.invalidate();
            }
        }
        Ok(Err(e)) => {
            respond_vm_error(ctx, request, &e);
        }
        Err(e) => ctx.session.respond(request, Err(e.to_string())),
    }
    true
}

fn handle_continue(ctx: &HandlerContext, request: &Request) -> bool {
    match ctx.bridge.resume() {
        Ok(()) => {
            let body = serde_json::to_value(ContinueResponseBody {
                all_threads_continued: true,
            })
            .ok();
            ctx.session.respond(request, Ok(body));
        }
        Err(e) => ctx.session.respond(request, Err(e.to_string())),
    }
    true
}

fn handle_step(ctx: &HandlerContext, request: &Request, kind: StepKind) -> bool {
    let _args: ThreadArguments = parse_args(request).unwrap_or_default();
    match ctx.bridge.step(kind) {
        Ok(()) => ctx.session.respond(request, Ok(None)),
        Err(e) => ctx.session.respond(request, Err(e.to_string())),
    }
    true
}

fn handle_disconnect(ctx: &HandlerContext, request: &Request) -> bool {
    let _args: DisconnectArguments = parse_args(request).unwrap_or_default();
    let kind = ctx.session.kind();
    ctx.bridge.on_disconnect();
    ctx.session.respond(request, Ok(None));
    if kind == SessionKind::Launch {
        info!("launch session disconnected, terminating process");
        (ctx.terminate)();
    }
    false
}
