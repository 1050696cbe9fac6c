// ABOUTME: Debug session setup and teardown: initialize, launch, attach, configurationDone, disconnect
// ABOUTME: Launch and attach go through the launch gate; disconnect waits for the engine to settle
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::path::{Path, PathBuf};
use std::sync::Arc;

use psbridge::engine::ExecutionRequest;
use psbridge::pending::Settlement;
use psbridge::pwsh::quote_literal;
use psbridge::{Dispatcher, RequestContext, ResponseError};
use serde_json::Value;
use tracing::{debug, info};

use crate::protocol::{capabilities, AttachArguments, InitializeArguments, LaunchArguments, ProcessId};
use crate::state::{DebuggeeExit, LaunchKind, LaunchPlan, SharedState};

/// Plan for a `launch` request
///
/// An existing file runs as a script with its arguments; any other text runs
/// as an inline command. No script at all keeps an interactive session.
pub fn launch_plan(args: &LaunchArguments, working_directory: Option<&Path>) -> LaunchPlan {
    let request = args
        .script
        .as_deref()
        .map(str::trim)
        .filter(|script| !script.is_empty())
        .map(|script| {
            let candidate = PathBuf::from(script);
            let path = match working_directory {
                Some(dir) if candidate.is_relative() => dir.join(&candidate),
                _ => candidate,
            };
            let request = if path.is_file() {
                ExecutionRequest::script(path, args.args.clone())
            } else {
                ExecutionRequest::command(script).with_output(true)
            };
            request.with_stop_on_entry(args.stop_on_entry)
        });
    LaunchPlan {
        kind: LaunchKind::Launch,
        request,
    }
}

/// Command that enters the attach target and starts debugging its runspace
pub fn attach_command(args: &AttachArguments) -> Result<String, ResponseError> {
    let mut steps = Vec::new();
    if let Some(computer) = &args.computer_name {
        steps.push(format!("Enter-PSSession -ComputerName {}", quote_literal(computer)));
    }

    let process_id = match &args.process_id {
        Some(ProcessId::Number(id)) => Some(*id),
        Some(ProcessId::Text(text)) => Some(text.trim().parse::<u32>().map_err(|_| {
            ResponseError::invalid_params(format!("processId '{text}' is not a process id"))
        })?),
        None => None,
    };

    match process_id {
        Some(id) => {
            steps.push(format!("Enter-PSHostProcess -Id {id}"));
            steps.push(match (&args.runspace_name, args.runspace_id) {
                (Some(name), _) => format!("Debug-Runspace -Name {}", quote_literal(name)),
                (None, Some(id)) => format!("Debug-Runspace -Id {id}"),
                (None, None) => "Debug-Runspace -Id 1".to_owned(),
            });
        }
        None if steps.is_empty() => {
            return Err(ResponseError::invalid_params(
                "attach needs a processId or a computerName",
            ));
        }
        None => {}
    }
    Ok(steps.join("; "))
}

/// Run the debuggee detached; its completion is reported as a debuggee exit
pub fn start(state: &SharedState, plan: LaunchPlan) {
    let Some(request) = plan.request else {
        info!(kind = ?plan.kind, "No debuggee to run, keeping an interactive session");
        return;
    };
    info!(kind = ?plan.kind, command = request.label(), "Starting debuggee");
    let s = Arc::clone(state);
    state.session().execute_detached(request, move |result| async move {
        let error = match result {
            Ok(output) => {
                debug!(had_errors = output.had_errors, "Debuggee finished");
                None
            }
            Err(e) => Some(e.message),
        };
        s.debuggee_exited(DebuggeeExit { error });
        Ok(())
    });
}

fn admit_plan(state: &SharedState, plan: LaunchPlan) -> Result<(), ResponseError> {
    if let Some(plan) = state.plan(plan)? {
        start(state, plan);
    }
    Ok(())
}

async fn settle(ctx: &RequestContext, state: &SharedState) -> Result<(), ResponseError> {
    let settlement = state.session().disconnect(ctx.request_id().clone()).await?;
    if settlement == Settlement::Terminated {
        debug!("Session terminated while settling");
    }
    Ok(())
}

/// Register session setup and teardown commands
pub fn register(dispatcher: &mut Dispatcher, state: &SharedState) {
    dispatcher.on_request("initialize", |ctx, args: InitializeArguments| async move {
        info!(client = ?args.client_name, adapter = ?args.adapter_id, "DAP client connected");
        ctx.send_event_after_response("initialized", &Value::Null)?;
        Ok::<_, ResponseError>(capabilities())
    });

    let s = Arc::clone(state);
    dispatcher.on_request("launch", move |_ctx, args: LaunchArguments| {
        let state = Arc::clone(&s);
        async move {
            let plan = launch_plan(&args, state.config().working_directory.as_deref());
            admit_plan(&state, plan)?;
            Ok::<_, ResponseError>(Value::Null)
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("attach", move |_ctx, args: AttachArguments| {
        let state = Arc::clone(&s);
        async move {
            let command = attach_command(&args)?;
            let plan = LaunchPlan {
                kind: LaunchKind::Attach,
                request: Some(ExecutionRequest::command(command).with_output(true)),
            };
            admit_plan(&state, plan)?;
            Ok::<_, ResponseError>(Value::Null)
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("configurationDone", move |_ctx, _args: Value| {
        let state = Arc::clone(&s);
        async move {
            if let Some(plan) = state.configuration_done() {
                start(&state, plan);
            }
            Ok::<_, ResponseError>(Value::Null)
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("disconnect", move |ctx, _args: Value| {
        let state = Arc::clone(&s);
        async move {
            settle(&ctx, &state).await?;
            state.mark_disconnected();
            ctx.shutdown_after_response();
            info!("Debug client disconnected");
            Ok::<_, ResponseError>(Value::Null)
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("terminate", move |ctx, _args: Value| {
        let state = Arc::clone(&s);
        async move {
            settle(&ctx, &state).await?;
            if state.claim_terminated() {
                ctx.send_event_after_response("terminated", &Value::Null)?;
            }
            Ok::<_, ResponseError>(Value::Null)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn existing_file_launches_as_script() {
        let mut file = tempfile::Builder::new()
            .suffix(".ps1")
            .tempfile()
            .expect("temp script");
        writeln!(file, "Write-Output hi").expect("write");
        let args = LaunchArguments {
            script: Some(file.path().display().to_string()),
            args: vec!["-Name".to_owned(), "x".to_owned()],
            stop_on_entry: true,
        };
        let request = launch_plan(&args, None).request.expect("request");
        assert_eq!(request.script.as_deref(), Some(file.path()));
        assert_eq!(request.arguments, args.args);
        assert!(request.stop_on_entry);
    }

    #[test]
    fn unknown_path_runs_as_inline_command() {
        let args = LaunchArguments {
            script: Some("Get-Date".to_owned()),
            ..LaunchArguments::default()
        };
        let request = launch_plan(&args, None).request.expect("request");
        assert_eq!(request.command, "Get-Date");
        assert!(request.script.is_none());
        assert!(request.write_output);
    }

    #[test]
    fn blank_script_keeps_interactive_session() {
        let args = LaunchArguments {
            script: Some("  ".to_owned()),
            ..LaunchArguments::default()
        };
        assert!(launch_plan(&args, None).request.is_none());
    }

    #[test]
    fn attach_builds_host_process_and_runspace_commands() {
        let args = AttachArguments {
            process_id: Some(ProcessId::Text("4242".to_owned())),
            runspace_name: Some("Worker's".to_owned()),
            ..AttachArguments::default()
        };
        assert_eq!(
            attach_command(&args).expect("command"),
            "Enter-PSHostProcess -Id 4242; Debug-Runspace -Name 'Worker''s'"
        );
    }

    #[test]
    fn attach_without_target_is_rejected() {
        assert!(attach_command(&AttachArguments::default()).is_err());
        let bad = AttachArguments {
            process_id: Some(ProcessId::Text("host".to_owned())),
            ..AttachArguments::default()
        };
        assert!(attach_command(&bad).is_err());
    }
}
