// ABOUTME: End-to-end language server tests over an in-memory duplex connection
// ABOUTME: Drives lifecycle, document sync, diagnostics, and engine-backed features with a scripted engine
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use psbridge::analysis::Analyzer;
use psbridge::codec::{encode_frame, MessageReader};
use psbridge::engine::{EngineError, EngineEvent, OutputCategory, RunspaceInfo, RunspaceKind};
use psbridge::message::{Event, Request, Response, INVALID_REQUEST, SERVER_NOT_INITIALIZED};
use psbridge::symbols::{DeclarationSymbols, SymbolProvider};
use psbridge::testing::{ScriptedEngine, StaticAnalyzer, Step};
use psbridge::workspace::{InMemoryWorkspace, Position, ScriptFile, Workspace};
use psbridge::{
    BridgeConfig, BridgeError, JsonRpcDialect, LogFaultSink, Message, RequestId,
    SessionCoordinator, TransportChannel,
};
use psbridge_lsp::handlers::extension::{
    extension_command_text, MODULES_COMMAND, RETRY_ACTION, VERSION_COMMAND,
};
use psbridge_lsp::handlers::language::{completion_command, help_command};
use psbridge_lsp::{LanguageServer, LanguageServices};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

const URI: &str = "file:///tmp/psbridge-lsp-test/script.ps1";
const WAIT: Duration = Duration::from_secs(5);

struct Client {
    reader: MessageReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    backlog: VecDeque<Message>,
    next_id: i64,
}

impl Client {
    async fn send(&mut self, body: Value) {
        let bytes = serde_json::to_vec(&body).expect("encode");
        self.writer
            .write_all(&encode_frame(&bytes))
            .await
            .expect("write");
    }

    async fn request(&mut self, method: &str, params: Value) -> Response {
        self.next_id += 1;
        let id = self.next_id;
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        self.response(id).await
    }

    async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    async fn next_message(&mut self) -> Message {
        tokio::time::timeout(WAIT, self.reader.read_message())
            .await
            .expect("timely message")
            .expect("read")
            .expect("frame")
            .expect("decode")
    }

    async fn response(&mut self, id: i64) -> Response {
        let wanted = RequestId::Number(id);
        if let Some(index) = self
            .backlog
            .iter()
            .position(|m| matches!(m, Message::Response(r) if r.id == wanted))
        {
            if let Some(Message::Response(response)) = self.backlog.remove(index) {
                return response;
            }
        }
        loop {
            match self.next_message().await {
                Message::Response(response) if response.id == wanted => return response,
                other => self.backlog.push_back(other),
            }
        }
    }

    async fn wait_event(&mut self, method: &str) -> Event {
        if let Some(index) = self
            .backlog
            .iter()
            .position(|m| matches!(m, Message::Event(e) if e.method == method))
        {
            if let Some(Message::Event(event)) = self.backlog.remove(index) {
                return event;
            }
        }
        loop {
            match self.next_message().await {
                Message::Event(event) if event.method == method => return event,
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Next request the server sent to the client
    async fn server_request(&mut self, method: &str) -> Request {
        if let Some(index) = self
            .backlog
            .iter()
            .position(|m| matches!(m, Message::Request(r) if r.method == method))
        {
            if let Some(Message::Request(request)) = self.backlog.remove(index) {
                return request;
            }
        }
        loop {
            match self.next_message().await {
                Message::Request(request) if request.method == method => return request,
                other => self.backlog.push_back(other),
            }
        }
    }

    async fn reply(&mut self, id: &RequestId, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    fn has_event(&self, method: &str) -> bool {
        self.backlog
            .iter()
            .any(|m| matches!(m, Message::Event(e) if e.method == method))
    }

    async fn initialize(&mut self) {
        let response = self
            .request("initialize", json!({"processId": null, "capabilities": {}}))
            .await;
        assert!(response.outcome.is_ok(), "initialize failed: {response:?}");
        self.notify("initialized", json!({})).await;
    }

    async fn open(&mut self, text: &str) {
        self.notify(
            "textDocument/didOpen",
            json!({"textDocument": {"uri": URI, "languageId": "powershell", "version": 1, "text": text}}),
        )
        .await;
    }
}

struct Harness {
    client: Client,
    server: JoinHandle<Result<bool, BridgeError>>,
}

fn start(engine: ScriptedEngine) -> Harness {
    let config = BridgeConfig::default()
        .with_diagnostics_delay(Duration::from_millis(20))
        .with_output_flush_interval(Duration::from_millis(5));
    let session = SessionCoordinator::start(
        Arc::new(engine),
        config.output_flush_interval,
        Arc::new(LogFaultSink),
    )
    .expect("session");
    let workspace: Arc<dyn Workspace> = Arc::new(InMemoryWorkspace::default());
    let analyzer: Arc<dyn Analyzer> = Arc::new(StaticAnalyzer::new("gci", "AvoidAlias"));
    let symbols: Arc<dyn SymbolProvider> = Arc::new(DeclarationSymbols);
    let server = LanguageServer::new(
        LanguageServices {
            session,
            workspace,
            analyzer,
            symbols,
            config,
        },
        Arc::new(LogFaultSink),
    );

    let (client, remote) = tokio::io::duplex(256 * 1024);
    let (server_read, server_write) = tokio::io::split(remote);
    let server = tokio::spawn(server.serve(TransportChannel::from_io(server_read, server_write)));
    let (client_read, client_write) = tokio::io::split(client);
    Harness {
        client: Client {
            reader: MessageReader::new(client_read, Arc::new(JsonRpcDialect)),
            writer: client_write,
            backlog: VecDeque::new(),
            next_id: 0,
        },
        server,
    }
}

async fn finish(server: JoinHandle<Result<bool, BridgeError>>) -> bool {
    tokio::time::timeout(WAIT, server)
        .await
        .expect("server stops")
        .expect("server task")
        .expect("serve")
}

#[tokio::test]
async fn lifecycle_gates_requests_and_exits_cleanly() {
    let Harness { mut client, server } = start(ScriptedEngine::new());

    let early = client.request("textDocument/hover", json!({})).await;
    assert_eq!(
        early.outcome.expect_err("not initialized").code,
        SERVER_NOT_INITIALIZED
    );

    client.initialize().await;
    let shutdown = client.request("shutdown", Value::Null).await;
    assert_eq!(shutdown.outcome.expect("shutdown"), Value::Null);

    let late = client
        .request(
            "textDocument/documentSymbol",
            json!({"textDocument": {"uri": URI}}),
        )
        .await;
    assert_eq!(late.outcome.expect_err("shutting down").code, INVALID_REQUEST);

    client.notify("exit", Value::Null).await;
    assert!(finish(server).await, "shutdown then exit is a clean exit");
}

#[tokio::test]
async fn exit_without_shutdown_is_not_clean() {
    let Harness { mut client, server } = start(ScriptedEngine::new());
    client.initialize().await;
    client.notify("exit", Value::Null).await;
    assert!(!finish(server).await);
}

#[tokio::test]
async fn initialize_reports_server_info() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    let response = client
        .request("initialize", json!({"processId": null, "capabilities": {}}))
        .await;
    let result = response.outcome.expect("initialize");
    assert_eq!(result["serverInfo"]["name"], "psbridge-lsp");
    assert!(result["capabilities"]["completionProvider"].is_object());

    let again = client
        .request("initialize", json!({"processId": null, "capabilities": {}}))
        .await;
    assert_eq!(again.outcome.expect_err("twice").code, INVALID_REQUEST);
}

#[tokio::test]
async fn opening_a_document_publishes_diagnostics() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client.open("gci | Out-Null\n").await;

    let published = client.wait_event("textDocument/publishDiagnostics").await;
    assert_eq!(published.params["uri"], URI);
    let diagnostics = published.params["diagnostics"]
        .as_array()
        .expect("diagnostics array");
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0]["code"], "AvoidAlias");
    assert_eq!(diagnostics[0]["range"]["start"], json!({"line": 0, "character": 0}));
    assert_eq!(diagnostics[0]["range"]["end"], json!({"line": 0, "character": 3}));
}

#[tokio::test]
async fn malformed_notification_does_not_break_the_connection() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client.open("function Get-Thing { 1 }\n").await;

    client
        .notify("textDocument/didChange", json!({"textDocument": 5}))
        .await;

    let symbols = client
        .request(
            "textDocument/documentSymbol",
            json!({"textDocument": {"uri": URI}}),
        )
        .await;
    let symbols = symbols.outcome.expect("symbols");
    let names: Vec<&str> = symbols
        .as_array()
        .expect("flat symbols")
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    assert_eq!(names, ["Get-Thing"]);
}

#[tokio::test]
async fn incremental_changes_apply_in_order() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client.open("function One { }\n").await;
    client
        .notify(
            "textDocument/didChange",
            json!({
                "textDocument": {"uri": URI, "version": 2},
                "contentChanges": [{
                    "range": {"start": {"line": 0, "character": 9}, "end": {"line": 0, "character": 12}},
                    "text": "Two"
                }]
            }),
        )
        .await;

    let symbols = client
        .request(
            "textDocument/documentSymbol",
            json!({"textDocument": {"uri": URI}}),
        )
        .await
        .outcome
        .expect("symbols");
    assert_eq!(symbols[0]["name"], "Two");
}

#[tokio::test]
async fn completion_runs_tab_expansion_in_the_engine() {
    let text = "Get-Ch";
    let file = ScriptFile {
        uri: URI.to_owned(),
        path: None,
        version: 1,
        contents: text.to_owned(),
    };
    let command = completion_command(&file, Position::new(0, 6)).expect("cursor in range");
    let engine = ScriptedEngine::new().with_script(
        &command,
        vec![Step::Return(vec![
            r#"{"CompletionText":"Get-ChildItem","ListItemText":"Get-ChildItem","ResultType":"Command","ToolTip":"Get-ChildItem [-Path]"}"#
                .to_owned(),
        ])],
    );
    let Harness { mut client, .. } = start(engine);
    client.initialize().await;
    client.open(text).await;

    let items = client
        .request(
            "textDocument/completion",
            json!({"textDocument": {"uri": URI}, "position": {"line": 0, "character": 6}}),
        )
        .await
        .outcome
        .expect("completion");
    let items = items.as_array().expect("item array");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["label"], "Get-ChildItem");
    assert_eq!(items[0]["insertText"], "Get-ChildItem");
}

#[tokio::test]
async fn hover_shows_the_help_synopsis() {
    let engine = ScriptedEngine::new().with_script(
        &help_command("Get-Date"),
        vec![Step::Return(vec!["Gets the current date and time.".to_owned()])],
    );
    let Harness { mut client, .. } = start(engine);
    client.initialize().await;
    client.open("Get-Date\n").await;

    let hover = client
        .request(
            "textDocument/hover",
            json!({"textDocument": {"uri": URI}, "position": {"line": 0, "character": 2}}),
        )
        .await
        .outcome
        .expect("hover");
    let value = hover["contents"]["value"].as_str().expect("markdown");
    assert!(value.contains("Get-Date"));
    assert!(value.ends_with("Gets the current date and time."));
}

#[tokio::test]
async fn failed_engine_query_degrades_to_null() {
    let engine = ScriptedEngine::new().with_script(
        &help_command("Get-Nothing"),
        vec![Step::Fail(EngineError::fault("not found"))],
    );
    let Harness { mut client, .. } = start(engine);
    client.initialize().await;
    client.open("Get-Nothing\n").await;

    let hover = client
        .request(
            "textDocument/hover",
            json!({"textDocument": {"uri": URI}, "position": {"line": 0, "character": 1}}),
        )
        .await;
    assert_eq!(hover.outcome.expect("null result"), Value::Null);
}

#[tokio::test]
async fn evaluate_answers_before_output_arrives() {
    let engine = ScriptedEngine::new().with_script(
        "Write-Host hi",
        vec![
            Step::Delay(Duration::from_millis(50)),
            Step::Output(OutputCategory::Stdout, "hi\n".to_owned()),
        ],
    );
    let Harness { mut client, .. } = start(engine);
    client.initialize().await;

    let result = client
        .request("powerShell/evaluate", json!({"expression": "Write-Host hi"}))
        .await
        .outcome
        .expect("evaluate");
    assert_eq!(result, json!({"result": "", "variablesReference": 0}));

    let output = client.wait_event("powerShell/output").await;
    assert_eq!(output.params["category"], "stdout");
    assert_eq!(output.params["output"], "hi\n");
}

#[tokio::test]
async fn code_action_offers_the_suggested_fix() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client.open("gci\n").await;
    client.wait_event("textDocument/publishDiagnostics").await;

    let actions = client
        .request(
            "textDocument/codeAction",
            json!({
                "textDocument": {"uri": URI},
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 0}},
                "context": {"diagnostics": []}
            }),
        )
        .await
        .outcome
        .expect("code actions");
    let actions = actions.as_array().expect("action list");
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["title"], "Fix AvoidAlias");
    assert_eq!(actions[0]["kind"], "quickfix");
}

#[tokio::test]
async fn formatting_replaces_the_whole_document() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client.open("Get-Item   \n").await;

    let edits = client
        .request(
            "textDocument/formatting",
            json!({
                "textDocument": {"uri": URI},
                "options": {"tabSize": 4, "insertSpaces": true}
            }),
        )
        .await
        .outcome
        .expect("formatting");
    assert_eq!(
        edits,
        json!([{
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 1, "character": 0}},
            "newText": "Get-Item\n"
        }])
    );
}

#[tokio::test]
async fn evaluate_reports_execution_status_changes() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client
        .request("powerShell/evaluate", json!({"expression": "Get-Date"}))
        .await;

    let running = client.wait_event("powerShell/executionStatusChanged").await;
    assert_eq!(running.params["status"], "running");
    let completed = client.wait_event("powerShell/executionStatusChanged").await;
    assert_eq!(completed.params["status"], "completed");
}

#[tokio::test]
async fn runspace_changes_are_forwarded() {
    let engine = ScriptedEngine::new();
    let Harness { mut client, .. } = start(engine.clone());
    client.initialize().await;

    engine.emit(EngineEvent::RunspaceChanged(RunspaceInfo {
        name: "Remote-Box".to_owned(),
        kind: RunspaceKind::Remote,
        computer_name: Some("box01".to_owned()),
        process_id: None,
    }));

    let changed = client.wait_event("powerShell/runspaceChanged").await;
    assert_eq!(changed.params["runspace"]["name"], "Remote-Box");
    assert_eq!(changed.params["runspace"]["kind"], "remote");
    assert_eq!(changed.params["runspace"]["computerName"], "box01");
}

#[tokio::test]
async fn extension_command_replies_before_its_completion_notification() {
    let context = json!({"file": "a.ps1"});
    let engine = ScriptedEngine::new().with_script(
        &extension_command_text("Invoke-Thing", &context),
        vec![Step::Delay(Duration::from_millis(50))],
    );
    let Harness { mut client, .. } = start(engine);
    client.initialize().await;

    let response = client
        .request(
            "powerShell/invokeExtensionCommand",
            json!({"name": "Invoke-Thing", "context": context}),
        )
        .await;
    assert_eq!(response.outcome.expect("accepted"), Value::Null);
    assert!(!client.has_event("powerShell/extensionCommandCompleted"));

    let completed = client
        .wait_event("powerShell/extensionCommandCompleted")
        .await;
    assert_eq!(completed.params["name"], "Invoke-Thing");
    assert_eq!(completed.params["success"], true);
}

#[tokio::test]
async fn failed_extension_command_offers_one_retry() {
    let context = json!({});
    let command = extension_command_text("Invoke-Broken", &context);
    let engine = ScriptedEngine::new().with_script(
        &command,
        vec![Step::Fail(EngineError::fault("broken"))],
    );
    let Harness { mut client, .. } = start(engine.clone());
    client.initialize().await;

    client
        .request(
            "powerShell/invokeExtensionCommand",
            json!({"name": "Invoke-Broken", "context": context}),
        )
        .await;
    let first = client
        .wait_event("powerShell/extensionCommandCompleted")
        .await;
    assert_eq!(first.params["success"], false);
    assert_eq!(first.params["message"], "broken");

    let prompt = client.server_request("window/showMessageRequest").await;
    assert!(prompt.params["message"]
        .as_str()
        .expect("prompt text")
        .contains("Invoke-Broken"));
    assert_eq!(prompt.params["actions"][0]["title"], RETRY_ACTION);
    client
        .reply(&prompt.id, json!({"title": RETRY_ACTION}))
        .await;

    let second = client
        .wait_event("powerShell/extensionCommandCompleted")
        .await;
    assert_eq!(second.params["success"], false);
    assert_eq!(engine.executed(), [command.clone(), command]);
}

#[tokio::test]
async fn get_modules_lists_available_modules() {
    let engine = ScriptedEngine::new().with_script(
        MODULES_COMMAND,
        vec![Step::Return(vec![
            r#"[{"Name":"Pester","Version":"5.5.0","Path":"/modules/Pester.psd1"}]"#.to_owned(),
        ])],
    );
    let Harness { mut client, .. } = start(engine);
    client.initialize().await;

    let modules = client
        .request("powerShell/getModules", Value::Null)
        .await
        .outcome
        .expect("modules");
    assert_eq!(
        modules,
        json!([{"name": "Pester", "version": "5.5.0", "path": "/modules/Pester.psd1"}])
    );
}

#[tokio::test]
async fn definition_and_references_resolve_within_the_document() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client
        .open("function Get-Thing { 1 }\nGet-Thing\n$x = get-thing\n")
        .await;

    let definition = client
        .request(
            "textDocument/definition",
            json!({"textDocument": {"uri": URI}, "position": {"line": 1, "character": 3}}),
        )
        .await
        .outcome
        .expect("definition");
    assert_eq!(definition["uri"], URI);
    assert_eq!(
        definition["range"]["start"],
        json!({"line": 0, "character": 9})
    );

    let references = client
        .request(
            "textDocument/references",
            json!({
                "textDocument": {"uri": URI},
                "position": {"line": 1, "character": 3},
                "context": {"includeDeclaration": false}
            }),
        )
        .await
        .outcome
        .expect("references");
    let lines: Vec<u64> = references
        .as_array()
        .expect("locations")
        .iter()
        .filter_map(|l| l["range"]["start"]["line"].as_u64())
        .collect();
    assert_eq!(lines, [1, 2]);
}

#[tokio::test]
async fn closing_a_document_clears_its_diagnostics() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client.open("gci\n").await;
    let opened = client.wait_event("textDocument/publishDiagnostics").await;
    assert_eq!(opened.params["diagnostics"].as_array().map(Vec::len), Some(1));

    client
        .notify("textDocument/didClose", json!({"textDocument": {"uri": URI}}))
        .await;
    let closed = client.wait_event("textDocument/publishDiagnostics").await;
    assert_eq!(closed.params["uri"], URI);
    assert_eq!(closed.params["diagnostics"], json!([]));
}

#[tokio::test]
async fn workspace_symbols_match_open_documents() {
    let Harness { mut client, .. } = start(ScriptedEngine::new());
    client.initialize().await;
    client
        .open("function Get-Thing { }\nfunction Set-Other { }\n")
        .await;

    let symbols = client
        .request("workspace/symbol", json!({"query": "thing"}))
        .await
        .outcome
        .expect("workspace symbols");
    let names: Vec<&str> = symbols
        .as_array()
        .expect("symbol list")
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    assert_eq!(names, ["Get-Thing"]);
}

#[tokio::test]
async fn get_version_reports_engine_and_server_versions() {
    let engine = ScriptedEngine::new().with_script(
        VERSION_COMMAND,
        vec![Step::Return(vec!["7.4.1".to_owned(), "Core".to_owned()])],
    );
    let Harness { mut client, .. } = start(engine);
    client.initialize().await;

    let version = client
        .request("powerShell/getVersion", Value::Null)
        .await
        .outcome
        .expect("version");
    assert_eq!(version["version"], "7.4.1");
    assert_eq!(version["edition"], "Core");
    assert_eq!(version["serverVersion"], env!("CARGO_PKG_VERSION"));
}
