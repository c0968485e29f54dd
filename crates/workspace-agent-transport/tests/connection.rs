#![cfg(unix)]

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        protocol::frame::coding::CloseCode,
    },
};
use tokio_util::sync::CancellationToken;
use workspace_agent_core::{AgentIdentity, AgentSettings, EventBus};
use workspace_agent_executor::CommandDispatcher;
use workspace_agent_pty::{HelperLaunch, ShellKind, TerminalController};
use workspace_agent_transport::{ConnectionManager, ConnectionState};

const WAIT: Duration = Duration::from_secs(10);

type ServerSocket = WebSocketStream<TcpStream>;

struct Harness {
    dir: TempDir,
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
    shutdown: CancellationToken,
    agent: JoinHandle<()>,
}

fn fast_settings() -> AgentSettings {
    AgentSettings {
        reconnect_min_delay_ms: 50,
        reconnect_max_delay_ms: 200,
        ..AgentSettings::default()
    }
}

async fn start_agent(settings: AgentSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let identity = AgentIdentity {
        name: "test-agent".into(),
        url,
        token: "secret".into(),
        agent_id: "agent-1".into(),
        workspace_id: "ws-1".into(),
        capabilities: vec!["commands".into(), "terminal".into()],
        working_dir: dir.path().to_path_buf(),
        default_shell: Some("sh".into()),
    };
    let bus = EventBus::new();
    let dispatcher = Arc::new(CommandDispatcher::new(dir.path(), ShellKind::Sh));
    let terminal = Arc::new(TerminalController::new(
        HelperLaunch::new("/nonexistent/helper"),
        1024,
        bus.clone(),
    ));
    let manager = Arc::new(ConnectionManager::new(identity, settings, bus, dispatcher, terminal));

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let runner = Arc::clone(&manager);
    let agent = tokio::spawn(async move { runner.run(token).await });
    Harness {
        dir,
        listener,
        manager,
        shutdown,
        agent,
    }
}

/// Accept the agent's connection, returning the socket and its
/// `Authorization` header.
async fn accept(listener: &TcpListener) -> (ServerSocket, Option<String>) {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let auth = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&auth);
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *captured.lock().unwrap() = req
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    };
    let ws = accept_hdr_async(stream, callback).await.unwrap();
    let auth = auth.lock().unwrap().clone();
    (ws, auth)
}

async fn send(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next JSON message whose `type` is `kind`, skipping everything else.
async fn next_of_type(ws: &mut ServerSocket, kind: &str) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }
}

async fn stop(harness: Harness) {
    harness.shutdown.cancel();
    timeout(WAIT, harness.agent).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handshake_carries_identity_and_token() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, auth) = accept(&harness.listener).await;
    assert_eq!(auth.as_deref(), Some("Bearer secret"));

    let hello = next_of_type(&mut ws, "agent.connected").await;
    assert_eq!(hello["agentId"], "agent-1");
    assert_eq!(hello["workspaceId"], "ws-1");
    assert_eq!(hello["defaultShell"], "sh");
    assert_eq!(hello["capabilities"], json!(["commands", "terminal"]));
    assert!(hello["availableShells"].as_array().unwrap().contains(&json!("sh")));
    assert!(!hello["version"].as_str().unwrap().is_empty());
    assert_eq!(harness.manager.state(), ConnectionState::Connected);

    let manager = Arc::clone(&harness.manager);
    stop(harness).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_command_output_and_completion() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    send(
        &mut ws,
        json!({"type": "command.execute", "commandId": "c1", "command": "echo hi; exit 4"}),
    )
    .await;
    let output = next_of_type(&mut ws, "command.output").await;
    assert_eq!(
        output,
        json!({"type": "command.output", "commandId": "c1", "stream": "stdout", "data": "hi"})
    );
    let done = next_of_type(&mut ws, "command.completed").await;
    assert_eq!(done["exitCode"], 4);

    stop(harness).await;
}

#[tokio::test]
async fn test_second_command_gets_busy_reply() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    send(
        &mut ws,
        json!({"type": "command.execute", "commandId": "slow", "command": "sleep 1"}),
    )
    .await;
    send(
        &mut ws,
        json!({"type": "command.execute", "commandId": "fast", "command": "true"}),
    )
    .await;

    let busy = next_of_type(&mut ws, "command.busy").await;
    assert_eq!(busy["commandId"], "fast");
    let done = next_of_type(&mut ws, "command.completed").await;
    assert_eq!(done["commandId"], "slow");

    stop(harness).await;
}

#[tokio::test]
async fn test_bad_frames_do_not_drop_connection() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    ws.send(Message::text("not json")).await.unwrap();
    send(&mut ws, json!({"type": "sdk.spawn", "prompt": "hi"})).await;
    send(&mut ws, json!({"type": "command.execute"})).await;
    send(&mut ws, json!({"type": "pty.history.request", "requestId": "r1"})).await;

    let history = next_of_type(&mut ws, "pty.history").await;
    assert_eq!(
        history,
        json!({"type": "pty.history", "data": "", "bufferSize": 0, "requestId": "r1"})
    );

    stop(harness).await;
}

#[tokio::test]
async fn test_terminal_start_failure_is_reported() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    send(&mut ws, json!({"type": "pty.start", "cols": 100, "rows": 30})).await;
    let error = next_of_type(&mut ws, "pty.error").await;
    assert!(error["message"].as_str().unwrap().contains("helper"));

    stop(harness).await;
}

#[tokio::test]
async fn test_file_write_lands_on_disk() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    send(&mut ws, json!({"type": "file.write.start", "id": "f1", "path": "out/notes.txt"})).await;
    send(&mut ws, json!({"type": "file.write.chunk", "id": "f1", "data": "aGVsbG8g"})).await;
    send(&mut ws, json!({"type": "file.write.chunk", "id": "f1", "data": "d29ybGQ="})).await;
    send(&mut ws, json!({"type": "file.write.end", "id": "f1"})).await;

    let target = harness.dir.path().join("out/notes.txt");
    wait_for_file(&target).await;
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello world");

    stop(harness).await;
}

async fn wait_for_file(path: &Path) {
    timeout(WAIT, async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("file was never written");
}

#[tokio::test]
async fn test_shutdown_sends_normal_close() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    harness.shutdown.cancel();
    let close = loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(_)) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
    };
    assert_eq!(close.unwrap().code, CloseCode::Normal);
    timeout(WAIT, harness.agent).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_returns_when_server_stops_reading() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    // Enough output to fill both socket buffers while nobody reads.
    send(
        &mut ws,
        json!({
            "type": "command.execute",
            "commandId": "flood",
            "command": "yes 'flooding output line for a stalled server' | head -n 3000000",
        }),
    )
    .await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    harness.shutdown.cancel();
    let returned = timeout(WAIT, harness.agent).await;
    assert!(returned.is_ok(), "agent did not return after shutdown");
    drop(ws);
}

#[tokio::test]
async fn test_reconnects_after_server_drops() {
    let harness = start_agent(fast_settings()).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;
    drop(ws);

    let (mut ws, auth) = accept(&harness.listener).await;
    assert_eq!(auth.as_deref(), Some("Bearer secret"));
    next_of_type(&mut ws, "agent.connected").await;

    stop(harness).await;
}

#[tokio::test]
async fn test_unanswered_heartbeats_force_reconnect() {
    let settings = AgentSettings {
        heartbeat_interval_secs: 1,
        heartbeat_max_missed: 2,
        ..fast_settings()
    };
    let harness = start_agent(settings).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    let mut probes = 0;
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(value["type"], "agent.heartbeat");
                assert!(value["timestamp"].as_u64().unwrap() > 0);
                probes += 1;
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => break,
        }
    }
    assert_eq!(probes, 2);

    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;
    stop(harness).await;
}

#[tokio::test]
async fn test_acked_heartbeats_keep_connection() {
    let settings = AgentSettings {
        heartbeat_interval_secs: 1,
        heartbeat_max_missed: 1,
        ..fast_settings()
    };
    let harness = start_agent(settings).await;
    let (mut ws, _) = accept(&harness.listener).await;
    next_of_type(&mut ws, "agent.connected").await;

    for _ in 0..3 {
        next_of_type(&mut ws, "agent.heartbeat").await;
        send(&mut ws, json!({"type": "agent.heartbeat.ack"})).await;
    }
    send(&mut ws, json!({"type": "pty.history.request"})).await;
    let history = next_of_type(&mut ws, "pty.history").await;
    assert!(history.get("requestId").is_none());

    stop(harness).await;
}
