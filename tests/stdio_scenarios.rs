//! Stdio scenarios against a real child process.
//!
//! A `sh` script stands in for an MCP server: it reads newline-delimited
//! requests and prints canned responses with the ids the multiplexer is
//! known to assign (1 for the handshake, 2 for the first call).

#![cfg(unix)]

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp_integration::{
    CoreConfig, ExecuteOptions, ExecuteRequest, ExecutionStatus, IntegrationCore, ServerPatch,
    ServerSpec, ServerStatus, TransportConfig,
};

fn core() -> Arc<IntegrationCore> {
    IntegrationCore::builder()
        .config(CoreConfig {
            max_retries: 0,
            connection_timeout_ms: 5_000,
            ..CoreConfig::default()
        })
        .build()
        .unwrap()
}

async fn add_sh_server(core: &Arc<IntegrationCore>, name: &str, script: &str) -> String {
    let server = core
        .create_server(ServerSpec {
            name: name.to_string(),
            description: None,
            transport: TransportConfig::Stdio(mcp_integration::model::StdioConfig {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: HashMap::new(),
                working_dir: None,
            }),
            metadata: HashMap::new(),
        })
        .await
        .unwrap();
    core.update_server(
        &server.id,
        ServerPatch {
            status: Some(ServerStatus::Active),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    server.id
}

#[tokio::test]
async fn test_stdio_echo_happy_path() {
    let script = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-echo","version":"1.0"}}}'
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"hi"}]}}'
cat >/dev/null
"#;

    let core = core();
    let id = add_sh_server(&core, "sh-echo", script).await;

    let execution = core
        .execute(ExecuteRequest {
            server_id: id.clone(),
            method: "tools/call".to_string(),
            params: Some(json!({ "name": "echo", "arguments": { "msg": "hi" } })),
            options: ExecuteOptions {
                run_async: false,
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result.unwrap()["content"][0]["text"], "hi");

    // The handshake landed on the server row.
    let server = core.get_server(&id).await.unwrap();
    let info = server.server_info.unwrap();
    assert_eq!(info.vendor_name, "sh-echo");
    assert!(info.capabilities.tools);

    core.shutdown().await;
}

#[tokio::test]
async fn test_stdio_timeout_keeps_child_alive() {
    // Answers the handshake, then goes silent forever.
    let script = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-silent","version":"1.0"}}}'
cat >/dev/null
"#;

    let core = core();
    let id = add_sh_server(&core, "sh-silent", script).await;

    let started = Instant::now();
    let execution = core
        .execute(ExecuteRequest {
            server_id: id.clone(),
            method: "tools/call".to_string(),
            params: Some(json!({ "name": "echo", "arguments": { "msg": "hi" } })),
            options: ExecuteOptions {
                timeout_ms: Some(200),
                run_async: false,
                executed_by: None,
            },
        })
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_ref().unwrap().code, -32000);
    assert!(started.elapsed() < Duration::from_millis(500));

    // Timeout does not tear the connection down.
    assert_eq!(core.pool().live_connections(), 1);

    core.shutdown().await;
}

#[tokio::test]
async fn test_stdio_child_exit_fails_outstanding() {
    // Answers the handshake, then exits as soon as the next request lands.
    let script = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-flaky","version":"1.0"}}}'
read line
exit 0
"#;

    let core = core();
    let id = add_sh_server(&core, "sh-flaky", script).await;

    let execution = core
        .execute(ExecuteRequest {
            server_id: id.clone(),
            method: "tools/call".to_string(),
            params: Some(json!({ "name": "echo", "arguments": { "msg": "hi" } })),
            options: ExecuteOptions {
                timeout_ms: Some(5_000),
                run_async: false,
                executed_by: None,
            },
        })
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_ref().unwrap().code, -32603);

    core.shutdown().await;
}
