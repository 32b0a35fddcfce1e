//! End-to-end flows against a real bound server: spawn/echo/close, shared
//! join with history replay, orphan reclaim and timeout, permission
//! denial, and resize propagation.

#![cfg(unix)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shmux_server::config::ServerConfig;
use shmux_server::server::TerminalServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ServerConfig {
    ServerConfig {
        default_shell: "/bin/sh".into(),
        default_cwd: Some("/".into()),
        orphan_timeout: 500,
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> TerminalServer {
    TerminalServer::bind_addr(config, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

async fn connect(server: &TerminalServer) -> Client {
    let url = format!("ws://{}{}", server.local_addr(), server.config().ws_path);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, msg: Value) {
    ws.send(Message::Text(msg.to_string().into())).await.unwrap();
}

/// Next JSON frame from the server.
async fn recv(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("server sent invalid JSON");
        }
    }
}

/// Skip frames until one of the given type arrives.
async fn recv_type(ws: &mut Client, ty: &str) -> Value {
    loop {
        let msg = recv(ws).await;
        if msg["type"] == ty {
            return msg;
        }
    }
}

/// Collect `data` frames for `session_id` until their concatenation
/// contains `needle`.
async fn recv_data_until(ws: &mut Client, session_id: &str, needle: &str) -> String {
    let mut collected = String::new();
    while !collected.contains(needle) {
        let msg = recv_type(ws, "data").await;
        assert_eq!(msg["session_id"], session_id);
        collected.push_str(msg["data"].as_str().unwrap());
    }
    collected
}

async fn spawn_shell(ws: &mut Client, options: Value) -> String {
    send(ws, json!({ "type": "spawn", "options": options })).await;
    let spawned = recv_type(ws, "spawned").await;
    spawned["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn server_info_greets_every_connection() {
    let server = start(test_config()).await;
    let mut ws = connect(&server).await;

    let info = recv_type(&mut ws, "server_info").await;
    assert_eq!(info["info"]["docker_enabled"], false);
    assert_eq!(info["info"]["default_shell"], "/bin/sh");
    assert_eq!(info["info"]["auth_enabled"], false);

    server.shutdown().await;
}

#[tokio::test]
async fn rejects_upgrade_on_wrong_path() {
    let server = start(test_config()).await;
    let url = format!("ws://{}/nope", server.local_addr());
    assert!(connect_async(url).await.is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn solo_spawn_echo_and_owner_close() {
    let server = start(test_config()).await;
    let mut ws = connect(&server).await;
    recv_type(&mut ws, "server_info").await;

    send(
        &mut ws,
        json!({ "type": "spawn", "options": { "shell": "/bin/sh" } }),
    )
    .await;
    let spawned = recv_type(&mut ws, "spawned").await;
    assert_eq!(spawned["shell"], "/bin/sh");
    assert_eq!(spawned["cwd"], "/");
    assert_eq!(spawned["cols"], 80);
    assert_eq!(spawned["rows"], 24);
    let sid = spawned["session_id"].as_str().unwrap().to_string();
    assert!(sid.starts_with("term-"));

    send(&mut ws, json!({ "type": "data", "session_id": sid, "data": "echo hi\n" })).await;
    recv_data_until(&mut ws, &sid, "hi").await;

    send(&mut ws, json!({ "type": "close", "session_id": sid })).await;
    let closed = recv_type(&mut ws, "session_closed").await;
    assert_eq!(closed["session_id"], sid.as_str());
    assert_eq!(closed["reason"], "owner_closed");

    server.shutdown().await;
}

#[tokio::test]
async fn join_replays_history_and_notifies_roster() {
    let server = start(test_config()).await;

    let mut c1 = connect(&server).await;
    recv_type(&mut c1, "server_info").await;
    let sid = spawn_shell(&mut c1, json!({ "shell": "/bin/sh", "enable_history": true })).await;

    send(&mut c1, json!({ "type": "data", "session_id": sid, "data": "printf ABC\n" })).await;
    recv_data_until(&mut c1, &sid, "ABC").await;

    let mut c2 = connect(&server).await;
    recv_type(&mut c2, "server_info").await;
    send(
        &mut c2,
        json!({
            "type": "join",
            "options": { "session_id": sid, "request_history": true, "history_limit": 1024 }
        }),
    )
    .await;

    let joined = recv_type(&mut c2, "joined").await;
    assert_eq!(joined["session_id"], sid.as_str());
    assert_eq!(joined["session"]["client_count"], 2);
    assert!(joined["history"].as_str().unwrap().contains("ABC"));

    let notified = recv_type(&mut c1, "client_joined").await;
    assert_eq!(notified["session_id"], sid.as_str());
    assert_eq!(notified["client_count"], 2);

    // Both clients observe the same subsequent stream.
    send(&mut c2, json!({ "type": "data", "session_id": sid, "data": "printf XYZ\n" })).await;
    recv_data_until(&mut c1, &sid, "XYZ").await;
    recv_data_until(&mut c2, &sid, "XYZ").await;

    // Leaving notifies the remaining roster.
    send(&mut c2, json!({ "type": "leave", "session_id": sid })).await;
    let left = recv_type(&mut c2, "left").await;
    assert_eq!(left["session_id"], sid.as_str());
    let notified = recv_type(&mut c1, "client_left").await;
    assert_eq!(notified["client_count"], 1);

    server.shutdown().await;
}

#[tokio::test]
async fn orphaned_session_can_be_reclaimed() {
    let server = start(test_config()).await;

    let mut c1 = connect(&server).await;
    recv_type(&mut c1, "server_info").await;
    let sid = spawn_shell(&mut c1, json!({ "allow_join": true })).await;

    drop(c1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut c2 = connect(&server).await;
    recv_type(&mut c2, "server_info").await;
    send(&mut c2, json!({ "type": "join", "options": { "session_id": sid } })).await;
    let joined = recv_type(&mut c2, "joined").await;
    assert_eq!(joined["session"]["client_count"], 1);

    // Past the original orphan deadline the session must still be listed.
    tokio::time::sleep(Duration::from_millis(700)).await;
    send(&mut c2, json!({ "type": "list_sessions" })).await;
    let list = recv_type(&mut c2, "session_list").await;
    let ids: Vec<&str> = list["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["session_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&sid.as_str()));

    server.shutdown().await;
}

#[tokio::test]
async fn unclaimed_orphan_times_out() {
    let server = start(test_config()).await;

    let mut c1 = connect(&server).await;
    recv_type(&mut c1, "server_info").await;
    let sid = spawn_shell(&mut c1, json!({})).await;
    drop(c1);

    tokio::time::sleep(Duration::from_millis(900)).await;

    let mut c2 = connect(&server).await;
    recv_type(&mut c2, "server_info").await;
    send(&mut c2, json!({ "type": "list_sessions" })).await;
    let list = recv_type(&mut c2, "session_list").await;
    assert!(list["sessions"].as_array().unwrap().is_empty());

    send(&mut c2, json!({ "type": "join", "options": { "session_id": sid } })).await;
    let error = recv_type(&mut c2, "error").await;
    assert!(error["error"].as_str().unwrap().contains("not found"));

    server.shutdown().await;
}

#[tokio::test]
async fn permission_denied_then_granted_after_auth() {
    let secret = shmux_core::generate_secret().unwrap();
    let token = shmux_core::sign_claims(
        &secret,
        &shmux_core::TokenClaims {
            user_id: "op".into(),
            username: None,
            permissions: vec![
                "spawn_session".into(),
                "write_session".into(),
                "close_session".into(),
            ],
            exp: None,
        },
    )
    .unwrap();

    let config = ServerConfig {
        auth_provider: Some(Arc::new(shmux_server::auth::TokenProvider::new(
            secret,
            vec![],
        ))),
        ..test_config()
    };
    let server = start(config).await;

    let mut ws = connect(&server).await;
    recv_type(&mut ws, "server_info").await;

    // Unauthenticated spawn is denied and creates nothing.
    send(&mut ws, json!({ "type": "spawn", "options": { "shell": "/bin/sh" } })).await;
    let denied = recv_type(&mut ws, "permission_denied").await;
    assert_eq!(denied["operation"], "spawn_session");
    assert_eq!(server.manager().count().await, 0);

    // After auth the same operation succeeds.
    send(&mut ws, json!({ "type": "auth", "token": token })).await;
    let response = recv_type(&mut ws, "auth_response").await;
    assert_eq!(response["success"], true);
    let perms: Vec<&str> = response["user"]["permissions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p.as_str().unwrap())
        .collect();
    assert!(perms.contains(&"spawn_session"));
    let refreshed = recv_type(&mut ws, "server_info").await;
    assert_eq!(refreshed["info"]["user"]["user_id"], "op");

    let sid = spawn_shell(&mut ws, json!({})).await;
    send(&mut ws, json!({ "type": "close", "session_id": sid })).await;
    recv_type(&mut ws, "session_closed").await;

    server.shutdown().await;
}

#[tokio::test]
async fn resize_is_server_internal_and_last_writer_wins() {
    let server = start(test_config()).await;

    let mut c1 = connect(&server).await;
    recv_type(&mut c1, "server_info").await;
    let sid = spawn_shell(&mut c1, json!({ "cols": 80, "rows": 24 })).await;

    let mut c2 = connect(&server).await;
    recv_type(&mut c2, "server_info").await;
    send(&mut c2, json!({ "type": "join", "options": { "session_id": sid } })).await;
    recv_type(&mut c2, "joined").await;

    send(
        &mut c2,
        json!({ "type": "resize", "session_id": sid, "cols": 132, "rows": 40 }),
    )
    .await;

    // The stored geometry reflects the last resize; no resize frame is
    // ever pushed to clients (the protocol has no such server frame).
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(&mut c2, json!({ "type": "list_sessions" })).await;
    let list = recv_type(&mut c2, "session_list").await;
    let session = &list["sessions"][0];
    assert_eq!(session["cols"], 132);
    assert_eq!(session["rows"], 40);

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_get_errors() {
    let server = start(test_config()).await;
    let mut ws = connect(&server).await;
    recv_type(&mut ws, "server_info").await;

    ws.send(Message::Text("{not json".to_string().into())).await.unwrap();
    let error = recv_type(&mut ws, "error").await;
    assert!(error["error"].as_str().unwrap().contains("invalid message"));

    send(&mut ws, json!({ "type": "launch_missiles" })).await;
    let error = recv_type(&mut ws, "error").await;
    assert!(error["error"].as_str().unwrap().contains("invalid message"));

    server.shutdown().await;
}

#[tokio::test]
async fn writes_from_non_members_never_reach_the_pty() {
    let server = start(test_config()).await;

    let mut c1 = connect(&server).await;
    recv_type(&mut c1, "server_info").await;
    let sid = spawn_shell(&mut c1, json!({})).await;

    let mut c2 = connect(&server).await;
    recv_type(&mut c2, "server_info").await;
    send(
        &mut c2,
        json!({ "type": "data", "session_id": sid, "data": "echo INTRUDER\n" }),
    )
    .await;
    let error = recv_type(&mut c2, "error").await;
    assert!(error["error"].as_str().unwrap().contains("not joined"));

    // The owner sees its own output but never the intruder's.
    send(&mut c1, json!({ "type": "data", "session_id": sid, "data": "echo SAFE\n" })).await;
    let stream = recv_data_until(&mut c1, &sid, "SAFE").await;
    assert!(!stream.contains("INTRUDER"));

    server.shutdown().await;
}
