//! `HttpRpcClient` against an in-process JSON-RPC node.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use serde_json::{Value, json};

use manager::{Classify, ErrorKind, HttpRpcClient, NodeRpc, RpcError, retry_once};

#[derive(Default)]
struct Node {
    status_calls: AtomicUsize,
    /// Number of leading `/status` calls answered with 503.
    failures: usize,
}

async fn status(State(node): State<Arc<Node>>) -> Result<Json<Value>, StatusCode> {
    let call = node.status_calls.fetch_add(1, Ordering::SeqCst);
    if call < node.failures {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "jsonrpc": "2.0",
        "id": -1,
        "result": {
            "node_info": {"id": "node1", "network": "push_42101-1", "moniker": "alice", "listen_addr": "tcp://0.0.0.0:26656"},
            "sync_info": {"latest_block_height": "4200", "catching_up": false}
        }
    })))
}

async fn net_info() -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": -1,
        "result": {"n_peers": "1", "peers": [
            {"node_info": {"id": "peer1", "listen_addr": "tcp://0.0.0.0:26656"}, "remote_ip": "10.1.2.3"}
        ]}
    }))
}

/// Knows a single store key; anything else is an unknown query path.
async fn abci_query(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let path = params.get("path").map(String::as_str);
    let data = params.get("data").map(String::as_str);
    match (path, data) {
        (Some("\"/store/bank/key\""), Some("0x0a01ff")) => Json(json!({
            "jsonrpc": "2.0",
            "id": -1,
            "result": {"response": {
                "code": 0, "log": "", "info": "", "index": "0", "key": "CgH/",
                "value": "aGVsbG8=", "proofOps": null, "height": "4200", "codespace": ""
            }}
        })),
        (Some("\"/store/bank/key\""), _) => Json(json!({
            "jsonrpc": "2.0",
            "id": -1,
            "result": {"response": {"code": 0, "log": "", "value": null, "height": "4200"}}
        })),
        _ => Json(json!({
            "jsonrpc": "2.0",
            "id": -1,
            "error": {"code": -32603, "message": "Internal error", "data": "unknown query path"}
        })),
    }
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({}))
}

async fn serve(failures: usize) -> (String, Arc<Node>) {
    let node = Arc::new(Node {
        failures,
        ..Node::default()
    });
    let app = Router::new()
        .route("/status", get(status))
        .route("/net_info", get(net_info))
        .route("/abci_query", get(abci_query))
        .route("/slow/status", get(slow))
        .route("/slow/abci_query", get(slow))
        .with_state(node.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind rpc node");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), node)
}

fn client(base: &str) -> HttpRpcClient {
    HttpRpcClient::new(base, Duration::from_secs(2), Duration::from_millis(300)).expect("client")
}

#[tokio::test]
async fn status_and_peers_are_decoded() {
    let (base, _node) = serve(0).await;
    let rpc = client(&base);

    let status = rpc.status().await.expect("status");
    assert_eq!(status.height, 4200);
    assert_eq!(status.chain_id, "push_42101-1");
    assert!(!status.catching_up);

    let peers = rpc.peers().await.expect("peers");
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].to_persistent(), "peer1@10.1.2.3:26656");
}

#[tokio::test]
async fn remote_status_honours_its_deadline() {
    let (base, _node) = serve(0).await;
    let rpc = client(&base);

    let err = rpc
        .remote_status(&format!("{base}/slow"))
        .await
        .expect_err("deadline");
    assert!(matches!(err, RpcError::Deadline { .. }));
    assert_eq!(err.kind(), ErrorKind::Network);
}

#[tokio::test]
async fn abci_query_sends_quoted_path_and_hex_data() {
    let (base, _node) = serve(0).await;
    let rpc = client(&base);

    let resp = rpc
        .abci_query("/store/bank/key", &[0x0a, 0x01, 0xff])
        .await
        .expect("abci_query");
    assert!(resp.is_ok());
    assert_eq!(resp.value, b"hello");
    assert_eq!(resp.height, 4200);

    let missing = rpc
        .abci_query("/store/bank/key", &[0x00])
        .await
        .expect("abci_query without value");
    assert!(missing.value.is_empty());
}

#[tokio::test]
async fn abci_query_error_envelope_is_a_protocol_error() {
    let (base, _node) = serve(0).await;

    let err = client(&base)
        .abci_query("/no/such/path", b"")
        .await
        .expect_err("rpc error");
    match &err {
        RpcError::Protocol { message, .. } => assert!(message.contains("unknown query path")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn abci_query_honours_its_deadline() {
    let (base, _node) = serve(0).await;
    let rpc = HttpRpcClient::new(
        format!("{base}/slow"),
        Duration::from_millis(300),
        Duration::from_millis(300),
    )
    .expect("client");

    let err = rpc.abci_query("/store/bank/key", b"k").await.expect_err("deadline");
    assert!(matches!(err, RpcError::Deadline { .. }));
    assert_eq!(err.kind(), ErrorKind::Network);
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = client(&format!("http://{addr}"))
        .status()
        .await
        .expect_err("refused");
    assert_eq!(err.kind(), ErrorKind::Network);
}

#[tokio::test]
async fn retry_once_rides_out_a_single_failure() {
    let (base, node) = serve(1).await;
    let rpc = client(&base);

    let status = retry_once(|| rpc.status()).await.expect("second call succeeds");
    assert_eq!(status.height, 4200);
    assert_eq!(node.status_calls.load(Ordering::SeqCst), 2);

    let (base, node) = serve(2).await;
    let rpc = client(&base);
    assert!(retry_once(|| rpc.status()).await.is_err());
    assert_eq!(node.status_calls.load(Ordering::SeqCst), 2);
}
