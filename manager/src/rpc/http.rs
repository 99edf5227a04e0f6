//! HTTP JSON-RPC client for CometBFT-style nodes.
//!
//! Endpoints used:
//!
//! ```text
//! GET /status   -> { "result": { "node_info": {...}, "sync_info": {...} } }
//! GET /net_info -> { "result": { "n_peers": "2", "peers": [ {...} ] } }
//! GET /abci_query?path="/x"&data=0x.. -> { "result": { "response": {...} } }
//! ```
//!
//! Heights arrive as decimal strings. Error envelopes of the form
//! `{ "error": { "code": -32603, "message": "...", "data": "..." } }` are
//! surfaced as [`RpcError::Protocol`].

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{AbciQueryResponse, NodeRpc, NodeStatus, Peer, RpcError};

/// HTTP JSON-RPC client.
///
/// Cheap to clone; the underlying `reqwest` connection pool is shared.
#[derive(Clone)]
pub struct HttpRpcClient {
    base_url: String,
    client: Client,
    timeout: Duration,
    remote_timeout: Duration,
}

impl HttpRpcClient {
    /// Constructs a client for `base_url` (e.g. `"http://127.0.0.1:26657"`).
    ///
    /// `timeout` bounds calls to `base_url`; `remote_timeout` bounds
    /// [`NodeRpc::remote_status`] calls.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        remote_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let base_url = base_url.into();
        let client = Client::builder()
            .user_agent(concat!("push-validator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RpcError::Network {
                url: base_url.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url,
            client,
            timeout,
            remote_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// A client for another endpoint sharing this client's connection pool.
    pub fn with_base_url(&self, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: self.client.clone(),
            timeout: self.remote_timeout,
            remote_timeout: self.remote_timeout,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, RpcError> {
        let url = endpoint(base_url, path);

        let fut = async {
            let resp = self
                .client
                .get(&url)
                .query(query)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| classify_transport(&url, timeout, e))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(RpcError::Network {
                    url: url.clone(),
                    message: format!("HTTP status {status}"),
                });
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| classify_transport(&url, timeout, e))?;
            decode_envelope(&url, &bytes)
        };

        // reqwest's timeout covers the request; this also bounds DNS stalls.
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Deadline { url, timeout }),
        }
    }
}

impl NodeRpc for HttpRpcClient {
    async fn status(&self) -> Result<NodeStatus, RpcError> {
        let raw: RawStatus = self.get(&self.base_url, "/status", &[], self.timeout).await?;
        raw.into_status(&endpoint(&self.base_url, "/status"))
    }

    async fn peers(&self) -> Result<Vec<Peer>, RpcError> {
        let raw: RawNetInfo = self
            .get(&self.base_url, "/net_info", &[], self.timeout)
            .await?;
        Ok(raw.into_peers())
    }

    async fn remote_status(&self, base_url: &str) -> Result<NodeStatus, RpcError> {
        let raw: RawStatus = self
            .get(base_url, "/status", &[], self.remote_timeout)
            .await?;
        raw.into_status(&endpoint(base_url, "/status"))
    }

    async fn abci_query(&self, path: &str, data: &[u8]) -> Result<AbciQueryResponse, RpcError> {
        // CometBFT's URI transport wants string arguments quoted and bytes as 0x-hex.
        let query = [
            ("path", format!("\"{path}\"")),
            ("data", format!("0x{}", hex::encode(data))),
        ];
        let raw: RawAbciQuery = self
            .get(&self.base_url, "/abci_query", &query, self.timeout)
            .await?;
        raw.response.into_response(&endpoint(&self.base_url, "/abci_query"))
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    // Avoid accidental double slashes.
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn classify_transport(url: &str, timeout: Duration, err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::Deadline {
            url: url.to_string(),
            timeout,
        }
    } else if err.is_decode() {
        RpcError::Protocol {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        RpcError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// JSON-RPC 2.0 envelope. Some proxies strip the envelope and return the
/// bare result, so both shapes are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Error { error: RpcErrorBody },
    Result { result: T },
    Bare(T),
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<String>,
}

fn decode_envelope<T: DeserializeOwned>(url: &str, bytes: &[u8]) -> Result<T, RpcError> {
    let envelope: Envelope<T> = serde_json::from_slice(bytes).map_err(|e| RpcError::Protocol {
        url: url.to_string(),
        message: format!("failed to parse JSON-RPC response: {e}"),
    })?;

    match envelope {
        Envelope::Result { result } | Envelope::Bare(result) => Ok(result),
        Envelope::Error { error } => Err(RpcError::Protocol {
            url: url.to_string(),
            message: format!(
                "rpc error {}: {}{}",
                error.code,
                error.message,
                error.data.map(|d| format!(" ({d})")).unwrap_or_default()
            ),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    node_info: RawNodeInfo,
    sync_info: RawSyncInfo,
}

#[derive(Debug, Deserialize)]
struct RawNodeInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    network: String,
    #[serde(default)]
    moniker: String,
    #[serde(default)]
    listen_addr: String,
}

#[derive(Debug, Deserialize)]
struct RawSyncInfo {
    #[serde(default)]
    latest_block_height: String,
    #[serde(default)]
    catching_up: bool,
}

impl RawStatus {
    fn into_status(self, url: &str) -> Result<NodeStatus, RpcError> {
        let height = parse_height(&self.sync_info.latest_block_height).ok_or_else(|| {
            RpcError::Protocol {
                url: url.to_string(),
                message: format!(
                    "latest_block_height {:?} is not a number",
                    self.sync_info.latest_block_height
                ),
            }
        })?;

        Ok(NodeStatus {
            height,
            catching_up: self.sync_info.catching_up,
            node_id: self.node_info.id,
            moniker: self.node_info.moniker,
            chain_id: self.node_info.network,
        })
    }
}

fn parse_height(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(0);
    }
    raw.parse().ok()
}

#[derive(Debug, Deserialize)]
struct RawNetInfo {
    #[serde(default)]
    peers: Vec<RawPeer>,
}

#[derive(Debug, Deserialize)]
struct RawPeer {
    node_info: RawNodeInfo,
    #[serde(default)]
    remote_ip: String,
}

impl RawNetInfo {
    fn into_peers(self) -> Vec<Peer> {
        self.peers
            .into_iter()
            .filter_map(|p| {
                let port = listen_port(&p.node_info.listen_addr)?;
                if p.node_info.id.is_empty() || p.remote_ip.is_empty() {
                    return None;
                }
                Some(Peer {
                    id: p.node_info.id,
                    address: format!("{}:{port}", p.remote_ip),
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawAbciQuery {
    response: RawAbciResponse,
}

#[derive(Debug, Deserialize)]
struct RawAbciResponse {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    log: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    height: String,
}

impl RawAbciResponse {
    fn into_response(self, url: &str) -> Result<AbciQueryResponse, RpcError> {
        let height = parse_height(&self.height).ok_or_else(|| RpcError::Protocol {
            url: url.to_string(),
            message: format!("height {:?} is not a number", self.height),
        })?;
        let value = match self.value.as_deref() {
            None | Some("") => Vec::new(),
            Some(encoded) => BASE64_STANDARD.decode(encoded).map_err(|e| RpcError::Protocol {
                url: url.to_string(),
                message: format!("abci_query value is not base64: {e}"),
            })?,
        };

        Ok(AbciQueryResponse {
            code: self.code,
            log: self.log,
            value,
            height,
        })
    }
}

/// Port from a listen address such as `tcp://0.0.0.0:26656`.
fn listen_port(listen_addr: &str) -> Option<u16> {
    listen_addr.rsplit(':').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_JSON: &str = r#"
    {
      "jsonrpc": "2.0",
      "id": -1,
      "result": {
        "node_info": {
          "id": "5a1f",
          "listen_addr": "tcp://0.0.0.0:26656",
          "network": "push_42101-1",
          "moniker": "alice"
        },
        "sync_info": {
          "latest_block_height": "123456",
          "catching_up": true
        }
      }
    }
    "#;

    #[test]
    fn status_response_can_be_decoded() {
        let raw: RawStatus = decode_envelope("u", STATUS_JSON.as_bytes()).expect("decode status");
        let status = raw.into_status("u").expect("convert status");

        assert_eq!(status.height, 123_456);
        assert!(status.catching_up);
        assert_eq!(status.node_id, "5a1f");
        assert_eq!(status.moniker, "alice");
        assert_eq!(status.chain_id, "push_42101-1");
    }

    #[test]
    fn bare_result_is_accepted() {
        let bare = r#"{"node_info":{"id":"x"},"sync_info":{"latest_block_height":"7"}}"#;
        let raw: RawStatus = decode_envelope("u", bare.as_bytes()).expect("decode bare");
        assert_eq!(raw.into_status("u").expect("convert").height, 7);
    }

    #[test]
    fn error_envelope_is_protocol_error() {
        let body = r#"{"jsonrpc":"2.0","id":-1,"error":{"code":-32603,"message":"Internal error","data":"boom"}}"#;
        let err = decode_envelope::<RawStatus>("u", body.as_bytes()).expect_err("must fail");
        match err {
            RpcError::Protocol { message, .. } => {
                assert!(message.contains("-32603"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_numeric_height_is_rejected() {
        let body = r#"{"result":{"node_info":{},"sync_info":{"latest_block_height":"abc"}}}"#;
        let raw: RawStatus = decode_envelope("u", body.as_bytes()).expect("decode");
        assert!(matches!(raw.into_status("u"), Err(RpcError::Protocol { .. })));
    }

    #[test]
    fn net_info_peers_are_normalised() {
        let body = r#"
        {"result":{"n_peers":"3","peers":[
          {"node_info":{"id":"aa","listen_addr":"tcp://0.0.0.0:26656"},"remote_ip":"10.0.0.1"},
          {"node_info":{"id":"bb","listen_addr":"26656"},"remote_ip":"10.0.0.2"},
          {"node_info":{"id":"","listen_addr":"tcp://0.0.0.0:26656"},"remote_ip":"10.0.0.3"}
        ]}}"#;
        let raw: RawNetInfo = decode_envelope("u", body.as_bytes()).expect("decode net_info");
        let peers = raw.into_peers();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_persistent(), "aa@10.0.0.1:26656");
        assert_eq!(peers[1].address, "10.0.0.2:26656");
    }

    #[test]
    fn abci_response_value_is_base64_decoded() {
        let body = r#"{"result":{"response":{"code":0,"log":"","value":"aGVsbG8=","height":"42"}}}"#;
        let raw: RawAbciQuery = decode_envelope("u", body.as_bytes()).expect("decode abci_query");
        let resp = raw.response.into_response("u").expect("convert");

        assert!(resp.is_ok());
        assert_eq!(resp.value, b"hello");
        assert_eq!(resp.height, 42);
    }

    #[test]
    fn abci_response_without_value_is_empty() {
        let body = r#"{"result":{"response":{"code":22,"log":"not found","value":null,"height":"0"}}}"#;
        let raw: RawAbciQuery = decode_envelope("u", body.as_bytes()).expect("decode abci_query");
        let resp = raw.response.into_response("u").expect("convert");

        assert!(!resp.is_ok());
        assert_eq!(resp.log, "not found");
        assert!(resp.value.is_empty());
    }

    #[test]
    fn endpoint_avoids_double_slashes() {
        assert_eq!(endpoint("http://h:1/", "/status"), "http://h:1/status");
    }
}
