//! Node JSON-RPC access.
//!
//! [`NodeRpc`] is the seam every chain-reading command goes through. The
//! production implementation is [`http::HttpRpcClient`]; tests substitute
//! scripted fakes. Calls carry their own deadline and never retry; callers
//! decide whether to try again (see [`retry_once`]).

pub mod http;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::error::{Classify, ErrorKind, Remediation};

pub use http::HttpRpcClient;

/// Pause before the single command-scope retry.
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Subset of `/status` the manager cares about.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct NodeStatus {
    pub height: u64,
    pub catching_up: bool,
    pub node_id: String,
    pub moniker: String,
    pub chain_id: String,
}

/// A connected peer from `/net_info`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Peer {
    pub id: String,
    /// `ip:port` of the peer's P2P listener.
    pub address: String,
}

impl Peer {
    /// `id@ip:port`, the form used by `persistent_peers`.
    pub fn to_persistent(&self) -> String {
        format!("{}@{}", self.id, self.address)
    }
}

/// Result of an `/abci_query` call.
///
/// A non-zero `code` is an application-level rejection, not a transport
/// failure; callers inspect it themselves.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AbciQueryResponse {
    pub code: u32,
    pub log: String,
    /// `value` after base64 decoding; empty when the node returned none.
    pub value: Vec<u8>,
    pub height: u64,
}

impl AbciQueryResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Errors surfaced by RPC calls.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection refused, DNS failure, TLS failure, non-2xx status.
    #[error("network error talking to {url}: {message}")]
    Network { url: String, message: String },
    /// The call did not complete within its deadline.
    #[error("request to {url} timed out after {timeout:?}")]
    Deadline { url: String, timeout: Duration },
    /// The node answered with something we could not interpret.
    #[error("malformed response from {url}: {message}")]
    Protocol { url: String, message: String },
}

impl Classify for RpcError {
    fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Network { .. } | RpcError::Deadline { .. } => ErrorKind::Network,
            RpcError::Protocol { .. } => ErrorKind::Protocol,
        }
    }

    fn remediation(&self) -> Remediation {
        let base = Remediation::new(self.to_string());
        match self {
            RpcError::Network { .. } | RpcError::Deadline { .. } => base
                .cause("the node is not running or has not bound its RPC port yet")
                .cause("the remote endpoint is unreachable from this host")
                .action("push-validator status")
                .action("push-validator logs --lines 50"),
            RpcError::Protocol { .. } => base
                .cause("the endpoint is not a CometBFT JSON-RPC server")
                .action("check --rpc / RPC_LOCAL and GENESIS_DOMAIN"),
        }
    }
}

/// Typed access to a node's JSON-RPC.
pub trait NodeRpc: Send + Sync {
    /// `/status` of the configured node.
    fn status(&self) -> impl Future<Output = Result<NodeStatus, RpcError>> + Send;

    /// Connected peers of the configured node; empty when it has none.
    fn peers(&self) -> impl Future<Output = Result<Vec<Peer>, RpcError>> + Send;

    /// `/status` of another endpoint, e.g. the public RPC of the network.
    fn remote_status(
        &self,
        base_url: &str,
    ) -> impl Future<Output = Result<NodeStatus, RpcError>> + Send;

    /// `/abci_query` of the configured node. `data` is sent hex-encoded.
    fn abci_query(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl Future<Output = Result<AbciQueryResponse, RpcError>> + Send;
}

/// Runs `op`, retrying exactly once after a short pause on network-class
/// failures. Protocol failures are returned immediately.
pub async fn retry_once<T, F, Fut>(mut op: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    match op().await {
        Err(err) if err.kind().is_retryable() => {
            tracing::debug!(%err, "rpc call failed, retrying once");
            tokio::time::sleep(RETRY_PAUSE).await;
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn network_err() -> RpcError {
        RpcError::Network {
            url: "http://127.0.0.1:26657/status".into(),
            message: "connection refused".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_once_retries_network_errors_a_single_time() {
        let calls = AtomicUsize::new(0);
        let result: Result<u64, _> = retry_once(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(network_err())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_once_recovers_on_second_attempt() {
        let calls = AtomicUsize::new(0);
        let result = retry_once(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(network_err())
            } else {
                Ok(7u64)
            }
        })
        .await;

        assert_eq!(result.expect("second attempt succeeds"), 7);
    }

    #[tokio::test]
    async fn retry_once_does_not_retry_protocol_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_once(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RpcError::Protocol {
                url: "x".into(),
                message: "not json".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(RpcError::Protocol { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn peer_persistent_form() {
        let peer = Peer {
            id: "abc".into(),
            address: "10.0.0.1:26656".into(),
        };
        assert_eq!(peer.to_persistent(), "abc@10.0.0.1:26656");
    }
}
