//! Request/response over the relay bus. Replies are correlated by the
//! originating request id; independent requests have no ordering guarantee.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use secp256k1::PublicKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BraidError, Result};
use crate::relay::transport::{Envelope, RelayTransport};

pub const CODE_UNKNOWN_METHOD: i32 = -32601;
pub const CODE_BAD_PARAMS: i32 = -32602;
pub const CODE_HANDLER_FAILURE: i32 = -32603;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn unknown_method(method: &str) -> Self {
        RpcError {
            code: CODE_UNKNOWN_METHOD,
            message: format!("unknown method {method:?}"),
            data: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        RpcError {
            code: CODE_BAD_PARAMS,
            message: message.into(),
            data: None,
        }
    }

    pub fn handler_failure(message: impl Into<String>) -> Self {
        RpcError {
            code: CODE_HANDLER_FAILURE,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Requests carry `method`; everything else is a response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RelayMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

/// Inbound request dispatch. Implementations return the result value or a
/// coded error; panics and slow handlers only affect their own task.
#[async_trait::async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        from: PublicKey,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError>;
}

/// One relay endpoint speaking the request/response protocol: a single
/// listen task dispatches inbound requests and routes responses to their
/// waiting callers.
pub struct PeerNode {
    transport: Arc<dyn RelayTransport>,
    public_key: PublicKey,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>,
}

impl PeerNode {
    pub fn new(transport: Arc<dyn RelayTransport>, public_key: PublicKey) -> Arc<Self> {
        Arc::new(PeerNode {
            transport,
            public_key,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Start the listen task. Must be called once before `request`; inbound
    /// requests go to `handler`.
    pub async fn serve(self: &Arc<Self>, handler: Arc<dyn MethodHandler>) -> Result<()> {
        let mut stream = self
            .transport
            .incoming()
            .await
            .map_err(|e| BraidError::Relay(e.to_string()))?;
        let node = self.clone();

        tokio::spawn(async move {
            while let Some(envelope) = stream.next().await {
                let message: RelayMessage = match serde_json::from_str(&envelope.payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("dropping undecodable relay payload: {e}");
                        continue;
                    }
                };
                match message {
                    RelayMessage::Request(request) => {
                        let node = node.clone();
                        let handler = handler.clone();
                        let from = envelope.from;
                        tokio::spawn(async move {
                            node.answer(from, request, handler).await;
                        });
                    }
                    RelayMessage::Response(response) => {
                        let waiter = node.pending.lock().await.remove(&response.id);
                        match waiter {
                            // A dead waiter means the caller timed out; the
                            // late result is discarded.
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!("discarding response for unknown id {}", response.id),
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn answer(&self, from: PublicKey, request: RpcRequest, handler: Arc<dyn MethodHandler>) {
        let outcome = handler.handle(from, &request.method, request.params).await;
        let response = match outcome {
            Ok(result) => RpcResponse {
                id: request.id,
                result: Some(result),
                error: None,
            },
            Err(error) => RpcResponse {
                id: request.id,
                result: None,
                error: Some(error),
            },
        };
        let payload = match serde_json::to_string(&RelayMessage::Response(response)) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode response: {e}");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .send(Envelope {
                from: self.public_key,
                to: from,
                payload,
            })
            .await
        {
            warn!("failed to send response: {e}");
        }
    }

    /// Issue a request and await its correlated response.
    pub async fn request(
        &self,
        to: PublicKey,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_string(&RelayMessage::Request(request))?;
        let sent = self
            .transport
            .send(Envelope {
                from: self.public_key,
                to,
                payload,
            })
            .await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(BraidError::Relay(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    return Err(BraidError::Rpc {
                        code: error.code,
                        message: error.message,
                    });
                }
                Ok(response.result.unwrap_or(Value::Null))
            }
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(BraidError::Relay("response channel closed".to_string()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BraidError::Timeout {
                    peer: to.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Typed convenience wrapper around `request`.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        to: PublicKey,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R> {
        let value = self
            .request(to, method, serde_json::to_value(params)?, timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Deserialize handler params, mapping failures to the bad-params code.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> std::result::Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::bad_params(format!("bad params: {e}")))
}
