//! JSON-RPC 2.0 over HTTP POST, bounded and cancellable like any other fetch.

use std::sync::atomic::{AtomicU64, Ordering};

use http::HeaderValue;
use http::header::{ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::NetError;
use crate::fetch::{FetchRequest, UrlFetcher};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

/// Client for a single JSON-RPC endpoint.
#[derive(Debug)]
pub struct RpcTransport {
    endpoint: String,
    fetcher: UrlFetcher,
    next_id: AtomicU64,
}

impl RpcTransport {
    /// `fetcher` carries the timeout policy; by default that is the ambient
    /// budget of the calling thread.
    pub fn new(endpoint: impl Into<String>, fetcher: UrlFetcher) -> Self {
        Self {
            endpoint: endpoint.into(),
            fetcher,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn call(&self, method: &str, params: Value) -> Result<Value, NetError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&RpcRequest {
            jsonrpc: "2.0",
            method,
            params: &params,
            id,
        })?;

        let request = FetchRequest::post(self.endpoint.clone(), body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(ACCEPT, HeaderValue::from_static("application/json"));

        debug!(endpoint = %self.endpoint, method, id, "rpc call");
        let response = self.fetcher.fetch_request(request)?;
        let reply: RpcResponse = serde_json::from_slice(response.body())?;

        if let Some(fault) = reply.error {
            return Err(NetError::Rpc {
                code: fault.code,
                message: fault.message,
            });
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    pub fn call_as<T>(&self, method: &str, params: Value) -> Result<T, NetError>
    where
        T: DeserializeOwned,
    {
        let value = self.call(method, params)?;
        Ok(serde_json::from_value(value)?)
    }
}
