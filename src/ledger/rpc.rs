//! JSON-RPC Ledger Client
//!
//! Talks to the ledger gateway over HTTP JSON-RPC. Operations are signed
//! locally with the payer's Ed25519 key; the gateway never sees private keys.
//!
//! Error classification uses the gateway's numeric error codes only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::client::LedgerClient;
use super::error::{LedgerError, LedgerErrorKind};
use super::retry::RetryPolicy;
use super::signing::sign_payload;
use super::types::{Address, Credentials, LedgerOperation, OperationId, value_as_u64};
use crate::config::LedgerConfig;

/// Gateway error codes
pub mod codes {
    pub const NOT_FOUND: i64 = 4004;
    pub const CLOSED: i64 = 4010;
    pub const INSUFFICIENT_RESOURCES: i64 = 4020;
    pub const RATE_LIMITED: i64 = 4290;
    pub const UNAVAILABLE: i64 = 5030;
    pub const TIMEOUT: i64 = 5040;
    /// JSON-RPC internal error
    pub const INTERNAL: i64 = -32603;
}

/// Map a gateway error code to a [`LedgerErrorKind`]
pub fn classify_code(code: i64) -> LedgerErrorKind {
    match code {
        codes::NOT_FOUND => LedgerErrorKind::NotFound,
        codes::CLOSED => LedgerErrorKind::Closed,
        codes::INSUFFICIENT_RESOURCES => LedgerErrorKind::InsufficientResources,
        codes::RATE_LIMITED | codes::UNAVAILABLE | codes::TIMEOUT | codes::INTERNAL => {
            LedgerErrorKind::Transient
        }
        _ => LedgerErrorKind::Rejected,
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Payload covered by the signature
#[derive(Debug, Clone, Serialize)]
struct OperationPayload {
    sender: String,
    function: String,
    arguments: Vec<Value>,
    expiration_timestamp_secs: i64,
}

#[derive(Deserialize)]
struct SubmitResult {
    hash: String,
}

/// Outcome of a committed operation
#[derive(Deserialize, Debug)]
struct Confirmation {
    success: bool,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    vm_status: String,
}

pub struct RpcLedgerClient {
    url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    operation_ttl_secs: i64,
    next_id: AtomicU64,
}

impl RpcLedgerClient {
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        info!(url = %config.rpc_url, "Initializing ledger RPC client");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| LedgerError::rejected(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: config.rpc_url.clone(),
            client,
            retry: config.retry.clone(),
            operation_ttl_secs: config.operation_ttl_secs,
            next_id: AtomicU64::new(1),
        })
    }

    /// One JSON-RPC round trip, no retry
    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<R, LedgerError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let rpc_response: JsonRpcResponse<R> = response.json().await.map_err(|e| {
            LedgerError::transient(format!("Failed to parse {} response: {}", method, e))
        })?;

        if let Some(error) = rpc_response.error {
            return Err(LedgerError::new(
                classify_code(error.code),
                format!("{} failed ({}): {}", method, error.code, error.message),
            ));
        }

        rpc_response
            .result
            .ok_or_else(|| LedgerError::transient(format!("No result in {} response", method)))
    }

    /// JSON-RPC call with the retry policy applied
    async fn rpc_call_retry<R>(&self, method: &'static str, params: Value) -> Result<R, LedgerError>
    where
        R: for<'de> Deserialize<'de>,
    {
        self.retry
            .run(method, |_| self.rpc_call(method, params.clone()))
            .await
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn submit(
        &self,
        credentials: &Credentials,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<OperationId, LedgerError> {
        let payload = OperationPayload {
            sender: credentials.address().to_string(),
            function: format!("{}::{}", module, function),
            arguments: args,
            expiration_timestamp_secs: chrono::Utc::now().timestamp() + self.operation_ttl_secs,
        };
        let envelope = sign_payload(credentials.signing_key(), payload)
            .map_err(|e| LedgerError::rejected(format!("Failed to encode payload: {}", e)))?;

        // Submission is attempted once: a lost response cannot be told apart
        // from a lost request, and the signed operation may already be in flight.
        let submitted: SubmitResult = self
            .rpc_call("ledger_submitOperation", json!([envelope]))
            .await?;
        debug!(hash = %submitted.hash, sender = %credentials.address(), "Operation submitted");

        let confirmation: Confirmation = self
            .rpc_call_retry("ledger_waitForOperation", json!([submitted.hash]))
            .await?;

        if !confirmation.success {
            let kind = confirmation
                .error_code
                .map(classify_code)
                .unwrap_or(LedgerErrorKind::Rejected);
            warn!(
                hash = %submitted.hash,
                vm_status = %confirmation.vm_status,
                kind = kind.code(),
                "Operation committed with failure"
            );
            return Err(LedgerError::new(
                kind,
                format!("{} aborted: {}", submitted.hash, confirmation.vm_status),
            ));
        }

        debug!(
            hash = %submitted.hash,
            version = ?confirmation.version.as_ref().and_then(value_as_u64),
            "Operation confirmed"
        );
        Ok(OperationId(submitted.hash))
    }

    async fn view(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, LedgerError> {
        self.rpc_call_retry(
            "ledger_view",
            json!([{
                "function": format!("{}::{}", module, function),
                "arguments": args,
            }]),
        )
        .await
    }

    async fn head_version(&self) -> Result<u64, LedgerError> {
        let head: Value = self.rpc_call_retry("ledger_headVersion", json!([])).await?;
        value_as_u64(&head)
            .ok_or_else(|| LedgerError::rejected(format!("Unexpected head version: {}", head)))
    }

    async fn history(
        &self,
        address: &Address,
        from_version: u64,
        limit: usize,
    ) -> Result<Vec<LedgerOperation>, LedgerError> {
        self.rpc_call_retry(
            "ledger_accountHistory",
            json!([address.as_str(), from_version.to_string(), limit]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_code() {
        assert_eq!(classify_code(codes::NOT_FOUND), LedgerErrorKind::NotFound);
        assert_eq!(classify_code(codes::CLOSED), LedgerErrorKind::Closed);
        assert_eq!(
            classify_code(codes::INSUFFICIENT_RESOURCES),
            LedgerErrorKind::InsufficientResources
        );
        assert_eq!(classify_code(codes::RATE_LIMITED), LedgerErrorKind::Transient);
        assert_eq!(classify_code(codes::INTERNAL), LedgerErrorKind::Transient);
        assert_eq!(classify_code(1), LedgerErrorKind::Rejected);
    }

    #[test]
    fn test_confirmation_deserialize() {
        let c: Confirmation = serde_json::from_value(json!({
            "success": false,
            "error_code": 4020,
            "vm_status": "EINSUFFICIENT_BALANCE"
        }))
        .unwrap();

        assert!(!c.success);
        assert_eq!(c.error_code.map(classify_code), Some(LedgerErrorKind::InsufficientResources));
        assert!(c.version.is_none());
    }

    #[test]
    fn test_history_deserialize() {
        let ops: Vec<LedgerOperation> = serde_json::from_value(json!([
            {"version": 10, "hash": "0xaa", "events": [
                {"type": "0x1::job_registry::JobCreated", "data": {"job_id": "1"}}
            ]},
            {"version": 12}
        ]))
        .unwrap();

        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].events[0].name(), "JobCreated");
        assert!(ops[1].events.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let config = LedgerConfig {
            rpc_url: "http://127.0.0.1:1".to_string(),
            request_timeout_ms: 200,
            retry: RetryPolicy::none(),
            ..LedgerConfig::default()
        };
        let client = RpcLedgerClient::new(&config).unwrap();

        let err = client.head_version().await.unwrap_err();
        assert_eq!(err.kind, LedgerErrorKind::Transient);
    }
}
