use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::LedgerError;
use super::types::{Address, Credentials, LedgerOperation, OperationId};

/// Narrow interface to the external ledger.
///
/// Retry and timeout policy for a single call lives behind this trait;
/// callers treat every returned error as final for the current attempt.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Client name for logging
    fn name(&self) -> &'static str;

    /// Sign and submit an operation, waiting until the ledger confirms it.
    async fn submit(
        &self,
        credentials: &Credentials,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<OperationId, LedgerError>;

    /// Call a read-only view function
    async fn view(&self, module: &str, function: &str, args: Vec<Value>)
    -> Result<Value, LedgerError>;

    /// Current global head of the operation-version sequence
    async fn head_version(&self) -> Result<u64, LedgerError>;

    /// Operations touching `address` with `version >= from_version`,
    /// ascending by version, at most `limit` entries.
    async fn history(
        &self,
        address: &Address,
        from_version: u64,
        limit: usize,
    ) -> Result<Vec<LedgerOperation>, LedgerError>;
}

/// On-ledger module names for the marketplace contracts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerModules {
    /// Qualifier prepended to every module, e.g. the publishing account
    pub package: String,
    pub provider: String,
    pub job: String,
    pub escrow: String,
    pub payment: String,
}

impl Default for LedgerModules {
    fn default() -> Self {
        Self {
            package: "0x1".to_string(),
            provider: "provider_registry".to_string(),
            job: "job_registry".to_string(),
            escrow: "escrow".to_string(),
            payment: "stream_payment".to_string(),
        }
    }
}

impl LedgerModules {
    pub fn provider_module(&self) -> String {
        self.qualify(&self.provider)
    }

    pub fn job_module(&self) -> String {
        self.qualify(&self.job)
    }

    pub fn escrow_module(&self) -> String {
        self.qualify(&self.escrow)
    }

    pub fn payment_module(&self) -> String {
        self.qualify(&self.payment)
    }

    fn qualify(&self, module: &str) -> String {
        if self.package.is_empty() {
            module.to_string()
        } else {
            format!("{}::{}", self.package, module)
        }
    }
}

/// View and entry function names on the marketplace contracts
pub mod functions {
    pub const GET_PROVIDER: &str = "get_provider";
    pub const GET_JOB: &str = "get_job";
    pub const GET_NEXT_JOB_ID: &str = "get_next_job_id";
    pub const GET_ESCROW: &str = "get_escrow";
    pub const GET_STREAM: &str = "get_stream";
    pub const PROCESS_PAYMENT: &str = "process_payment";
}
