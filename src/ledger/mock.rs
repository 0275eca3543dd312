//! Scripted in-process ledger for tests and local dry runs.
//!
//! Streams, canned views and history are set up front; every call is
//! counted so tests can assert on what the core actually did.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use super::client::{LedgerClient, LedgerModules, functions};
use super::error::{LedgerError, LedgerErrorKind};
use super::types::{Address, Credentials, LedgerOperation, OperationId};

/// Liveness state of a stream as seen by the mock ledger.
///
/// Paused is `(false, true)`, closed is `(false, false)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockStreamState {
    pub is_active: bool,
    pub is_paused: bool,
}

pub struct MockLedgerClient {
    modules: LedgerModules,
    /// (payer, job_id) -> liveness
    streams: Mutex<HashMap<(Address, u64), MockStreamState>>,
    /// Claim failure to return per stream, success when absent
    claim_failures: Mutex<HashMap<(Address, u64), LedgerErrorKind>>,
    /// Liveness view failure per stream
    view_failures: Mutex<HashMap<(Address, u64), LedgerErrorKind>>,
    /// "module::function(args)" -> response
    views: Mutex<HashMap<String, Result<Value, LedgerError>>>,
    operations: Mutex<Vec<LedgerOperation>>,
    head_override: Mutex<Option<u64>>,
    /// Fail history calls whose `from_version` is at or above this value
    history_fail_from: Mutex<Option<u64>>,
    reachable: AtomicBool,
    /// When set, `submit` waits for a permit before returning
    submit_gate: Mutex<Option<Arc<Semaphore>>>,
    /// When set, `history` waits for a permit before returning
    history_gate: Mutex<Option<Arc<Semaphore>>>,

    submit_count: AtomicUsize,
    view_count: AtomicUsize,
    history_count: AtomicUsize,
    submits_per_stream: Mutex<HashMap<(Address, u64), usize>>,
    history_calls: Mutex<Vec<(u64, usize)>>,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self::with_modules(LedgerModules::default())
    }

    pub fn with_modules(modules: LedgerModules) -> Self {
        Self {
            modules,
            streams: Mutex::new(HashMap::new()),
            claim_failures: Mutex::new(HashMap::new()),
            view_failures: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            operations: Mutex::new(Vec::new()),
            head_override: Mutex::new(None),
            history_fail_from: Mutex::new(None),
            reachable: AtomicBool::new(true),
            submit_gate: Mutex::new(None),
            history_gate: Mutex::new(None),
            submit_count: AtomicUsize::new(0),
            view_count: AtomicUsize::new(0),
            history_count: AtomicUsize::new(0),
            submits_per_stream: Mutex::new(HashMap::new()),
            history_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn modules(&self) -> &LedgerModules {
        &self.modules
    }

    // === Scripting ===

    pub fn set_stream(&self, payer: &Address, job_id: u64, is_active: bool, is_paused: bool) {
        self.streams.lock().unwrap().insert(
            (payer.clone(), job_id),
            MockStreamState {
                is_active,
                is_paused,
            },
        );
    }

    pub fn remove_stream(&self, payer: &Address, job_id: u64) {
        self.streams.lock().unwrap().remove(&(payer.clone(), job_id));
    }

    pub fn set_claim_failure(&self, payer: &Address, job_id: u64, kind: Option<LedgerErrorKind>) {
        let mut failures = self.claim_failures.lock().unwrap();
        match kind {
            Some(kind) => failures.insert((payer.clone(), job_id), kind),
            None => failures.remove(&(payer.clone(), job_id)),
        };
    }

    pub fn set_view_failure(&self, payer: &Address, job_id: u64, kind: Option<LedgerErrorKind>) {
        let mut failures = self.view_failures.lock().unwrap();
        match kind {
            Some(kind) => failures.insert((payer.clone(), job_id), kind),
            None => failures.remove(&(payer.clone(), job_id)),
        };
    }

    /// Canned response for an arbitrary view call
    pub fn set_view(
        &self,
        module: &str,
        function: &str,
        args: &[Value],
        response: Result<Value, LedgerError>,
    ) {
        self.views
            .lock()
            .unwrap()
            .insert(view_key(module, function, args), response);
    }

    pub fn push_operations(&self, ops: impl IntoIterator<Item = LedgerOperation>) {
        let mut stored = self.operations.lock().unwrap();
        stored.extend(ops);
        stored.sort_by_key(|op| op.version);
    }

    pub fn set_head_version(&self, head: Option<u64>) {
        *self.head_override.lock().unwrap() = head;
    }

    pub fn fail_history_from(&self, version: Option<u64>) {
        *self.history_fail_from.lock().unwrap() = version;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every `submit` wait until [`MockLedgerClient::release_submits`]
    pub fn hold_submits(&self) {
        *self.submit_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_submits(&self) {
        if let Some(gate) = self.submit_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Make every `history` call wait until [`MockLedgerClient::release_history`]
    pub fn hold_history(&self) {
        *self.history_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_history(&self) {
        if let Some(gate) = self.history_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    // === Observation ===

    pub fn submit_count(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub fn view_count(&self) -> usize {
        self.view_count.load(Ordering::SeqCst)
    }

    pub fn history_count(&self) -> usize {
        self.history_count.load(Ordering::SeqCst)
    }

    pub fn submits_for(&self, payer: &Address, job_id: u64) -> usize {
        self.submits_per_stream
            .lock()
            .unwrap()
            .get(&(payer.clone(), job_id))
            .copied()
            .unwrap_or(0)
    }

    /// `(from_version, limit)` of every history call, in order
    pub fn history_calls(&self) -> Vec<(u64, usize)> {
        self.history_calls.lock().unwrap().clone()
    }

    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::transient("mock ledger unreachable"))
        }
    }

    fn stream_key(args: &[Value]) -> Option<(Address, u64)> {
        let payer = Address::parse(args.first()?.as_str()?).ok()?;
        let job_id = super::types::value_as_u64(args.get(1)?)?;
        Some((payer, job_id))
    }
}

impl Default for MockLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

fn view_key(module: &str, function: &str, args: &[Value]) -> String {
    format!("{}::{}({})", module, function, Value::Array(args.to_vec()))
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn submit(
        &self,
        _credentials: &Credentials,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<OperationId, LedgerError> {
        let n = self.submit_count.fetch_add(1, Ordering::SeqCst) + 1;

        let gate = self.submit_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| LedgerError::transient("submit gate closed"))?;
        }
        self.check_reachable()?;

        if module == self.modules.payment_module() && function == functions::PROCESS_PAYMENT {
            let key = Self::stream_key(&args)
                .ok_or_else(|| LedgerError::rejected("bad process_payment arguments"))?;
            *self
                .submits_per_stream
                .lock()
                .unwrap()
                .entry(key.clone())
                .or_default() += 1;

            if let Some(kind) = self.claim_failures.lock().unwrap().get(&key) {
                return Err(LedgerError::new(*kind, format!("mock claim failure for {:?}", key)));
            }
            match self.streams.lock().unwrap().get(&key) {
                None => return Err(LedgerError::not_found("stream does not exist")),
                Some(state) if state.is_paused => {
                    return Err(LedgerError::rejected("stream is paused"));
                }
                Some(state) if !state.is_active => {
                    return Err(LedgerError::closed("stream is closed"));
                }
                Some(_) => {}
            }
        }

        Ok(OperationId(format!("0xmock{:04}", n)))
    }

    async fn view(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, LedgerError> {
        self.view_count.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        if let Some(response) = self.views.lock().unwrap().get(&view_key(module, function, &args)) {
            return response.clone();
        }

        if module == self.modules.payment_module() && function == functions::GET_STREAM {
            let key = Self::stream_key(&args)
                .ok_or_else(|| LedgerError::rejected("bad get_stream arguments"))?;
            if let Some(kind) = self.view_failures.lock().unwrap().get(&key) {
                return Err(LedgerError::new(*kind, "mock view failure"));
            }
            return match self.streams.lock().unwrap().get(&key) {
                Some(state) => Ok(json!([{
                    "payer": key.0.as_str(),
                    "job_id": key.1.to_string(),
                    "is_active": state.is_active,
                    "is_paused": state.is_paused,
                }])),
                None => Err(LedgerError::not_found("stream does not exist")),
            };
        }

        Err(LedgerError::not_found(format!(
            "no canned view for {}",
            view_key(module, function, &args)
        )))
    }

    async fn head_version(&self) -> Result<u64, LedgerError> {
        self.check_reachable()?;
        if let Some(head) = *self.head_override.lock().unwrap() {
            return Ok(head);
        }
        Ok(self
            .operations
            .lock()
            .unwrap()
            .last()
            .map(|op| op.version)
            .unwrap_or(0))
    }

    async fn history(
        &self,
        _address: &Address,
        from_version: u64,
        limit: usize,
    ) -> Result<Vec<LedgerOperation>, LedgerError> {
        self.history_count.fetch_add(1, Ordering::SeqCst);
        self.history_calls.lock().unwrap().push((from_version, limit));

        let gate = self.history_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| LedgerError::transient("history gate closed"))?;
        }
        self.check_reachable()?;

        if let Some(fail_from) = *self.history_fail_from.lock().unwrap()
            && from_version >= fail_from
        {
            return Err(LedgerError::transient("mock history failure"));
        }

        Ok(self
            .operations
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.version >= from_version)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payer() -> Address {
        Address::parse("0xa11ce").unwrap()
    }

    #[tokio::test]
    async fn test_stream_view_and_claim() {
        let ledger = MockLedgerClient::new();
        let module = ledger.modules().payment_module();
        ledger.set_stream(&payer(), 1, true, false);

        let args = vec![json!(payer().as_str()), json!("1")];
        let view = ledger.view(&module, functions::GET_STREAM, args.clone()).await.unwrap();
        assert_eq!(view[0]["is_active"], json!(true));

        let creds = Credentials::generate(payer());
        ledger
            .submit(&creds, &module, functions::PROCESS_PAYMENT, args)
            .await
            .unwrap();
        assert_eq!(ledger.submits_for(&payer(), 1), 1);
    }

    #[tokio::test]
    async fn test_history_paging() {
        let ledger = MockLedgerClient::new();
        ledger.push_operations((1..=5).map(|v| LedgerOperation {
            version: v,
            hash: String::new(),
            events: vec![],
        }));

        let page = ledger.history(&payer(), 2, 2).await.unwrap();
        assert_eq!(page.iter().map(|o| o.version).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(ledger.head_version().await.unwrap(), 5);
        assert_eq!(ledger.history_calls(), vec![(2, 2)]);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let ledger = MockLedgerClient::new();
        ledger.set_reachable(false);
        let err = ledger.head_version().await.unwrap_err();
        assert_eq!(err.kind, LedgerErrorKind::Transient);
    }
}
