//! Scripted adapters for integration tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use wavefront_core::orchestration::WorkflowOrchestrator;
use wavefront_core::registry::{Adapter, AdapterError, AdapterOutput, Kwargs};

/// Adapter that fails a fixed number of calls, then succeeds.
///
/// Every method listed in `methods` shares the same script and call counter.
pub struct ScriptedAdapter {
    name: String,
    methods: Vec<String>,
    remaining_failures: AtomicU32,
    failure: AdapterError,
    calls: AtomicU32,
    received: Mutex<Vec<(String, Vec<Value>, Kwargs)>>,
}

impl ScriptedAdapter {
    pub fn succeeding(name: &str) -> Arc<Self> {
        Self::failing(name, 0, AdapterError::Technical("unused".to_string()))
    }

    pub fn failing(name: &str, failures: u32, failure: AdapterError) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            methods: vec!["run".to_string()],
            remaining_failures: AtomicU32::new(failures),
            failure,
            calls: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Always fails with `failure`
    pub fn broken(name: &str, failure: AdapterError) -> Arc<Self> {
        Self::failing(name, u32::MAX, failure)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Positional arguments of every call, in call order
    pub fn received_args(&self) -> Vec<Vec<Value>> {
        self.received
            .lock()
            .iter()
            .map(|(_, args, _)| args.clone())
            .collect()
    }

    pub fn received_kwargs(&self) -> Vec<Kwargs> {
        self.received
            .lock()
            .iter()
            .map(|(_, _, kwargs)| kwargs.clone())
            .collect()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> Vec<String> {
        self.methods.clone()
    }

    async fn call(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<AdapterOutput, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.received
            .lock()
            .push((method.to_string(), args.to_vec(), kwargs.clone()));

        let should_fail = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                (left > 0).then(|| if left == u32::MAX { left } else { left - 1 })
            })
            .is_ok();
        if should_fail {
            return Err(self.failure.clone());
        }

        Ok(AdapterOutput::Raw(json!({
            "adapter": self.name,
            "method": method,
            "call": call,
            "args": args,
        })))
    }
}

/// Adapter that cancels a workflow from inside its own call, then succeeds
pub struct CancellingAdapter {
    name: String,
    workflow_id: String,
    orchestrator: OnceLock<Arc<WorkflowOrchestrator>>,
    calls: AtomicU32,
}

impl CancellingAdapter {
    pub fn new(name: &str, workflow_id: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            workflow_id: workflow_id.to_string(),
            orchestrator: OnceLock::new(),
            calls: AtomicU32::new(0),
        })
    }

    /// Wire the orchestrator once the engine is bootstrapped
    pub fn attach(&self, orchestrator: Arc<WorkflowOrchestrator>) {
        let _ = self.orchestrator.set(orchestrator);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for CancellingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> Vec<String> {
        vec!["run".to_string()]
    }

    async fn call(
        &self,
        method: &str,
        _args: &[Value],
        _kwargs: &Kwargs,
    ) -> Result<AdapterOutput, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let orchestrator = self
            .orchestrator
            .get()
            .ok_or_else(|| AdapterError::Technical("orchestrator not attached".into()))?;
        orchestrator
            .cancel(&self.workflow_id)
            .await
            .map_err(|e| AdapterError::Technical(e.to_string()))?;

        Ok(AdapterOutput::Raw(json!({
            "adapter": self.name,
            "method": method,
            "call": call,
        })))
    }
}
