//! Fakes shared by the worker's unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use lib_batch::rate_gate::RateGateConfig;
use lib_batch::{
    BudgetConfig, CallRequest, CallResponse, ManualClock, MemoryTaskStore, RateGate, ResilientCaller,
    RetryPolicy, RunContext, TaskError, TaskStore, Transport, TransportError,
};

use crate::prompt::{ImageGenerator, TextGenerator};

/// Answers every request with the same response and keeps what was sent.
pub struct RecordingTransport {
    status: u16,
    body: String,
    sent: Mutex<Vec<CallRequest>>,
}

impl RecordingTransport {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CallRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn execute(&self, request: &CallRequest) -> Result<CallResponse, TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(CallResponse::new(self.status, self.body.clone()))
    }
}

pub fn caller_answering(transport: Arc<dyn Transport>) -> ResilientCaller {
    let clock = Arc::new(ManualClock::starting_at(0));
    let gate = RateGate::in_memory(
        RateGateConfig {
            min_interval: Duration::ZERO,
            ..Default::default()
        },
        clock.clone(),
    );
    ResilientCaller::new(transport, Arc::new(gate), clock, RetryPolicy::default())
}

/// Run context over an in-memory store. Each task body may sleep on the
/// returned clock to simulate work.
pub fn test_context(budget: BudgetConfig) -> (RunContext, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_at(1_700_000_000_000));
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let caller = caller_answering(Arc::new(RecordingTransport::new(200, "{}")));
    let ctx = RunContext::new("test", store, Arc::new(caller), clock.clone(), budget);
    (ctx, clock)
}

/// Replies with scripted texts in order and records every prompt. A reply
/// starting with `!` is turned into a task error.
pub struct ScriptedText {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    clock: Option<(Arc<ManualClock>, Duration)>,
}

impl ScriptedText {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
            clock: None,
        }
    }

    /// Advance `clock` by `cost` on every call.
    pub fn taking(mut self, clock: Arc<ManualClock>, cost: Duration) -> Self {
        self.clock = Some((clock, cost));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl TextGenerator for ScriptedText {
    fn generate(&self, _caller: &ResilientCaller, prompt: &str) -> Result<String, TaskError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some((clock, cost)) = &self.clock {
            lib_batch::Clock::sleep(clock.as_ref(), *cost);
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TaskError::Other(anyhow!("no scripted reply left")))?;
        match reply.strip_prefix('!') {
            Some(message) => Err(TaskError::Other(anyhow!("{message}"))),
            None => Ok(reply),
        }
    }
}

/// Always returns the same base64 payload.
pub struct FixedImage(pub String);

impl ImageGenerator for FixedImage {
    fn generate_png(&self, _caller: &ResilientCaller, _prompt: &str) -> Result<String, TaskError> {
        Ok(self.0.clone())
    }
}

/// Records every prompt and answers with a small base64 payload.
#[derive(Default)]
pub struct RecordingImage {
    prompts: Mutex<Vec<String>>,
}

impl RecordingImage {
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl ImageGenerator for RecordingImage {
    fn generate_png(&self, _caller: &ResilientCaller, prompt: &str) -> Result<String, TaskError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(STANDARD.encode(b"\x89PNG\r\n\x1a\n"))
    }
}
