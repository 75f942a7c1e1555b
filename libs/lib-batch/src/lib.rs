//! Checkpointed batch execution for long-running generative-AI pipelines.
//!
//! Work is split into persisted tasks, run one at a time until the
//! invocation's time budget runs out, and resumed by the next invocation.
//! Every outbound call goes through a shared rate gate and a retrying caller.

pub mod budget;
pub mod caller;
pub mod clock;
pub mod context;
pub mod error;
pub mod finalizer;
pub mod invocation;
pub mod rate_gate;
pub mod runner;
pub mod store;
pub mod task;

pub use budget::{Budget, BudgetConfig};
pub use caller::{CallRequest, CallResponse, ReqwestTransport, ResilientCaller, RetryPolicy, Transport};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use context::RunContext;
pub use error::{BatchError, CallError, LedgerError, StoreError, TaskError, TransportError};
pub use finalizer::{
    dedup_first_by, Aggregator, Completion, Finalizer, JsonFileSink, MemorySink, NoopTrigger, OutputSink, Trigger,
};
pub use invocation::{invoke, InvocationReport};
pub use rate_gate::{RateGate, RateGateConfig};
pub use runner::{BatchRunner, RunReport, StopReason, TaskBody, TaskContext};
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskStore};
pub use task::{Claim, NewTask, StatusCounts, StatusKind, Task, TaskStatus};
