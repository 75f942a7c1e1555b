//! One scheduled invocation: run what fits, then finalize if done.

use crate::context::RunContext;
use crate::error::BatchError;
use crate::finalizer::{Aggregator, Completion, Finalizer, OutputSink, Trigger};
use crate::runner::{BatchRunner, RunReport, TaskBody};

#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub run: RunReport,
    pub completion: Completion,
}

pub fn invoke<B, A>(
    ctx: &RunContext,
    body: &mut B,
    aggregator: &mut A,
    sink: &dyn OutputSink<A::Output>,
    trigger: &dyn Trigger,
) -> Result<InvocationReport, BatchError>
where
    B: TaskBody,
    A: Aggregator,
{
    let run = BatchRunner::new(ctx).run(body)?;
    let completion = Finalizer::new(ctx.store.as_ref(), trigger).finalize(aggregator, sink)?;
    Ok(InvocationReport { run, completion })
}
