//! A small flow-chain engine: ordered steps with optional rollback.
//!
//! A chain runs its flows strictly in order against a shared context. The
//! first failure triggers rollback in reverse order, one flow at a time,
//! starting with the failing flow itself (a flow may leave partial state
//! behind when it fails, so its own rollback is part of the unwind) and then
//! the already-completed reversible flows; the original error is returned to
//! the caller. Rollback is best effort: a rollback that itself fails is
//! logged and unwinding continues with the flow before it.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type StepFn<C, E> = Box<dyn Fn(Arc<Mutex<C>>) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// A named unit of work. Flows without a rollback are irreversible and are
/// skipped while the chain unwinds.
pub struct Flow<C, E> {
    name: String,
    run: StepFn<C, E>,
    rollback: Option<StepFn<C, E>>,
}

impl<C, E> Flow<C, E> {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(Arc<Mutex<C>>) -> BoxFuture<'static, Result<(), E>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
            rollback: None,
        }
    }

    /// Attach a rollback action, making this flow reversible. The rollback
    /// runs once the forward action has been attempted, whether or not it
    /// succeeded; it must tolerate the forward action having failed partway.
    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: Fn(Arc<Mutex<C>>) -> BoxFuture<'static, Result<(), E>> + Send + Sync + 'static,
    {
        self.rollback = Some(Box::new(rollback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reversible(&self) -> bool {
        self.rollback.is_some()
    }
}

/// An ordered list of flows sharing one context. Each execution gets its own
/// context instance; nothing is stored in process-wide state.
pub struct FlowChain<C, E> {
    name: String,
    flows: Vec<Flow<C, E>>,
}

impl<C, E> FlowChain<C, E>
where
    C: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flows: Vec::new(),
        }
    }

    pub fn then(mut self, flow: Flow<C, E>) -> Self {
        self.flows.push(flow);
        self
    }

    /// Drive the chain to a single terminal outcome: `Ok(())` once every flow
    /// has completed, or the first error after rollback of whatever had been
    /// attempted.
    pub async fn run(self, ctx: Arc<Mutex<C>>) -> Result<(), E> {
        let mut attempted: Vec<&Flow<C, E>> = Vec::new();
        for flow in &self.flows {
            debug!(chain = %self.name, flow = %flow.name, "running flow");
            attempted.push(flow);
            match (flow.run)(ctx.clone()).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(
                        chain = %self.name,
                        flow = %flow.name,
                        error = %err,
                        attempted = attempted.len(),
                        "flow failed, rolling back"
                    );
                    for done in attempted.iter().rev() {
                        let Some(rollback) = &done.rollback else {
                            continue;
                        };
                        debug!(chain = %self.name, flow = %done.name, "rolling back flow");
                        if let Err(rollback_err) = rollback(ctx.clone()).await {
                            warn!(
                                chain = %self.name,
                                flow = %done.name,
                                error = %rollback_err,
                                "rollback failed, continuing to unwind"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}
